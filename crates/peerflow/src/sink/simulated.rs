// An in-memory media surface for tests and headless runs.
//
// Media payloads produced by [`annotated_segment`] carry a small header
// naming the interval they cover, so the simulated buffer tracks real
// range geometry. Payloads without the header (init segments) do not
// change buffered ranges.

use super::surface::{MediaSurface, SurfaceEvent};
use crate::error::{EngineError, Result};
use crate::media::TimeRange;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const SIM_MAGIC: &[u8; 4] = b"PFSG";

/// Build a media payload whose header declares the covered interval.
/// `payload_len` bytes of filler follow the header.
pub fn annotated_segment(start: f64, duration: f64, payload_len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + payload_len);
    buf.put_slice(SIM_MAGIC);
    buf.put_u32((start * 1000.0).round() as u32);
    buf.put_u32((duration * 1000.0).round() as u32);
    buf.put_bytes(0xAB, payload_len);
    buf.freeze()
}

fn parse_annotation(data: &[u8]) -> Option<TimeRange> {
    if data.len() < 12 || &data[..4] != SIM_MAGIC {
        return None;
    }
    let start = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as f64 / 1000.0;
    let duration = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as f64 / 1000.0;
    Some(TimeRange::new(start, start + duration))
}

/// Merge overlapping/adjacent ranges into a sorted minimal set.
fn normalize(mut ranges: Vec<TimeRange>) -> Vec<TimeRange> {
    const JOIN_EPSILON: f64 = 1e-6;
    ranges.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
    let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if range.duration() <= 0.0 {
            continue;
        }
        match merged.last_mut() {
            Some(last) if range.start <= last.end + JOIN_EPSILON => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

fn subtract(ranges: Vec<TimeRange>, start: f64, end: f64) -> Vec<TimeRange> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for range in ranges {
        if range.end <= start || range.start >= end {
            out.push(range);
            continue;
        }
        if range.start < start {
            out.push(TimeRange::new(range.start, start));
        }
        if range.end > end {
            out.push(TimeRange::new(end, range.end));
        }
    }
    normalize(out)
}

struct SimState {
    attached: Option<String>,
    ranges: Vec<TimeRange>,
    current_time: f64,
    duration: f64,
    ended: bool,
    appended_payloads: u64,
    init_appends: u64,
}

pub struct SimulatedSurface {
    state: Mutex<SimState>,
    events: broadcast::Sender<SurfaceEvent>,
    append_delay: Duration,
    updates_in_flight: AtomicU32,
    max_updates_in_flight: AtomicU32,
}

impl SimulatedSurface {
    /// `append_delay` models the source buffer's update latency.
    pub fn new(append_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(SimState {
                attached: None,
                ranges: Vec::new(),
                current_time: 0.0,
                duration: 0.0,
                ended: false,
                appended_payloads: 0,
                init_appends: 0,
            }),
            events,
            append_delay,
            updates_in_flight: AtomicU32::new(0),
            max_updates_in_flight: AtomicU32::new(0),
        }
    }

    /// Inject a media-element event (test control).
    pub fn emit(&self, event: SurfaceEvent) {
        let _ = self.events.send(event);
    }

    /// Move the playhead (test control).
    pub fn set_time(&self, time: f64) {
        self.state.lock().current_time = time;
    }

    /// Highest number of concurrently in-flight buffer updates observed;
    /// serial adapters keep this at one.
    pub fn max_concurrent_updates(&self) -> u32 {
        self.max_updates_in_flight.load(Ordering::SeqCst)
    }

    pub fn appended_payloads(&self) -> u64 {
        self.state.lock().appended_payloads
    }

    pub fn init_appends(&self) -> u64 {
        self.state.lock().init_appends
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    async fn simulate_update(&self) {
        let in_flight = self.updates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_updates_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if !self.append_delay.is_zero() {
            tokio::time::sleep(self.append_delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.updates_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.state.lock().attached.is_none() {
            return Err(EngineError::sink("media source not attached"));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSurface for SimulatedSurface {
    async fn attach(&self, mime: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.attached.is_some() {
            return Err(EngineError::sink("media source already attached"));
        }
        state.attached = Some(mime.to_string());
        Ok(())
    }

    async fn detach(&self) {
        let mut state = self.state.lock();
        state.attached = None;
        state.ranges.clear();
    }

    async fn set_duration(&self, seconds: f64) -> Result<()> {
        self.ensure_attached()?;
        self.state.lock().duration = seconds;
        Ok(())
    }

    async fn append_buffer(&self, data: Bytes) -> Result<()> {
        self.ensure_attached()?;
        self.simulate_update().await;
        let mut state = self.state.lock();
        match parse_annotation(&data) {
            Some(range) => {
                state.appended_payloads += 1;
                let mut ranges = std::mem::take(&mut state.ranges);
                ranges.push(range);
                state.ranges = normalize(ranges);
            }
            None => {
                state.init_appends += 1;
            }
        }
        Ok(())
    }

    async fn remove_range(&self, start: f64, end: f64) -> Result<()> {
        self.ensure_attached()?;
        self.simulate_update().await;
        let mut state = self.state.lock();
        let ranges = std::mem::take(&mut state.ranges);
        state.ranges = subtract(ranges, start, end);
        Ok(())
    }

    async fn end_of_stream(&self) -> Result<()> {
        self.ensure_attached()?;
        self.state.lock().ended = true;
        let _ = self.events.send(SurfaceEvent::Ended);
        Ok(())
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.state.lock().ranges.clone()
    }

    fn current_time(&self) -> f64 {
        self.state.lock().current_time
    }

    fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    async fn seek(&self, time: f64) -> Result<()> {
        self.ensure_attached()?;
        {
            let mut state = self.state.lock();
            state.current_time = time;
            state.ended = false;
        }
        let _ = self.events.send(SurfaceEvent::Seeking { time });
        let _ = self.events.send(SurfaceEvent::Seeked { time });
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        self.ensure_attached()?;
        let _ = self.events.send(SurfaceEvent::Play);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.ensure_attached()?;
        let _ = self.events.send(SurfaceEvent::Pause);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }
}
