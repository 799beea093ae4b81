// The ordered append queue: priority-sorted intake, strictly sequential
// drain. The head handed to the sink is always the request whose playlist
// index equals the next expected index, so appends stay monotonic within a
// quality even when fetches complete out of order.

use crate::media::SegmentDescriptor;
use bytes::Bytes;
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug)]
pub struct AppendRequest {
    pub segment: SegmentDescriptor,
    pub data: Bytes,
    pub priority: i32,
    pub for_seek: bool,
    /// Position of the segment in the current variant's sequence.
    pub index: usize,
    enqueued_at: Instant,
    seq: u64,
}

impl AppendRequest {
    pub fn age(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }
}

#[derive(Debug, Default)]
pub struct AppendQueue {
    /// Sorted on demand: priority descending, then enqueue order.
    items: Vec<AppendRequest>,
    /// `qualityId:segmentId` keys already handed to the sink.
    appended: HashSet<String>,
    next_expected: Option<usize>,
    next_seq: u64,
}

impl AppendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn next_expected(&self) -> Option<usize> {
        self.next_expected
    }

    /// Point the sequence at a specific index (seek, quality switch, cold
    /// start).
    pub fn reseat(&mut self, index: usize) {
        self.next_expected = Some(index);
    }

    pub fn is_appended(&self, key: &str) -> bool {
        self.appended.contains(key)
    }

    pub fn appended_count(&self) -> usize {
        self.appended.len()
    }

    /// Record a successful append and advance the expected index past it.
    pub fn mark_appended(&mut self, key: String, index: usize) {
        self.appended.insert(key);
        self.next_expected = Some(index + 1);
    }

    /// Drop appended-set entries the predicate rejects. Lets distant
    /// history be re-fetched after a long seek back.
    pub fn retain_appended(&mut self, keep: impl Fn(&str) -> bool) {
        self.appended.retain(|key| keep(key));
    }

    /// Enqueue a fetched segment. Duplicates of already-appended segments
    /// are dropped.
    pub fn push(
        &mut self,
        segment: SegmentDescriptor,
        data: Bytes,
        priority: i32,
        for_seek: bool,
        index: usize,
    ) -> bool {
        let key = segment.key().to_string();
        if self.appended.contains(&key) {
            return false;
        }
        if self.items.iter().any(|r| r.index == index && r.segment.key() == segment.key()) {
            return false;
        }
        self.items.push(AppendRequest {
            segment,
            data,
            priority,
            for_seek,
            index,
            enqueued_at: Instant::now(),
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    /// Drop every queued request (seek, quality switch).
    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn sort(&mut self) {
        self.items
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    fn take_at(&mut self, pos: usize) -> AppendRequest {
        self.items.remove(pos)
    }

    /// Select the next request to append, honoring the sequence contract:
    ///
    /// 1. The highest-priority request at the expected index wins.
    /// 2. Otherwise a seek-tagged request reseats the sequence to itself.
    /// 3. Otherwise, with an empty buffer and nothing ever appended, the
    ///    lowest queued index reseats the sequence (cold start).
    /// 4. Otherwise nothing is taken; a later enqueue retriggers the drain.
    pub fn take_next(&mut self, buffer_empty: bool) -> Option<AppendRequest> {
        if self.items.is_empty() {
            return None;
        }
        self.sort();

        match self.next_expected {
            Some(expected) => {
                if let Some(pos) = self.items.iter().position(|r| r.index == expected) {
                    return Some(self.take_at(pos));
                }
                if let Some(pos) = self.items.iter().position(|r| r.for_seek) {
                    let request = self.take_at(pos);
                    self.next_expected = Some(request.index);
                    return Some(request);
                }
                if buffer_empty && self.appended.is_empty() {
                    let pos = self
                        .items
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, r)| r.index)
                        .map(|(i, _)| i)?;
                    let request = self.take_at(pos);
                    self.next_expected = Some(request.index);
                    return Some(request);
                }
                None
            }
            None => {
                let pos = self
                    .items
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| r.index)
                    .map(|(i, _)| i)?;
                let request = self.take_at(pos);
                self.next_expected = Some(request.index);
                Some(request)
            }
        }
    }
}
