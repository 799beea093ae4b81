// Typed event emitter shared by the engine components.
//
// Listeners are plain closures registered against a typed event value. A
// panicking listener is isolated and logged; it never corrupts the emitting
// component's loop.

use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventEmitter<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener and return its id for later removal.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Invoke every listener synchronously. Listener panics are caught and
    /// logged so one faulty observer cannot take down the emitter.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("event listener panicked; removing is up to the subscriber");
            }
        }
    }
}

/// Why a quality switch happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    Initial,
    Manual,
    Abr,
}

impl SwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchReason::Initial => "initial",
            SwitchReason::Manual => "manual",
            SwitchReason::Abr => "abr",
        }
    }
}

/// Buffer fill classification produced by the buffer monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLevel {
    Critical,
    Low,
    Normal,
    High,
}

/// Engine-level events surfaced to the embedder.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Ready {
        stream_id: String,
        quality_id: String,
    },
    QualityChanged {
        from: Option<String>,
        to: String,
        reason: SwitchReason,
    },
    SegmentAppended {
        quality_id: String,
        segment_id: String,
        index: usize,
    },
    BufferLevel {
        level: BufferLevel,
        buffered_ahead: f64,
    },
    PrefetchComplete {
        count: usize,
        quality_id: String,
    },
    PeerConnected {
        peer_id: String,
    },
    PeerDisconnected {
        peer_id: String,
        reason: String,
    },
    Error {
        message: String,
        fatal: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_to_all_listeners() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            emitter.subscribe(move |v| {
                hits.fetch_add(*v as usize, Ordering::Relaxed);
            });
        }
        emitter.emit(&2);
        assert_eq!(hits.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = emitter.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(&1);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn panicking_listener_does_not_poison_others() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.subscribe(|_| panic!("bad listener"));
        let hits_clone = Arc::clone(&hits);
        emitter.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });
        emitter.emit(&1);
        emitter.emit(&1);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}
