//! Process-local notification surface.
//!
//! The supervisor reports sweep results and faults through an [`EventEmitter`]:
//! an explicit observer registry with `on(kind, handler)` registration and
//! synchronous dispatch, deliberately not tied to any runtime's event
//! machinery. Count-carrying events are elided when the count is zero.

use crate::error::MillstoneError;
use crate::stats::StateSnapshot;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Discriminant used to register handlers for one event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    Expired,
    Archived,
    Deleted,
    MonitorStates,
}

/// An event emitted by the supervisor (or any other component holding the
/// emitter).
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A store or handler fault; the owning loop keeps running.
    Error(Arc<MillstoneError>),
    /// Jobs transitioned out of `active` by the expire sweep.
    Expired(u64),
    /// Rows moved to the archive table by the archive sweep.
    Archived(u64),
    /// Archive rows deleted by the purge sweep.
    Deleted(u64),
    /// Periodic state snapshot from the monitor loop.
    MonitorStates(StateSnapshot),
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::Error(_) => EventKind::Error,
            QueueEvent::Expired(_) => EventKind::Expired,
            QueueEvent::Archived(_) => EventKind::Archived,
            QueueEvent::Deleted(_) => EventKind::Deleted,
            QueueEvent::MonitorStates(_) => EventKind::MonitorStates,
        }
    }

    fn count(&self) -> Option<u64> {
        match self {
            QueueEvent::Expired(n) | QueueEvent::Archived(n) | QueueEvent::Deleted(n) => Some(*n),
            _ => None,
        }
    }
}

type Handler = Box<dyn Fn(&QueueEvent) + Send + Sync>;

/// Observer registry for [`QueueEvent`]s.
///
/// # Examples
///
/// ```rust
/// use millstone::{EventEmitter, EventKind, QueueEvent};
///
/// let emitter = EventEmitter::new();
/// emitter.on(EventKind::Archived, |event| {
///     if let QueueEvent::Archived(count) = event {
///         println!("archived {count} jobs");
///     }
/// });
/// emitter.emit(QueueEvent::Archived(3));
/// ```
#[derive(Default)]
pub struct EventEmitter {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Handlers run synchronously on
    /// the emitting task and must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn emit(&self, event: QueueEvent) {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(registered) = handlers.get(&event.kind()) {
            for handler in registered {
                handler(&event);
            }
        }
    }

    /// Emit a count-carrying event unless its count is zero.
    pub fn emit_if_positive(&self, event: QueueEvent) {
        if event.count() != Some(0) {
            self.emit(event);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_handlers_receive_matching_kind_only() {
        let emitter = EventEmitter::new();
        let archived = Arc::new(AtomicU64::new(0));
        let expired = Arc::new(AtomicU64::new(0));

        let a = archived.clone();
        emitter.on(EventKind::Archived, move |event| {
            if let QueueEvent::Archived(n) = event {
                a.fetch_add(*n, Ordering::SeqCst);
            }
        });
        let e = expired.clone();
        emitter.on(EventKind::Expired, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(QueueEvent::Archived(5));
        emitter.emit(QueueEvent::Archived(2));
        assert_eq!(archived.load(Ordering::SeqCst), 7);
        assert_eq!(expired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_counts_are_suppressed() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        emitter.on(EventKind::Deleted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit_if_positive(QueueEvent::Deleted(0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        emitter.emit_if_positive(QueueEvent::Deleted(4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_monitor_states_not_count_suppressed() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        emitter.on(EventKind::MonitorStates, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // An all-zero snapshot still fires; suppression applies to counts only.
        emitter.emit_if_positive(QueueEvent::MonitorStates(StateSnapshot::default()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_handlers_same_kind() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let c = calls.clone();
            emitter.on(EventKind::Error, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        let err = MillstoneError::Supervisor {
            message: "tick failed".into(),
        };
        emitter.emit(QueueEvent::Error(Arc::new(err)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
