pub mod bus;

pub use bus::{EventPublisher, EventSubscriber, EventTransport, MemoryTransport, RedisTransport};

use crate::registry::model::{ChangeEvent, EventKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Which snapshot an incoming event invalidates. Events are triggers only;
/// the receiver re-fetches the full authoritative state from the registry
/// and never applies the event's payload as a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshKind {
    Routes,
    RateLimits,
    AccessControl,
}

impl RefreshKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshKind::Routes => "routes",
            RefreshKind::RateLimits => "rate_limits",
            RefreshKind::AccessControl => "access_control",
        }
    }

    pub fn for_event(kind: EventKind) -> Self {
        match kind {
            EventKind::RouteChange => RefreshKind::Routes,
            // Health flips change route active flags, which live in the
            // route snapshot.
            EventKind::HealthChange => RefreshKind::Routes,
            EventKind::RateLimitChange => RefreshKind::RateLimits,
            EventKind::AccessControlChange => RefreshKind::AccessControl,
        }
    }
}

/// Per-kind publish debouncing. The first event of a kind opens a window;
/// events arriving within it are absorbed (affected ids unioned) and a
/// single coalesced event goes out when the window closes. Kinds never
/// absorb each other.
pub struct DebounceBuffer {
    window: Duration,
    pending: HashMap<EventKind, Pending>,
}

struct Pending {
    event: ChangeEvent,
    due_at: Instant,
}

impl DebounceBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn offer(&mut self, event: ChangeEvent, now: Instant) {
        match self.pending.get_mut(&event.kind) {
            Some(pending) => pending.event.absorb(&event),
            None => {
                let due_at = now + self.window;
                self.pending.insert(event.kind, Pending { event, due_at });
            }
        }
    }

    /// Drain every coalesced event whose window has closed.
    pub fn take_due(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let due_kinds: Vec<EventKind> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due_at <= now)
            .map(|(k, _)| *k)
            .collect();
        due_kinds
            .into_iter()
            .filter_map(|kind| self.pending.remove(&kind))
            .map(|p| p.event)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
