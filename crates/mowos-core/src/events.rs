//! Typed event system.
//!
//! Two delivery paths share one [`Event`] stream:
//!
//! - **Broadcast**: [`EventBus::subscribe`] hands out a
//!   `tokio::sync::broadcast` receiver of `Arc<Event>` — the transport
//!   layer's push feed.
//! - **Handlers**: [`EventBus::register`] attaches a named async handler
//!   to one [`EventKind`]. Handlers run on their own tasks, so a failing
//!   or slow handler never blocks the trigger caller or its peers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use mowos_types::{MowerState, Severity};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An event emitted by the coordinator.
///
/// Every variant carries enough context for subscribers to filter and
/// dispatch without parsing opaque blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A sensor reading was durably stored.
    ReadingStored {
        sensor_id: String,
        sensor_type: String,
        quality: f64,
        timestamp: DateTime<Utc>,
    },

    /// The state machine accepted a transition.
    StateChanged {
        state: MowerState,
        timestamp: DateTime<Utc>,
    },

    /// An emergency stop was forced.
    EmergencyStop {
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A configuration entry was written.
    ConfigChanged {
        section: String,
        key: String,
        version: i64,
        timestamp: DateTime<Utc>,
    },

    /// Analytics flagged an anomalous sensor value.
    AnomalyDetected {
        sensor_id: String,
        value: f64,
        mean: f64,
        timestamp: DateTime<Utc>,
    },

    /// Analytics flagged a quality-degradation episode.
    QualityDegraded {
        sensor_id: String,
        mean_quality: f64,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },

    /// Analytics predicts a component needs maintenance.
    MaintenanceDue {
        component: String,
        maintenance_type: String,
        urgency: Severity,
        timestamp: DateTime<Utc>,
    },

    /// Generic system-level event (startup, shutdown, loop failures).
    SystemEvent { kind: String, message: String },
}

/// Discriminant of [`Event`], used as the handler registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ReadingStored,
    StateChanged,
    EmergencyStop,
    ConfigChanged,
    AnomalyDetected,
    QualityDegraded,
    MaintenanceDue,
    SystemEvent,
}

impl Event {
    /// The kind used for handler dispatch.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ReadingStored { .. } => EventKind::ReadingStored,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::EmergencyStop { .. } => EventKind::EmergencyStop,
            Self::ConfigChanged { .. } => EventKind::ConfigChanged,
            Self::AnomalyDetected { .. } => EventKind::AnomalyDetected,
            Self::QualityDegraded { .. } => EventKind::QualityDegraded,
            Self::MaintenanceDue { .. } => EventKind::MaintenanceDue,
            Self::SystemEvent { .. } => EventKind::SystemEvent,
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// An async event handler. Errors are logged, never propagated.
pub type EventHandler =
    Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct NamedHandler {
    name: String,
    handler: EventHandler,
}

/// Broadcast + handler dispatch for coordinator events.
///
/// Cheaply cloneable; clones share subscribers and registered handlers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Event>>,
    handlers: Arc<DashMap<EventKind, Vec<NamedHandler>>>,
}

impl EventBus {
    /// Create a bus with the given broadcast capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }

    /// Register a named handler for one event kind.
    pub fn register(&self, kind: EventKind, name: impl Into<String>, handler: EventHandler) {
        let name = name.into();
        trace!(?kind, handler = %name, "event handler registered");
        self.handlers
            .entry(kind)
            .or_default()
            .push(NamedHandler { name, handler });
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|h| h.len()).unwrap_or(0)
    }

    /// Publish an event to subscribers and dispatch registered handlers.
    ///
    /// Each handler runs on its own task: a panicking or erroring handler
    /// is logged and cannot block its peers or this caller. Returns the
    /// number of broadcast receivers that will observe the event.
    pub fn trigger(&self, event: Event) -> usize {
        let kind = event.kind();
        let event = Arc::new(event);

        let receivers = match self.sender.send(Arc::clone(&event)) {
            Ok(n) => n,
            Err(_) => {
                // No active receivers — common during startup/shutdown.
                trace!(?kind, "event published with no active subscribers");
                0
            }
        };

        if let Some(handlers) = self.handlers.get(&kind) {
            for named in handlers.iter() {
                let handler = Arc::clone(&named.handler);
                let name = named.name.clone();
                let event = Arc::clone(&event);
                tokio::spawn(async move {
                    if let Err(err) = handler(event).await {
                        warn!(handler = %name, %err, "event handler failed");
                    }
                });
            }
        }

        receivers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn system_event(message: &str) -> Event {
        Event::SystemEvent {
            kind: "test".into(),
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus.trigger(system_event("hello"));
        assert_eq!(receivers, 1);

        let received = rx.recv().await.unwrap();
        match received.as_ref() {
            Event::SystemEvent { message, .. } => assert_eq!(message, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn trigger_without_subscribers_is_ok() {
        let bus = EventBus::new(16);
        assert_eq!(bus.trigger(system_event("lonely")), 0);
    }

    #[tokio::test]
    async fn handlers_fire_for_their_kind_only() {
        let bus = EventBus::new(16);
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        bus.register(
            EventKind::EmergencyStop,
            "counter",
            Arc::new(move |_| {
                let c = Arc::clone(&c);
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        bus.trigger(system_event("not for the handler"));
        bus.trigger(Event::EmergencyStop {
            reason: "test".into(),
            timestamp: Utc::now(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_its_peers() {
        let bus = EventBus::new(16);
        let healthy_calls = Arc::new(AtomicU32::new(0));

        bus.register(
            EventKind::SystemEvent,
            "erroring",
            Arc::new(|_| Box::pin(async { Err("boom".to_string()) })),
        );
        bus.register(
            EventKind::SystemEvent,
            "panicking",
            Arc::new(|_| {
                Box::pin(async {
                    panic!("handler panic");
                })
            }),
        );
        let c = Arc::clone(&healthy_calls);
        bus.register(
            EventKind::SystemEvent,
            "healthy",
            Arc::new(move |_| {
                let c = Arc::clone(&c);
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        // The trigger call itself returns immediately and the healthy
        // handler still runs.
        bus.trigger(system_event("mixed handlers"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_count_tracks_registration() {
        let bus = EventBus::new(16);
        assert_eq!(bus.handler_count(EventKind::StateChanged), 0);
        bus.register(
            EventKind::StateChanged,
            "h1",
            Arc::new(|_| Box::pin(async { Ok(()) })),
        );
        assert_eq!(bus.handler_count(EventKind::StateChanged), 1);
    }

    #[test]
    fn event_kinds_match_variants() {
        assert_eq!(
            Event::EmergencyStop {
                reason: "r".into(),
                timestamp: Utc::now()
            }
            .kind(),
            EventKind::EmergencyStop
        );
        assert_eq!(
            system_event("m").kind(),
            EventKind::SystemEvent
        );
    }
}
