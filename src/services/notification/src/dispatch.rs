//! In-process event bus
//!
//! Subscribers register against an [`EventKind`]. `publish` runs every
//! matching handler to completion before returning; `publish_async` spawns
//! one task per handler and returns immediately, unless testing mode is on,
//! in which case it behaves like `publish`. Handler errors are logged and
//! never reach the publisher.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telehealth_shared::{DomainEvent, EventKind};
use tracing::{debug, warn};

static TESTING: AtomicBool = AtomicBool::new(false);

/// Force every bus in the process to run asynchronous publishes inline.
pub fn set_testing(enabled: bool) {
    TESTING.store(enabled, Ordering::SeqCst);
}

pub fn is_testing() -> bool {
    TESTING.load(Ordering::SeqCst)
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<()>;

    /// Name used in log lines
    fn name(&self) -> &str {
        "handler"
    }
}

pub struct Dispatcher {
    handlers: DashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    synchronous: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            synchronous: false,
        }
    }

    /// A bus whose asynchronous publishes always run inline, independent of
    /// the process-wide flag.
    pub fn synchronous() -> Self {
        Self {
            handlers: DashMap::new(),
            synchronous: true,
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        debug!(kind = %kind, handler = handler.name(), "Subscribing handler");
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|h| h.len()).unwrap_or(0)
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .get(&kind)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Run every handler for the event in registration order.
    pub async fn publish(&self, event: &DomainEvent) {
        for handler in self.handlers_for(event.kind()) {
            run_handler(handler.as_ref(), event).await;
        }
    }

    /// Spawn one task per handler and return without waiting.
    pub async fn publish_async(&self, event: DomainEvent) {
        if self.synchronous || is_testing() {
            self.publish(&event).await;
            return;
        }

        let handlers = self.handlers_for(event.kind());
        if handlers.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                run_handler(handler.as_ref(), &event).await;
            });
        }
    }
}

async fn run_handler(handler: &dyn EventHandler, event: &DomainEvent) {
    if let Err(e) = handler.handle(event).await {
        warn!(
            kind = %event.kind(),
            handler = handler.name(),
            error = %e,
            "Event handler failed"
        );
    }
}

/// Handler that keeps every event it sees. Used by the admin tool to report
/// deliveries and by tests to observe the bus.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<DomainEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use telehealth_shared::events::CaseAssigned;

    fn case_assigned() -> DomainEvent {
        DomainEvent::CaseAssigned(CaseAssigned {
            case_id: 1,
            doctor_id: 2,
        })
    }

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &DomainEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(NotificationError::internal("boom"))
        }
    }

    // -------------------------------------------------------------------------
    // publish
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_publish_reaches_only_matching_kind() {
        let bus = Dispatcher::new();
        let recorder = Recorder::new();
        bus.subscribe(EventKind::CaseAssigned, recorder.clone());
        bus.subscribe(EventKind::VisitSubmitted, Recorder::new());

        bus.publish(&case_assigned()).await;

        assert_eq!(recorder.events(), vec![case_assigned()]);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_other_handlers() {
        let bus = Dispatcher::new();
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let recorder = Recorder::new();
        bus.subscribe(EventKind::CaseAssigned, failing.clone());
        bus.subscribe(EventKind::CaseAssigned, recorder.clone());

        bus.publish(&case_assigned()).await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.len(), 1);
    }

    // -------------------------------------------------------------------------
    // publish_async
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_synchronous_bus_runs_async_publish_inline() {
        let bus = Dispatcher::synchronous();
        let recorder = Recorder::new();
        bus.subscribe(EventKind::CaseAssigned, recorder.clone());

        bus.publish_async(case_assigned()).await;

        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_testing_flag_runs_async_publish_inline() {
        set_testing(true);
        let bus = Dispatcher::new();
        let recorder = Recorder::new();
        bus.subscribe(EventKind::CaseAssigned, recorder.clone());

        bus.publish_async(case_assigned()).await;
        let seen = recorder.events();
        set_testing(false);

        assert_eq!(seen, vec![case_assigned()]);
        assert!(!is_testing());
    }

    #[tokio::test]
    #[serial]
    async fn test_async_publish_spawns_handlers() {
        let bus = Dispatcher::new();
        let recorder = Recorder::new();
        bus.subscribe(EventKind::CaseAssigned, recorder.clone());

        bus.publish_async(case_assigned()).await;

        for _ in 0..50 {
            if !recorder.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = Dispatcher::new();
        bus.publish_async(case_assigned()).await;
        assert_eq!(bus.handler_count(EventKind::CaseAssigned), 0);
    }
}
