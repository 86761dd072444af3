use std::fmt;
use std::sync::Arc;

use cadence_protocol::{EventEnvelope, EventType};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Failure reported by a hook. Either kind stops dispatch and is surfaced to
/// the publisher.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook aborted execution: {reason}")]
    Abort { reason: String },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HookError {
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }
}

/// Synchronous observer of published events.
pub trait Hook: Send + Sync {
    fn on_event(&self, event: &EventEnvelope) -> Result<(), HookError>;
}

impl<F> Hook for F
where
    F: Fn(&EventEnvelope) -> Result<(), HookError> + Send + Sync,
{
    fn on_event(&self, event: &EventEnvelope) -> Result<(), HookError> {
        self(event)
    }
}

/// Wrap a closure as a shareable hook.
pub fn hook_fn<F>(f: F) -> Arc<dyn Hook>
where
    F: Fn(&EventEnvelope) -> Result<(), HookError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Append-only event log owned by one context node.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<EventEnvelope>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next sequence number and appends. Returns the stored
    /// envelope.
    pub fn append(&self, mut envelope: EventEnvelope) -> EventEnvelope {
        let mut events = self.events.lock();
        envelope.sequence = events.len() as u64 + 1;
        events.push(envelope.clone());
        envelope
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type() == event_type)
            .count()
    }
}

/// Hooks keyed by event type, invoked in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<IndexMap<EventType, Vec<Arc<dyn Hook>>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        let counts: Vec<_> = hooks
            .iter()
            .map(|(event_type, hooks)| (event_type.as_str(), hooks.len()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_type: EventType, hook: Arc<dyn Hook>) {
        self.hooks.write().entry(event_type).or_default().push(hook);
    }

    /// Register one hook for every event type.
    pub fn register_all(&self, hook: Arc<dyn Hook>) {
        let mut hooks = self.hooks.write();
        for event_type in EventType::ALL {
            hooks.entry(event_type).or_default().push(hook.clone());
        }
    }

    pub fn len(&self, event_type: EventType) -> usize {
        self.hooks.read().get(&event_type).map_or(0, Vec::len)
    }

    /// Run every hook registered for the envelope's type, stopping at the
    /// first failure. The registry lock is not held while hooks run.
    pub fn dispatch(&self, envelope: &EventEnvelope) -> Result<(), HookError> {
        let hooks = match self.hooks.read().get(&envelope.event_type()) {
            Some(hooks) => hooks.clone(),
            None => return Ok(()),
        };
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(error) = hook.on_event(envelope) {
                warn!(
                    event_type = %envelope.event_type(),
                    hook_index = index,
                    error = %error,
                    "hook failed"
                );
                return Err(error);
            }
        }
        Ok(())
    }
}

/// Broadcast fan-out of a context's events to live subscribers.
///
/// Closing the hub drops the sender; every subscriber then observes the end
/// of the stream once it has drained buffered events.
#[derive(Debug)]
pub struct EventStreamHub {
    sender: Mutex<Option<broadcast::Sender<EventEnvelope>>>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn publish(&self, event: EventEnvelope) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // No receivers is not an error.
            let _ = sender.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => closed_receiver(),
        }
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<EventEnvelope> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Returns whether this call closed the hub.
    pub fn close(&self) -> bool {
        let closed = self.sender.lock().take().is_some();
        if closed {
            debug!("event stream closed");
        }
        closed
    }
}

impl Default for EventStreamHub {
    fn default() -> Self {
        Self::new(256)
    }
}

fn closed_receiver() -> broadcast::Receiver<EventEnvelope> {
    let (sender, receiver) = broadcast::channel(1);
    drop(sender);
    receiver
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cadence_protocol::{ContextId, EventKind};
    use futures_util::StreamExt;

    use super::*;

    fn envelope(kind: EventKind) -> EventEnvelope {
        EventEnvelope::new(ContextId::from_string("ctx"), 1, 0, kind)
    }

    #[test]
    fn log_assigns_sequences_in_append_order() {
        let log = EventLog::new();
        let first = log.append(envelope(EventKind::BeforeIteration));
        let second = log.append(envelope(EventKind::AfterIteration {
            action: None,
            finished: false,
            result: None,
            duration_ms: 0,
            error: None,
        }));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.count(EventType::BeforeIteration), 1);
        assert_eq!(log.of_type(EventType::AfterIteration)[0].sequence, 2);
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            registry.register(
                EventType::BeforeIteration,
                hook_fn(move |_| {
                    order.lock().push(label);
                    Ok(())
                }),
            );
        }

        registry
            .dispatch(&envelope(EventKind::BeforeIteration))
            .unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_hook_stops_dispatch_and_surfaces_error() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            EventType::BeforeIteration,
            hook_fn(|_| Err(HookError::abort("budget review"))),
        );
        let counter = calls.clone();
        registry.register(
            EventType::BeforeIteration,
            hook_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let error = registry
            .dispatch(&envelope(EventKind::BeforeIteration))
            .unwrap_err();
        assert!(matches!(error, HookError::Abort { ref reason } if reason == "budget review"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hooks_only_see_their_event_type() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            EventType::Compaction,
            hook_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        registry
            .dispatch(&envelope(EventKind::BeforeIteration))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(EventType::Compaction), 1);
    }

    #[tokio::test]
    async fn closing_hub_ends_subscriber_streams() {
        let hub = EventStreamHub::new(8);
        let mut stream = hub.subscribe_stream();
        hub.publish(envelope(EventKind::BeforeIteration));
        assert!(hub.close());
        assert!(!hub.close());

        let first = stream.next().await.expect("buffered event").unwrap();
        assert_eq!(first.event_type(), EventType::BeforeIteration);
        assert!(stream.next().await.is_none());

        let mut late = hub.subscribe();
        assert!(late.recv().await.is_err());
    }
}
