//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never fails a
//! reconcile pass.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Event reasons shown in `kubectl get events`
pub mod reasons {
    pub const CREATED: &str = "Created";
    pub const PATCHED: &str = "Patched";
    pub const FAILED_TO_CREATE: &str = "FailedToCreate";
    pub const FAILED_TO_DELETE: &str = "FailedToDelete";
    pub const FAILED_TO_PAUSE: &str = "FailedToPause";
    pub const PAUSED: &str = "Paused";
    pub const WIPED_OUT: &str = "WipedOut";
    pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str);
}

/// Publishes through `kube::runtime::events::Recorder`
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory for assertions
#[derive(Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemoryEventSink {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        let recorded = RecordedEvent {
            object: format!(
                "{}/{}",
                object.namespace.as_deref().unwrap_or_default(),
                object.name.as_deref().unwrap_or_default()
            ),
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(recorded);
        }
    }
}
