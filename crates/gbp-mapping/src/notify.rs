//! Notification sinks for provisioned resources
//!
//! Delivery is best effort: the gateway logs a failed delivery and carries
//! on.

use gbp_common::ResourceEvent;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("no subscribers")]
    NoSubscribers,
}

/// Receiver of resource notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &ResourceEvent) -> Result<(), NotifyError>;
}

/// Writes notifications to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, event: &ResourceEvent) -> Result<(), NotifyError> {
        info!(
            event_type = %event.event_type(),
            resource_id = %event.resource_id,
            tenant_id = event.tenant_id.as_deref().unwrap_or(""),
            "notification"
        );
        Ok(())
    }
}

/// Fans notifications out to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<ResourceEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, event: &ResourceEvent) -> Result<(), NotifyError> {
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }
}
