//! Stack notifications
//!
//! A `NotificationCenter` is a cloneable broadcast channel shared by whoever
//! wants to hear about stack lifecycle events. Delivery is fire-and-forget:
//! only receivers subscribed at the time of posting see a notification, so
//! subscribe before constructing the stack you want to observe.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::InitError;

/// Topic posted when a stack becomes ready
pub const TOPIC_INITIALIZED: &str = "stack.initialized";

/// Topic posted when a stack fails to initialize
pub const TOPIC_INITIALIZATION_FAILED: &str = "stack.initialization.failed";

const DEFAULT_CAPACITY: usize = 64;

/// A lifecycle event for one stack
#[derive(Debug, Clone)]
pub enum Notification {
    Initialized {
        stack: Uuid,
        model: String,
        preexisting: bool,
    },
    InitializationFailed {
        stack: Uuid,
        model: String,
        error: Arc<InitError>,
    },
}

impl Notification {
    pub fn topic(&self) -> &'static str {
        match self {
            Notification::Initialized { .. } => TOPIC_INITIALIZED,
            Notification::InitializationFailed { .. } => TOPIC_INITIALIZATION_FAILED,
        }
    }

    /// Id of the stack that posted this notification
    pub fn stack(&self) -> Uuid {
        match self {
            Notification::Initialized { stack, .. }
            | Notification::InitializationFailed { stack, .. } => *stack,
        }
    }
}

/// Broadcast channel for stack notifications
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a center that buffers up to `capacity` notifications per slow receiver
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Post to every current subscriber; returns how many there were
    pub fn post(&self, notification: Notification) -> usize {
        // No subscribers is fine
        self.sender.send(notification).unwrap_or(0)
    }
}
