//! Messages flowing into the session loop

use std::fmt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::command::Command;

/// Link events raised by transport background tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The peer closed the link or the socket failed
    PeerLost { reason: String },
    /// The host sent HID_CONTROL VIRTUAL_CABLE_UNPLUG
    Unplugged,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::PeerLost { reason } => write!(f, "peer lost ({})", reason),
            LifecycleEvent::Unplugged => write!(f, "virtual cable unplugged"),
        }
    }
}

/// A lifecycle event tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub event: LifecycleEvent,
}

/// Result of handing one command to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// All reports were sent
    Executed { reports: usize },
    /// PING
    Pong,
    /// Dropped because no peer is connected
    NotConnected,
    /// Sending failed part-way; the session is reconnecting
    Failed(String),
}

/// Everything the session loop receives
#[derive(Debug)]
pub enum SessionMessage {
    Command {
        command: Command,
        reply: oneshot::Sender<CommandOutcome>,
    },
    Lifecycle(SessionEvent),
    Shutdown,
}

/// Handle given to a transport so its background tasks can report link loss
#[derive(Debug, Clone)]
pub struct LifecycleSender {
    session_id: Uuid,
    tx: mpsc::Sender<SessionMessage>,
}

impl LifecycleSender {
    pub fn new(session_id: Uuid, tx: mpsc::Sender<SessionMessage>) -> Self {
        Self { session_id, tx }
    }

    #[cfg(test)]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Returns false once the session loop is gone
    pub async fn send(&self, event: LifecycleEvent) -> bool {
        self.tx
            .send(SessionMessage::Lifecycle(SessionEvent {
                session_id: self.session_id,
                event,
            }))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_sender_tags_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let id = Uuid::new_v4();
        let sender = LifecycleSender::new(id, tx);

        assert!(sender.send(LifecycleEvent::Unplugged).await);

        match rx.recv().await {
            Some(SessionMessage::Lifecycle(ev)) => {
                assert_eq!(ev.session_id, id);
                assert_eq!(ev.event, LifecycleEvent::Unplugged);
            }
            other => panic!("unexpected {:?}", other),
        }

        drop(rx);
        assert!(!sender.send(LifecycleEvent::Unplugged).await);
    }
}
