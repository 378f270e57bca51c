//! Session event notifications.
//!
//! Fan-out of job lifecycle events to whoever is watching: the session's
//! log stream, future UI frontends. Built on a tokio broadcast channel;
//! senders never block and a slow subscriber only loses its own backlog.

use tokio::sync::broadcast;

/// Capacity of the broadcast backlog per subscriber.
const CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the job loop and listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A classification job began
    JobStarted,
    /// A cycle finished and its class previews were rendered
    GalleryUpdated { cycle: String },
    /// Settings changed (user edit or producer drift)
    SettingsChanged,
    /// The job loop finished normally
    JobFinished,
    /// A kill request was accepted
    KillReceived,
    /// Something went wrong; the text is operator-facing
    Alert { text: String },
}

/// Broadcast hub for [`Notification`]s.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes an event; a hub with no subscribers drops it silently.
    pub fn publish(&self, notification: Notification) {
        let _ = self.sender.send(notification);
    }

    /// Subscribes to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_published_events() {
        let hub = NotificationHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish(Notification::JobStarted);
        hub.publish(Notification::GalleryUpdated {
            cycle: "cycle_3".to_string(),
        });

        assert_eq!(first.recv().await.unwrap(), Notification::JobStarted);
        assert_eq!(second.recv().await.unwrap(), Notification::JobStarted);
        assert_eq!(
            first.recv().await.unwrap(),
            Notification::GalleryUpdated {
                cycle: "cycle_3".to_string()
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_a_no_op() {
        let hub = NotificationHub::new();
        hub.publish(Notification::JobFinished);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let hub = NotificationHub::new();
        hub.publish(Notification::JobStarted);
        let mut late = hub.subscribe();
        hub.publish(Notification::JobFinished);
        assert_eq!(late.recv().await.unwrap(), Notification::JobFinished);
    }
}
