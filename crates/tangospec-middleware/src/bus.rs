//! Attribute change-event bus.
//!
//! Uses [`tokio::sync::broadcast`] so every subscriber receives every event
//! without any single subscriber blocking the others.  Publishing never
//! blocks; slow subscribers lag and lose the oldest events.

use tangospec_types::ChangeEvent;
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 1024;

/// Shared event bus. Clone it cheaply – all clones share the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event.
    ///
    /// Returns the number of subscribers that were handed the event; `0`
    /// when nobody is listening, which is a normal condition.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to every event on the bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of one device, optionally one attribute.
    ///
    /// Device and attribute names compare case-insensitively.
    pub fn subscribe_device(&self, device: &str, attribute: Option<&str>) -> DeviceSubscriber {
        DeviceSubscriber {
            device: device.to_ascii_lowercase(),
            attribute: attribute.map(str::to_ascii_lowercase),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Filtered subscriber
// ---------------------------------------------------------------------------

/// A subscriber that only delivers events of one device (and attribute).
pub struct DeviceSubscriber {
    device: String,
    attribute: Option<String>,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl DeviceSubscriber {
    /// Wait for the next matching event.
    ///
    /// Returns `None` when the bus is closed and no further events will arrive.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(device = %self.device, lagged_by = n, "DeviceSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.device.eq_ignore_ascii_case(&self.device)
            && self
                .attribute
                .as_deref()
                .is_none_or(|a| event.attribute.eq_ignore_ascii_case(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tangospec_types::{AttrQuality, WireValue};

    fn make_event(device: &str, attribute: &str) -> ChangeEvent {
        ChangeEvent::new(device, attribute, WireValue::Double(1.5), AttrQuality::Valid)
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = make_event("id00/spec/fourc", "Output");
        assert_eq!(bus.publish(event.clone()), 1);

        let received = rx.recv().await?;
        assert_eq!(received.id, event.id);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(make_event("a/b/c", "State")), 0);
    }

    #[tokio::test]
    async fn device_subscriber_filters() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_device("ID00/spec_motor/th", Some("position"));

        bus.publish(make_event("id00/spec_motor/tth", "Position"));
        bus.publish(make_event("id00/spec_motor/th", "State"));
        let good = make_event("id00/spec_motor/th", "Position");
        bus.publish(good.clone());

        let received = sub.recv().await.ok_or("No event received")?;
        assert_eq!(received.id, good.id);
        Ok(())
    }

    #[tokio::test]
    async fn unrelated_events_do_not_wake_subscriber() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_device("a/b/c", None);
        bus.publish(make_event("x/y/z", "State"));
        let result = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err());
    }
}
