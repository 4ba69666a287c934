//! Per-character pub/sub channels.
//!
//! Publishing is fire-and-forget: an event for a character nobody is watching
//! is simply dropped.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::CombatEvent;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct CombatChannels {
    channels: DashMap<i64, broadcast::Sender<CombatEvent>>,
}

impl CombatChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, character_id: i64) -> broadcast::Receiver<CombatEvent> {
        self.channels
            .entry(character_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns the number of subscribers that received the event
    pub fn publish(&self, event: CombatEvent) -> usize {
        let character_id = event.character_id();
        let msg_type = event.msg_type();

        let delivered = match self.channels.get(&character_id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };

        if delivered == 0 {
            // Nobody listening; drop the idle channel
            self.channels
                .remove_if(&character_id, |_, sender| sender.receiver_count() == 0);
        }

        debug!("Published {} for character {} to {} subscriber(s)", msg_type, character_id, delivered);
        delivered
    }

    pub fn subscriber_count(&self, character_id: i64) -> usize {
        self.channels
            .get(&character_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_scoped_per_character() {
        let channels = CombatChannels::new();
        let mut rx_one = channels.subscribe(1);
        let mut rx_two = channels.subscribe(2);

        assert_eq!(channels.publish(CombatEvent::CombatStopped { character_id: 1 }), 1);

        assert_eq!(rx_one.recv().await.unwrap(), CombatEvent::CombatStopped { character_id: 1 });
        assert!(rx_two.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let channels = CombatChannels::new();
        assert_eq!(channels.publish(CombatEvent::CombatStopped { character_id: 9 }), 0);
        assert_eq!(channels.subscriber_count(9), 0);
    }

    #[test]
    fn test_dropped_receivers_clean_up_channel() {
        let channels = CombatChannels::new();
        let rx = channels.subscribe(4);
        assert_eq!(channels.subscriber_count(4), 1);
        drop(rx);

        channels.publish(CombatEvent::CombatStopped { character_id: 4 });
        assert!(channels.channels.get(&4).is_none());
    }
}
