use std::sync::Arc;
use tokio::sync::broadcast;

/// One successful measurement as published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Counts successful measurements from 1.
    pub seq: u64,
    pub distance_mm: f64,
}

/// Fan-out of readings from the sensor thread to async subscribers.
///
/// Bounded: a subscriber that falls more than `capacity` readings behind
/// skips the oldest ones.
#[derive(Debug, Clone)]
pub struct ReadingTopic {
    tx: broadcast::Sender<Arc<Reading>>,
}

impl ReadingTopic {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns how many subscribers the reading reached. With none it is dropped.
    pub fn publish(&self, reading: Reading) -> usize {
        self.tx.send(Arc::new(reading)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Reading>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_see_readings_in_order() {
        let topic = ReadingTopic::new(4);
        let mut rx = topic.subscribe();
        assert_eq!(topic.publish(Reading { seq: 1, distance_mm: 120.5 }), 1);
        topic.publish(Reading { seq: 2, distance_mm: 121.0 });

        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().distance_mm, 121.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let topic = ReadingTopic::new(1);
        assert_eq!(topic.publish(Reading { seq: 1, distance_mm: 0.0 }), 0);
    }

    #[test]
    fn test_slow_subscriber_skips_oldest() {
        let topic = ReadingTopic::new(2);
        let mut rx = topic.subscribe();
        for seq in 1..=3 {
            topic.publish(Reading { seq, distance_mm: 100.0 });
        }
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Lagged(1))));
        assert_eq!(rx.try_recv().unwrap().seq, 2);
    }
}
