//! The event bus feeding the control loop
//!
//! Single consumer, many producers, bounded. Detection events are lossy:
//! vision outruns the control loop and stale frames are worthless, so when
//! the bus is full the oldest queued detection makes room. Every other
//! kind must not be dropped; its producer blocks for space up to the
//! configured backpressure timeout and then gets an error.
//!
//! A plain channel cannot express the per-kind policy, hence the condvar'd
//! deque.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::BusConfig;
use crate::control::Clock;
use crate::{Error, Result};

use super::events::{BusEvent, Event};

struct Queue {
    items: VecDeque<BusEvent>,
    dropped_detections: u64,
    last_drop_warn: Option<Instant>,
}

struct Inner {
    queue: Mutex<Queue>,
    /// Signalled when an item is popped
    space: Condvar,
    /// Signalled when an item is pushed
    ready: Condvar,
    capacity: usize,
    backpressure: Duration,
    clock: Arc<dyn Clock>,
}

/// Bounded multi-producer single-consumer event queue
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl EventBus {
    pub fn new(config: &BusConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue {
                    items: VecDeque::with_capacity(config.capacity),
                    dropped_detections: 0,
                    last_drop_warn: None,
                }),
                space: Condvar::new(),
                ready: Condvar::new(),
                capacity: config.capacity,
                backpressure: Duration::from_millis(config.backpressure_timeout_ms),
                clock,
            }),
        }
    }

    /// Publish an event, stamping it with the bus clock
    ///
    /// Lossy kinds never fail; other kinds block for space up to the
    /// backpressure timeout and then return [`Error::ChannelFull`].
    pub fn publish(&self, event: Event) -> Result<()> {
        let stamped = BusEvent {
            at_ms: self.inner.clock.now_ms(),
            event,
        };
        let mut q = self.inner.queue.lock();

        if stamped.event.is_lossy() {
            if q.items.len() >= self.inner.capacity {
                self.drop_one_detection(&mut q);
            }
            if q.items.len() < self.inner.capacity {
                q.items.push_back(stamped);
                drop(q);
                self.inner.ready.notify_one();
            }
            return Ok(());
        }

        let deadline = Instant::now() + self.inner.backpressure;
        while q.items.len() >= self.inner.capacity {
            let timed_out = self
                .inner
                .space
                .wait_until(&mut q, deadline)
                .timed_out();
            if timed_out && q.items.len() >= self.inner.capacity {
                return Err(Error::ChannelFull);
            }
        }
        q.items.push_back(stamped);
        drop(q);
        self.inner.ready.notify_one();
        Ok(())
    }

    /// Pop the next event, waiting up to `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<BusEvent> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.queue.lock();
        while q.items.is_empty() {
            if self.inner.ready.wait_until(&mut q, deadline).timed_out() && q.items.is_empty() {
                return None;
            }
        }
        let item = q.items.pop_front();
        drop(q);
        self.inner.space.notify_one();
        item
    }

    /// Pop without waiting
    pub fn try_recv(&self) -> Option<BusEvent> {
        let mut q = self.inner.queue.lock();
        let item = q.items.pop_front();
        if item.is_some() {
            drop(q);
            self.inner.space.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detections discarded so far under overflow
    pub fn dropped_detections(&self) -> u64 {
        self.inner.queue.lock().dropped_detections
    }

    /// Evict the oldest queued detection to make room for a newer one
    ///
    /// If no detection is queued the incoming one is the drop victim; either
    /// way the counter advances and the warn is rate-limited to 1 Hz.
    fn drop_one_detection(&self, q: &mut Queue) {
        if let Some(at) = q.items.iter().position(|e| e.event.is_lossy()) {
            q.items.remove(at);
        }
        q.dropped_detections += 1;

        let now = Instant::now();
        let warn_due = q
            .last_drop_warn
            .map_or(true, |t| now.duration_since(t) >= Duration::from_secs(1));
        if warn_due {
            q.last_drop_warn = Some(now);
            tracing::warn!(
                dropped = q.dropped_detections,
                "event bus full, shedding detection events"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ManualClock;
    use crate::vision::DetectionEvent;

    fn test_bus(capacity: usize) -> EventBus {
        let cfg = BusConfig {
            capacity,
            backpressure_timeout_ms: 10,
        };
        EventBus::new(&cfg, Arc::new(ManualClock::new(0)))
    }

    fn detection() -> Event {
        Event::Detection(DetectionEvent::default())
    }

    #[test]
    fn test_fifo_order() {
        let bus = test_bus(8);
        bus.publish(Event::Shutdown).unwrap();
        bus.publish(detection()).unwrap();
        assert!(matches!(
            bus.try_recv().unwrap().event,
            Event::Shutdown
        ));
        assert!(matches!(
            bus.try_recv().unwrap().event,
            Event::Detection(_)
        ));
        assert!(bus.try_recv().is_none());
    }

    #[test]
    fn test_detections_shed_oldest_when_full() {
        let bus = test_bus(2);
        let mut first = DetectionEvent::default();
        first.frame_width = 1;
        let mut second = DetectionEvent::default();
        second.frame_width = 2;
        let mut third = DetectionEvent::default();
        third.frame_width = 3;

        bus.publish(Event::Detection(first)).unwrap();
        bus.publish(Event::Detection(second.clone())).unwrap();
        bus.publish(Event::Detection(third.clone())).unwrap();

        assert_eq!(bus.dropped_detections(), 1);
        match bus.try_recv().unwrap().event {
            Event::Detection(d) => assert_eq!(d.frame_width, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        match bus.try_recv().unwrap().event {
            Event::Detection(d) => assert_eq!(d.frame_width, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_non_lossy_kinds_survive_detection_pressure() {
        let bus = test_bus(2);
        bus.publish(Event::Shutdown).unwrap();
        bus.publish(detection()).unwrap();
        // Full; the new detection evicts the queued one, not the shutdown.
        bus.publish(detection()).unwrap();
        assert!(matches!(bus.try_recv().unwrap().event, Event::Shutdown));
    }

    #[test]
    fn test_non_lossy_publish_times_out_when_full() {
        let bus = test_bus(1);
        bus.publish(Event::Shutdown).unwrap();
        let err = bus.publish(Event::Shutdown);
        assert!(matches!(err, Err(Error::ChannelFull)));
    }

    #[test]
    fn test_blocked_producer_wakes_on_consume() {
        let bus = test_bus(1);
        bus.publish(Event::Shutdown).unwrap();

        let bus2 = bus.clone();
        let handle = std::thread::spawn(move || {
            // Space opens up before the 10 ms backpressure window closes.
            bus2.publish(Event::Shutdown)
        });
        std::thread::sleep(Duration::from_millis(2));
        assert!(bus.try_recv().is_some());
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_events_are_timestamped() {
        let clock = Arc::new(ManualClock::new(0));
        let cfg = BusConfig::default();
        let bus = EventBus::new(&cfg, clock.clone());

        clock.advance(42);
        bus.publish(Event::Shutdown).unwrap();
        assert_eq!(bus.try_recv().unwrap().at_ms, 42);
    }
}
