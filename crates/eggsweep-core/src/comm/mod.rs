//! Communication primitives for the control core
//!
//! Channels carry outbound frames to the link writer workers; the event bus
//! funnels everything else (detections, peer replies, timers) into the
//! single-threaded control loop.

mod bus;
mod channel;
mod events;

pub use bus::EventBus;
pub use channel::{bounded_channel, Receiver, Sender};
pub use events::{BusEvent, Event, LinkEvent};
