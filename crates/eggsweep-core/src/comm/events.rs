//! Event types flowing over the bus
//!
//! Producers (vision, serial readers, the scheduler) publish these; the
//! control loop is the sole consumer. Cross-producer ordering is
//! best-effort by timestamp; within a producer, FIFO.

use crate::control::TimerId;
use crate::protocol::{CommandId, Peer, PeerReply};
use crate::vision::{DetectionEvent, ObstacleDistance};

/// Link lifecycle notifications from the serial workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

/// Everything the control loop can react to
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A frame's worth of egg detections from the vision producer
    Detection(DetectionEvent),
    /// Standalone obstacle distance reading
    Obstacle(ObstacleDistance),
    /// Decoded reply frame from a peer
    Reply { peer: Peer, reply: PeerReply },
    /// Serial link went up or down
    Link { peer: Peer, event: LinkEvent },
    /// A scheduler timer fired
    Timer(TimerId),
    /// A pending command exceeded its ACK deadline
    CommandTimeout {
        id: CommandId,
        peer: Peer,
        attempt: u32,
    },
    /// Cooperative shutdown request
    Shutdown,
}

impl Event {
    /// Detections are the only lossy event kind on the bus
    pub(crate) fn is_lossy(&self) -> bool {
        matches!(self, Event::Detection(_))
    }
}

/// An event as stored on the bus, stamped with the scheduler clock
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub at_ms: u64,
    pub event: Event,
}
