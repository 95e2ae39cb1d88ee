//! eggsweep-core: on-board control core for the eggsweep egg-collecting robot
//!
//! The robot sweeps an area, detects eggs with an external vision module,
//! stops, picks them with a manipulator arm, and resumes scanning. This crate
//! is the PC-side controller that mediates between the vision producer and
//! two MCU peers on serial links: the Actor (drive base) and the Arm (picker).
//!
//! # Modules
//!
//! - [`protocol`] - Binary frame codec and the command/reply wire mapping
//! - [`comm`] - Channels and the event bus feeding the control loop
//! - [`link`] - Serial links with reader/writer workers and reconnect
//! - [`control`] - Clock, command scheduler, state machine, and engine
//! - [`vision`] - Detection events and the center-band predicate
//! - [`config`] - Engine configuration with validation
//!
//! # Architecture
//!
//! ```text
//! vision ──DetectionEvent──►┐
//! actor  ──PeerReply───────►│ EventBus ──► ControlCore ──commands──► links
//! arm    ──PeerReply───────►┘     ▲        (machine + scheduler)
//!                                 └──────────── timer ticks ┘
//! ```
//!
//! The state machine is a pure value: transitions map `(state, event)` to a
//! list of effects that the engine applies. Tests drive the whole control
//! path single-threaded with a manual clock.

#![warn(unused_must_use)]

pub mod comm;
pub mod config;
pub mod control;
pub mod link;
pub mod protocol;
pub mod vision;

// Re-exports for convenience
pub use comm::{Event, EventBus, LinkEvent};
pub use config::EngineConfig;
pub use control::{ControlEngine, ControlState};
pub use protocol::{CommandId, CommandKind, Frame, FrameDecoder, Peer, PeerReply};
pub use vision::{Coordinate, Detection, DetectionEvent, ObstacleDistance};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for eggsweep-core
///
/// Transport and codec failures are recovered locally (resync, reconnect)
/// and rarely reach callers; timeouts are surfaced to the state machine as
/// events rather than errors; configuration errors abort startup.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed frame that could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] protocol::EncodeError),

    /// Transport closed or could not be opened; the link keeps reconnecting.
    #[error("link disconnected: {0}")]
    Disconnected(String),

    /// A write to a peer failed; the pending command is left to time out.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Invalid configuration; the engine refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Communication channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Channel or bus is full (backpressure).
    #[error("channel full")]
    ChannelFull,

    /// Operation attempted in an invalid state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Disconnected(format!("I/O error: {}", e))
    }
}

/// Result type alias for eggsweep-core operations
pub type Result<T> = std::result::Result<T, Error>;
