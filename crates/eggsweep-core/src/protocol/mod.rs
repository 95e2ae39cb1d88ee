//! Wire protocol shared by the actor and arm links
//!
//! Commands, status polls, and replies all ride the framed codec in
//! [`codec`]. Command frames carry a correlation id echoed back by the
//! peer's ACK; status polls are fire-and-forget and answered by status
//! reply frames instead.

mod codec;

pub use codec::{
    EncodeError, Frame, FrameDecoder, FOOTER, HEADER, MAX_FRAME_BYTES, MAX_PAYLOAD_WORDS,
    MIN_FRAME_BYTES,
};

use std::fmt;

use crate::vision::Coordinate;

/// Frame data types
pub mod data_type {
    /// PC -> Arm: interleaved detection coordinates (telemetry)
    pub const COORDINATES: u8 = 0x01;
    /// MCU -> PC: pause/resume coordinate transmission
    pub const CONTROL_TOGGLE: u8 = 0x02;
    /// PC -> peer: status poll carrying a peer sentinel word
    pub const STATUS_POLL: u8 = 0x03;
    /// PC -> peer: command `[id, opcode, args...]`
    pub const COMMAND: u8 = 0x04;
    /// Actor -> PC: motion status reply
    pub const ACTOR_STATUS: u8 = 0x10;
    /// Arm -> PC: pick status reply
    pub const ARM_STATUS: u8 = 0x20;
    /// peer -> PC: ACK echoing a command id
    pub const ACK: u8 = 0xFF;
}

/// Command opcodes (word 1 of a command frame)
pub mod opcode {
    pub const MOVE_FORWARD: u16 = 0x0001;
    pub const STOP: u16 = 0x0003;
    pub const ROTATE_90: u16 = 0x0004;
    pub const PICK: u16 = 0x0005;
}

/// Status poll sentinels (word 0 of a poll frame)
pub mod sentinel {
    pub const ACTOR_STATUS: u16 = 0x0005;
    pub const ARM_STATUS: u16 = 0x0051;
}

/// The two MCU endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Actor,
    Arm,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Actor => write!(f, "actor"),
            Peer::Arm => write!(f, "arm"),
        }
    }
}

/// Correlation id carried by command frames and echoed by ACKs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u16);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands the controller issues to its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    MoveForward,
    Stop,
    Rotate90,
    Pick { target: Coordinate },
}

impl CommandKind {
    /// Which peer executes this command
    pub fn peer(&self) -> Peer {
        match self {
            CommandKind::MoveForward | CommandKind::Stop | CommandKind::Rotate90 => Peer::Actor,
            CommandKind::Pick { .. } => Peer::Arm,
        }
    }

    pub fn opcode(&self) -> u16 {
        match self {
            CommandKind::MoveForward => opcode::MOVE_FORWARD,
            CommandKind::Stop => opcode::STOP,
            CommandKind::Rotate90 => opcode::ROTATE_90,
            CommandKind::Pick { .. } => opcode::PICK,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::MoveForward => write!(f, "move_forward"),
            CommandKind::Stop => write!(f, "stop"),
            CommandKind::Rotate90 => write!(f, "rotate_90"),
            CommandKind::Pick { target } => write!(f, "pick({}, {})", target.x, target.y),
        }
    }
}

/// Drive-base motion as reported by the actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorMotion {
    Idle,
    Moving,
    Turning,
}

/// Manipulator activity as reported by the arm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmActivity {
    Done,
    Picking,
}

/// Replies decoded from inbound peer frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerReply {
    Ack {
        id: CommandId,
    },
    ActorStatus {
        motion: ActorMotion,
        /// Obstacle distance piggy-backed on the status reply, if present
        obstacle_cm: Option<u16>,
    },
    ArmStatus {
        activity: ArmActivity,
    },
    ControlToggle {
        enable: bool,
    },
}

/// Encode a command frame: `[id, opcode, args...]`
pub fn encode_command(id: CommandId, kind: CommandKind) -> Frame {
    let mut words = [0u16; 4];
    words[0] = id.0;
    words[1] = kind.opcode();
    let len = match kind {
        CommandKind::Pick { target } => {
            words[2] = target.x;
            words[3] = target.y;
            4
        }
        _ => 2,
    };
    Frame::new(data_type::COMMAND, &words[..len]).expect("command payloads are tiny")
}

/// Encode a status poll for the given peer
pub fn encode_status_poll(peer: Peer) -> Frame {
    let word = match peer {
        Peer::Actor => sentinel::ACTOR_STATUS,
        Peer::Arm => sentinel::ARM_STATUS,
    };
    Frame::new(data_type::STATUS_POLL, &[word]).expect("single-word payload")
}

/// Encode the detection telemetry frame: interleaved `[x1, y1, x2, y2, ...]`
///
/// An empty slice still produces a (zero-length) frame. Target lists beyond
/// the frame capacity are truncated to the closest-first prefix.
pub fn encode_coordinates(points: &[Coordinate]) -> Frame {
    let max_points = MAX_PAYLOAD_WORDS / 2;
    let points = if points.len() > max_points {
        tracing::debug!(
            dropped = points.len() - max_points,
            "coordinate frame truncated"
        );
        &points[..max_points]
    } else {
        points
    };
    let mut words = Vec::with_capacity(points.len() * 2);
    for p in points {
        words.push(p.x);
        words.push(p.y);
    }
    Frame::new(data_type::COORDINATES, &words).expect("length capped above")
}

/// Decode an inbound frame into a typed reply
///
/// Unknown data types and malformed payloads return `None`; the link logs
/// and drops them.
pub fn decode_reply(frame: &Frame) -> Option<PeerReply> {
    match frame.data_type {
        data_type::ACK => Some(PeerReply::Ack {
            id: CommandId(frame.word(0)?),
        }),
        data_type::ACTOR_STATUS => {
            let motion = match frame.word(0)? {
                0 => ActorMotion::Idle,
                1 => ActorMotion::Moving,
                2 => ActorMotion::Turning,
                _ => return None,
            };
            Some(PeerReply::ActorStatus {
                motion,
                obstacle_cm: frame.word(1),
            })
        }
        data_type::ARM_STATUS => {
            let activity = match frame.word(0)? {
                0 => ArmActivity::Done,
                1 => ArmActivity::Picking,
                _ => return None,
            };
            Some(PeerReply::ArmStatus { activity })
        }
        data_type::CONTROL_TOGGLE => match frame.word(0)? {
            0 => Some(PeerReply::ControlToggle { enable: false }),
            1 => Some(PeerReply::ControlToggle { enable: true }),
            _ => None,
        },
        _ => None,
    }
}
