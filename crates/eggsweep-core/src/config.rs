//! Engine configuration
//!
//! All timing constants come through here so tests can accelerate them.
//! Invalid values are rejected at startup with [`Error::Config`]; nothing
//! in the running engine re-validates.

use serde::{Deserialize, Serialize};

use crate::vision::CenterBand;
use crate::{Error, Result};

/// Serial link configuration for one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Serial device path (e.g. "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate
    pub baudrate: u32,
    /// Initial reconnect delay; doubles on each failed attempt
    pub reconnect_delay_ms: u64,
    /// Cap for the doubling reconnect delay
    pub max_reconnect_delay_ms: u64,
    /// Per-read chunk size for the reader worker
    pub read_chunk_size: usize,
    /// Capacity of the outbound frame queue drained by the writer worker
    pub outbound_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baudrate: 115_200,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 10_000,
            read_chunk_size: 64,
            outbound_queue: 32,
        }
    }
}

impl LinkConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }
}

/// Timer periods and the pending-command policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Actor status poll period
    pub actor_status_period_ms: u64,
    /// Arm status poll period
    pub arm_status_period_ms: u64,
    /// How long `ScanOnly` waits for a detection before moving on
    pub scan_only_timeout_ms: u64,
    /// How long `MoveOnly` drives forward before the second turn
    pub move_only_countdown_ms: u64,
    /// Hard deadline for a command ACK
    pub ack_timeout_ms: u64,
    /// Send attempts before falling back to the slow resend loop
    pub max_send_attempts: u32,
    /// Period of the slow resend loop once attempts are exhausted
    pub command_retry_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            actor_status_period_ms: 1_000,
            arm_status_period_ms: 1_000,
            scan_only_timeout_ms: 5_000,
            move_only_countdown_ms: 5_000,
            ack_timeout_ms: 5_000,
            max_send_attempts: 3,
            command_retry_ms: 1_000,
        }
    }
}

/// Behaviour thresholds for the state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviourConfig {
    /// Vertical band of the image where an egg triggers a pick
    pub center_band: CenterBand,
    /// Obstacle distances below this stop the sweep (cm)
    pub obstacle_stop_cm: u32,
    /// Detections below this confidence never enter the pick queue
    pub min_pick_confidence: f32,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            center_band: CenterBand::default(),
            obstacle_stop_cm: 30,
            min_pick_confidence: 0.0,
        }
    }
}

/// Event bus sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bounded queue capacity
    pub capacity: usize,
    /// How long a non-lossy producer may wait for space
    pub backpressure_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            backpressure_timeout_ms: 100,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub actor: LinkConfig,
    pub arm: LinkConfig,
    pub scheduler: SchedulerConfig,
    pub behaviour: BehaviourConfig,
    pub bus: BusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            actor: LinkConfig::new("/dev/ttyUSB0"),
            arm: LinkConfig::new("/dev/ttyUSB1"),
            scheduler: SchedulerConfig::default(),
            behaviour: BehaviourConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check the configuration before the engine starts
    pub fn validate(&self) -> Result<()> {
        for (name, link) in [("actor", &self.actor), ("arm", &self.arm)] {
            if link.port.is_empty() {
                return Err(Error::Config(format!("{} serial port is empty", name)));
            }
            if link.baudrate == 0 {
                return Err(Error::Config(format!("{} baud rate is zero", name)));
            }
            if link.read_chunk_size == 0 || link.outbound_queue == 0 {
                return Err(Error::Config(format!("{} buffer sizes must be nonzero", name)));
            }
            if link.max_reconnect_delay_ms < link.reconnect_delay_ms {
                return Err(Error::Config(format!(
                    "{} reconnect cap below initial delay",
                    name
                )));
            }
        }

        let s = &self.scheduler;
        if s.actor_status_period_ms == 0
            || s.arm_status_period_ms == 0
            || s.scan_only_timeout_ms == 0
            || s.move_only_countdown_ms == 0
            || s.ack_timeout_ms == 0
            || s.command_retry_ms == 0
        {
            return Err(Error::Config("timer periods must be nonzero".into()));
        }
        if s.max_send_attempts == 0 {
            return Err(Error::Config("max_send_attempts must be at least 1".into()));
        }

        let band = self.behaviour.center_band;
        if !(0.0..=1.0).contains(&band.lower)
            || !(0.0..=1.0).contains(&band.upper)
            || band.lower >= band.upper
        {
            return Err(Error::Config(format!(
                "center band [{}, {}] is not an ordered pair of fractions",
                band.lower, band.upper
            )));
        }
        if !(0.0..=1.0).contains(&self.behaviour.min_pick_confidence) {
            return Err(Error::Config("min_pick_confidence outside [0, 1]".into()));
        }

        if self.bus.capacity == 0 {
            return Err(Error::Config("bus capacity must be nonzero".into()));
        }

        Ok(())
    }
}
