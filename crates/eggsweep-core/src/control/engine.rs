//! The threaded control engine
//!
//! Owns the bus, the two serial links, and the control-loop thread that
//! drains the bus into [`ControlCore`]. There is no process-wide state:
//! everything lives in the engine value returned by [`ControlEngine::start`]
//! and dies with [`ControlEngine::stop`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::comm::{Event, EventBus};
use crate::config::EngineConfig;
use crate::link::{LinkHandle, SerialLink};
use crate::protocol::{Frame, Peer};
use crate::{Error, Result};

use super::core::{CommandSink, ControlCore};
use super::{Clock, SystemClock};

/// Longest the loop sleeps when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Routes core output onto the link writer queues
struct LinkSink {
    actor: LinkHandle,
    arm: LinkHandle,
}

impl LinkSink {
    fn handle(&self, peer: Peer) -> &LinkHandle {
        match peer {
            Peer::Actor => &self.actor,
            Peer::Arm => &self.arm,
        }
    }
}

impl CommandSink for LinkSink {
    fn send_frame(&mut self, peer: Peer, frame: &Frame) {
        if let Err(e) = self.handle(peer).send_frame(frame) {
            // Queue pressure or a dead link: the pending entry times out
            // and the retry path takes over.
            tracing::warn!(%peer, error = %e, "frame not queued");
        }
    }

    fn flush(&mut self, peer: Peer) {
        self.handle(peer).flush();
    }
}

/// Running control engine
///
/// The vision producer publishes [`Event::Detection`] /
/// [`Event::Obstacle`] onto [`ControlEngine::bus`].
pub struct ControlEngine {
    bus: EventBus,
    running: Arc<AtomicBool>,
    control_loop: Option<JoinHandle<()>>,
    actor: SerialLink,
    arm: SerialLink,
}

impl ControlEngine {
    /// Validate the configuration, open the links, and start the loop
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let bus = EventBus::new(&config.bus, Arc::clone(&clock));

        let actor = SerialLink::connect(Peer::Actor, &config.actor, bus.clone())?;
        let arm = SerialLink::connect(Peer::Arm, &config.arm, bus.clone())?;
        let sink = LinkSink {
            actor: actor.handle(),
            arm: arm.handle(),
        };

        let mut core = ControlCore::new(&config, Arc::clone(&clock), sink);
        core.start();

        let running = Arc::new(AtomicBool::new(true));
        let control_loop = {
            let running = Arc::clone(&running);
            let bus = bus.clone();
            thread::Builder::new()
                .name("control-loop".into())
                .spawn(move || run_control_loop(core, bus, clock, running))
                .map_err(|e| Error::InvalidState(format!("cannot spawn control loop: {}", e)))?
        };

        tracing::info!("control engine started");
        Ok(Self {
            bus,
            running,
            control_loop: Some(control_loop),
            actor,
            arm,
        })
    }

    /// The bus external producers publish into
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Cooperative shutdown: drain, disable timers, close the links
    pub fn stop(mut self) -> Result<()> {
        // Best effort: the loop also honors the running flag.
        let _ = self.bus.publish(Event::Shutdown);
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.control_loop.take() {
            h.join()
                .map_err(|_| Error::InvalidState("control loop panicked".into()))?;
        }
        self.actor.stop();
        self.arm.stop();
        tracing::info!("control engine stopped");
        Ok(())
    }
}

/// Main loop: wait on the bus bounded by the next scheduler deadline
fn run_control_loop(
    mut core: ControlCore<LinkSink>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let wait = core
            .next_deadline()
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(clock.now_ms())))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);

        if let Some(ev) = bus.recv_timeout(wait) {
            if matches!(ev.event, Event::Shutdown) {
                // Drain whatever producers managed to queue, then wind down.
                while let Some(rest) = bus.try_recv() {
                    core.handle(&rest);
                }
                core.handle(&ev);
                break;
            }
            core.handle(&ev);
        }
        core.tick();
    }
    tracing::debug!("control loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_start_stop_without_devices() {
        // No serial devices exist here; the links keep retrying in the
        // background and shutdown must still be clean and prompt.
        let mut config = EngineConfig::default();
        config.actor.port = "/dev/null-eggsweep-actor".into();
        config.arm.port = "/dev/null-eggsweep-arm".into();

        let engine = ControlEngine::start(config).unwrap();
        let bus = engine.bus();
        assert!(bus
            .publish(Event::Obstacle(crate::vision::ObstacleDistance {
                cm: 100,
                timestamp_ms: 0,
            }))
            .is_ok());
        std::thread::sleep(Duration::from_millis(50));
        engine.stop().unwrap();
    }

    #[test]
    fn test_invalid_config_refuses_to_start() {
        let mut config = EngineConfig::default();
        config.bus.capacity = 0;
        assert!(matches!(
            ControlEngine::start(config),
            Err(Error::Config(_))
        ));
    }
}
