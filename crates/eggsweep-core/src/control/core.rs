//! Single-threaded control core
//!
//! Composes the state machine with the scheduler and turns effects into
//! wire frames pushed at a [`CommandSink`]. The engine wraps this in a
//! thread; tests drive it directly with a manual clock and a recording
//! sink, which is how the end-to-end scenarios stay deterministic.

use std::sync::Arc;

use crate::comm::{BusEvent, Event};
use crate::config::EngineConfig;
use crate::protocol::{self, Frame, Peer, PeerReply};
use crate::vision::Coordinate;

use super::machine::{ControlState, Effect, StateMachine};
use super::scheduler::{CommandScheduler, Due, TimerId};
use super::Clock;

/// Where encoded frames go
///
/// The engine routes to the link writer queues; tests record.
pub trait CommandSink {
    fn send_frame(&mut self, peer: Peer, frame: &Frame);
    /// Discard everything queued toward a peer (control-toggle support)
    fn flush(&mut self, peer: Peer);
}

/// Machine + scheduler + routing, no threads
pub struct ControlCore<S> {
    machine: StateMachine,
    scheduler: CommandScheduler,
    clock: Arc<dyn Clock>,
    sink: S,
    ack_timeout_ms: u64,
    /// Per-peer transmission gates driven by `ControlToggle`
    actor_tx_enabled: bool,
    arm_tx_enabled: bool,
}

impl<S: CommandSink> ControlCore<S> {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>, sink: S) -> Self {
        let mut scheduler = CommandScheduler::new(&config.scheduler);
        scheduler.tick(clock.now_ms());
        Self {
            machine: StateMachine::new(
                config.behaviour.clone(),
                config.scheduler.max_send_attempts,
            ),
            scheduler,
            clock,
            sink,
            ack_timeout_ms: config.scheduler.ack_timeout_ms,
            actor_tx_enabled: true,
            arm_tx_enabled: true,
        }
    }

    /// Arm the wake-up poller; the machine leaves `Idle` on its first tick
    pub fn start(&mut self) {
        self.scheduler.enable_timer(TimerId::ActorStatus);
        tracing::info!("control core started in state {}", self.machine.state());
    }

    pub fn state(&self) -> &ControlState {
        self.machine.state()
    }

    /// ACK-tracked commands currently in flight toward a peer
    pub fn in_flight(&self, peer: Peer) -> usize {
        self.scheduler.in_flight(peer)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Earliest scheduler deadline, for bounding the event-loop wait
    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduler.next_deadline()
    }

    /// Process one bus event
    pub fn handle(&mut self, ev: &BusEvent) {
        self.handle_event(&ev.event);
    }

    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::Reply { peer, reply } => match reply {
                PeerReply::Ack { id } => {
                    self.scheduler.ack(*id);
                }
                PeerReply::ControlToggle { enable } => {
                    self.set_gate(*peer, *enable);
                    return;
                }
                _ => {}
            },
            Event::Detection(ev) => self.emit_telemetry(ev),
            Event::Link { peer, event } => {
                tracing::debug!(%peer, ?event, "link state change");
            }
            Event::Shutdown => {
                self.shutdown();
                return;
            }
            _ => {}
        }
        let effects = self.machine.step(event);
        self.apply(effects);
    }

    /// Fire everything due on the scheduler clock
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        for due in self.scheduler.tick(now) {
            match due {
                Due::Timer(id) => {
                    self.poll_peer_status(id);
                    let effects = self.machine.step(&Event::Timer(id));
                    self.apply(effects);
                }
                Due::CommandTimeout { id, peer, attempt } => {
                    let effects = self.machine.step(&Event::CommandTimeout { id, peer, attempt });
                    self.apply(effects);
                }
            }
        }
    }

    /// Status poll rides the timer tick; replies come back as status frames,
    /// so nothing is registered pending
    fn poll_peer_status(&mut self, id: TimerId) {
        let peer = match id {
            TimerId::ActorStatus => Peer::Actor,
            TimerId::ArmStatus => Peer::Arm,
            _ => return,
        };
        if self.gate(peer) {
            let frame = protocol::encode_status_poll(peer);
            self.sink.send_frame(peer, &frame);
        }
    }

    /// Forward detection centers to the arm as a coordinate frame
    ///
    /// Emitted per accepted frame, empty payload included, unless the arm
    /// toggled transmission off.
    fn emit_telemetry(&mut self, ev: &crate::vision::DetectionEvent) {
        if !self.machine.accepts_detections() || !self.arm_tx_enabled {
            return;
        }
        let points: Vec<Coordinate> = ev.detections.iter().map(|d| d.center).collect();
        let frame = protocol::encode_coordinates(&points);
        self.sink.send_frame(Peer::Arm, &frame);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send {
                    id,
                    kind,
                    attempt,
                    track,
                } => {
                    let peer = kind.peer();
                    if track {
                        self.scheduler
                            .register_pending(id, peer, self.ack_timeout_ms, attempt);
                    }
                    if self.gate(peer) {
                        let frame = protocol::encode_command(id, kind);
                        tracing::debug!(%peer, command = %id, kind = %kind, attempt, "sending command");
                        self.sink.send_frame(peer, &frame);
                    } else {
                        // Left in the pending table so the retry loop keeps
                        // the machine live and resumes after re-enable.
                        tracing::debug!(%peer, command = %id, "transmission disabled, holding command");
                    }
                }
                Effect::EnableTimer(id) => self.scheduler.enable_timer(id),
                Effect::DisableTimer(id) => self.scheduler.disable_timer(id),
                Effect::StartCountdown(id) => self.scheduler.start_countdown(id),
                Effect::CancelCountdown(id) => self.scheduler.cancel_countdown(id),
            }
        }
    }

    fn gate(&self, peer: Peer) -> bool {
        match peer {
            Peer::Actor => self.actor_tx_enabled,
            Peer::Arm => self.arm_tx_enabled,
        }
    }

    fn set_gate(&mut self, peer: Peer, enable: bool) {
        match peer {
            Peer::Actor => self.actor_tx_enabled = enable,
            Peer::Arm => self.arm_tx_enabled = enable,
        }
        if enable {
            tracing::info!(%peer, "transmission re-enabled by peer");
        } else {
            tracing::info!(%peer, "transmission disabled by peer, flushing outbound queue");
            self.sink.flush(peer);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("control core shutting down");
        self.scheduler.disable_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ManualClock;
    use crate::protocol::{data_type, CommandId};
    use crate::vision::{Detection, DetectionEvent};

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(Peer, Frame)>,
        flushes: Vec<Peer>,
    }

    impl CommandSink for RecordingSink {
        fn send_frame(&mut self, peer: Peer, frame: &Frame) {
            self.frames.push((peer, frame.clone()));
        }

        fn flush(&mut self, peer: Peer) {
            self.flushes.push(peer);
        }
    }

    fn core() -> (ControlCore<RecordingSink>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut core = ControlCore::new(
            &EngineConfig::default(),
            clock.clone(),
            RecordingSink::default(),
        );
        core.start();
        (core, clock)
    }

    fn reply(peer: Peer, reply: PeerReply) -> Event {
        Event::Reply { peer, reply }
    }

    #[test]
    fn test_first_tick_sends_move_forward() {
        let (mut core, clock) = core();
        clock.advance(1000);
        core.tick();

        let frames = &core.sink().frames;
        // Status poll plus the wake-up move command.
        assert!(frames
            .iter()
            .any(|(_, f)| f.data_type == data_type::STATUS_POLL));
        let cmd = frames
            .iter()
            .find(|(_, f)| f.data_type == data_type::COMMAND)
            .expect("move command sent");
        assert_eq!(cmd.0, Peer::Actor);
        assert_eq!(core.in_flight(Peer::Actor), 1);
    }

    #[test]
    fn test_ack_clears_pending() {
        let (mut core, clock) = core();
        clock.advance(1000);
        core.tick();
        let id = CommandId(
            core.sink()
                .frames
                .iter()
                .find(|(_, f)| f.data_type == data_type::COMMAND)
                .unwrap()
                .1
                .word(0)
                .unwrap(),
        );

        core.handle_event(&reply(Peer::Actor, PeerReply::Ack { id }));
        assert_eq!(core.in_flight(Peer::Actor), 0);
        assert_eq!(*core.state(), ControlState::ScanAndMove);
    }

    #[test]
    fn test_detection_telemetry_goes_to_arm() {
        let (mut core, clock) = core();
        clock.advance(1000);
        core.tick();
        let id = CommandId(
            core.sink()
                .frames
                .iter()
                .find(|(_, f)| f.data_type == data_type::COMMAND)
                .unwrap()
                .1
                .word(0)
                .unwrap(),
        );
        core.handle_event(&reply(Peer::Actor, PeerReply::Ack { id }));

        let ev = DetectionEvent {
            timestamp_ms: 0,
            detections: vec![Detection::new(Coordinate::new(10, 20), 0.9)],
            frame_width: 640,
            frame_height: 480,
        };
        core.handle_event(&Event::Detection(ev));

        let telemetry = core
            .sink()
            .frames
            .iter()
            .find(|(peer, f)| *peer == Peer::Arm && f.data_type == data_type::COORDINATES)
            .expect("telemetry frame");
        assert_eq!(telemetry.1.words.as_slice(), &[10, 20]);
    }

    #[test]
    fn test_control_toggle_flushes_and_gates() {
        let (mut core, clock) = core();
        clock.advance(1000);
        core.tick();

        core.handle_event(&reply(
            Peer::Actor,
            PeerReply::ControlToggle { enable: false },
        ));
        assert_eq!(core.sink().flushes, vec![Peer::Actor]);

        let before = core.sink().frames.len();
        clock.advance(1000);
        core.tick();
        // Poll suppressed while gated.
        assert_eq!(core.sink().frames.len(), before);

        core.handle_event(&reply(Peer::Actor, PeerReply::ControlToggle { enable: true }));
        clock.advance(1000);
        core.tick();
        assert!(core.sink().frames.len() > before);
    }

    #[test]
    fn test_gated_command_still_times_out_and_resumes() {
        let (mut core, clock) = core();
        core.handle_event(&reply(Peer::Actor, PeerReply::ControlToggle { enable: false }));

        clock.advance(1000);
        core.tick();
        // The wake-up command was issued but held; pending table has it.
        assert_eq!(core.in_flight(Peer::Actor), 1);
        assert!(core
            .sink()
            .frames
            .iter()
            .all(|(_, f)| f.data_type != data_type::COMMAND));

        // Re-enable, then let the ACK deadline lapse: the retry goes out.
        core.handle_event(&reply(Peer::Actor, PeerReply::ControlToggle { enable: true }));
        clock.advance(5000);
        core.tick();
        assert!(core
            .sink()
            .frames
            .iter()
            .any(|(_, f)| f.data_type == data_type::COMMAND));
    }

    #[test]
    fn test_single_in_flight_per_peer() {
        let (mut core, clock) = core();
        for _ in 0..10 {
            clock.advance(1000);
            core.tick();
            assert!(core.in_flight(Peer::Actor) <= 1);
            assert!(core.in_flight(Peer::Arm) <= 1);
        }
    }

    #[test]
    fn test_shutdown_disables_timers() {
        let (mut core, clock) = core();
        core.handle_event(&Event::Shutdown);
        clock.advance(60_000);
        core.tick();
        assert!(core.sink().frames.is_empty());
        assert_eq!(core.next_deadline(), None);
    }
}
