//! The patrol state machine
//!
//! Seven states drive the sweep-detect-pick cycle. Transitions are pure:
//! `step(event)` mutates the machine value and returns a list of [`Effect`]s
//! for the engine to apply (frame sends, timer toggles). The machine never
//! touches a link or a clock, which is what makes the whole behavior table
//! testable single-threaded.
//!
//! Any transition that rides on a command holds the machine in an
//! awaiting-ACK overlay: the successor state is only committed once the peer
//! acknowledges. A missing ACK is retried up to the configured attempt
//! budget and then falls back to a slow 1 Hz resend loop, so the controller
//! never silently desyncs from its peers.

use std::collections::VecDeque;
use std::fmt;

use crate::comm::Event;
use crate::config::BehaviourConfig;
use crate::protocol::{ActorMotion, ArmActivity, CommandId, CommandKind, PeerReply};
use crate::vision::{Coordinate, DetectionEvent, ObstacleDistance};

use super::scheduler::TimerId;

/// Control states of the patrol cycle
#[derive(Debug, Clone, PartialEq)]
pub enum ControlState {
    /// Waiting for the first scheduler tick
    Idle,
    /// Driving forward while scanning for eggs
    ScanAndMove,
    /// Stopped, feeding targets to the arm one at a time
    PickUpEgg {
        queue: VecDeque<Coordinate>,
        /// A pick command has been dispatched and not yet reported done
        in_pick: bool,
    },
    /// First 90-degree turn after an obstacle
    TurnFirst,
    /// Scanning in place for a fresh target
    ScanOnly,
    /// Short blind forward leg
    MoveOnly,
    /// Second 90-degree turn, back onto the sweep
    TurnSecond,
}

impl ControlState {
    pub fn name(&self) -> &'static str {
        match self {
            ControlState::Idle => "Idle",
            ControlState::ScanAndMove => "ScanAndMove",
            ControlState::PickUpEgg { .. } => "PickUpEgg",
            ControlState::TurnFirst => "TurnFirst",
            ControlState::ScanOnly => "ScanOnly",
            ControlState::MoveOnly => "MoveOnly",
            ControlState::TurnSecond => "TurnSecond",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Side effects for the engine to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Encode and transmit a command frame
    Send {
        id: CommandId,
        kind: CommandKind,
        attempt: u32,
        /// Register in the pending table (the slow resend loop does not)
        track: bool,
    },
    EnableTimer(TimerId),
    DisableTimer(TimerId),
    StartCountdown(TimerId),
    CancelCountdown(TimerId),
}

/// A command sent, its ACK not yet seen
#[derive(Debug, Clone)]
struct AwaitingAck {
    id: CommandId,
    kind: CommandKind,
    attempt: u32,
    /// Successor committed when the ACK lands; `None` keeps the state
    then: Option<ControlState>,
    /// Attempt budget spent; resends ride the slow retry countdown
    exhausted: bool,
}

enum PickStep {
    Ignore,
    SendNext(Coordinate),
    Finished,
}

/// The patrol state machine
pub struct StateMachine {
    state: ControlState,
    awaiting: Option<AwaitingAck>,
    next_id: u16,
    accept_detections: bool,
    obstacle_near: bool,
    behaviour: BehaviourConfig,
    max_send_attempts: u32,
}

impl StateMachine {
    pub fn new(behaviour: BehaviourConfig, max_send_attempts: u32) -> Self {
        Self {
            state: ControlState::Idle,
            awaiting: None,
            next_id: 1,
            accept_detections: false,
            obstacle_near: false,
            behaviour,
            max_send_attempts,
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Whether detection events are currently acted on
    ///
    /// The bus always delivers; the machine filters.
    pub fn accepts_detections(&self) -> bool {
        self.accept_detections
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Feed one event, collecting the effects it produces
    pub fn step(&mut self, event: &Event) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            Event::Detection(ev) => self.on_detection(ev, &mut effects),
            Event::Obstacle(d) => self.on_obstacle(*d, &mut effects),
            Event::Timer(id) => self.on_timer(*id, &mut effects),
            Event::CommandTimeout { id, .. } => self.on_command_timeout(*id, &mut effects),
            Event::Reply { reply, .. } => self.on_reply(*reply, &mut effects),
            Event::Link { .. } | Event::Shutdown => {}
        }
        effects
    }

    // Event handlers -------------------------------------------------------

    fn on_detection(&mut self, ev: &DetectionEvent, effects: &mut Vec<Effect>) {
        if !self.accept_detections {
            tracing::trace!("detection discarded, subscription off");
            return;
        }

        // Mid-pick queue refresh never sends anything, so it is safe even
        // while an ACK is outstanding.
        if let ControlState::PickUpEgg { queue, .. } = &mut self.state {
            if queue.is_empty() {
                *queue = build_queue(&self.behaviour, ev);
                if !queue.is_empty() {
                    tracing::debug!(targets = queue.len(), "pick queue refreshed");
                }
            }
            return;
        }

        if self.awaiting.is_some() {
            return;
        }

        match self.state {
            ControlState::ScanAndMove => {
                if ev.has_center_egg(self.behaviour.center_band) {
                    let queue = build_queue(&self.behaviour, ev);
                    self.send_and_await(
                        CommandKind::Stop,
                        Some(ControlState::PickUpEgg {
                            queue,
                            in_pick: false,
                        }),
                        effects,
                    );
                } else if self.obstacle_near {
                    self.send_and_await(
                        CommandKind::Rotate90,
                        Some(ControlState::TurnFirst),
                        effects,
                    );
                }
            }
            ControlState::ScanOnly => {
                if !ev.detections.is_empty() {
                    let queue = build_queue(&self.behaviour, ev);
                    if !queue.is_empty() {
                        // Already stationary, so no stop command is needed.
                        self.commit(
                            ControlState::PickUpEgg {
                                queue,
                                in_pick: false,
                            },
                            effects,
                        );
                    }
                }
            }
            _ => tracing::debug!(state = %self.state, "detection ignored in this state"),
        }
    }

    fn on_obstacle(&mut self, d: ObstacleDistance, effects: &mut Vec<Effect>) {
        self.obstacle_near = d.cm < self.behaviour.obstacle_stop_cm;
        self.maybe_rotate_for_obstacle(effects);
    }

    fn on_timer(&mut self, id: TimerId, effects: &mut Vec<Effect>) {
        if id == TimerId::CommandRetry {
            self.slow_resend(effects);
            return;
        }
        if self.awaiting.is_some() {
            return;
        }

        match (&self.state, id) {
            // Any first tick wakes the patrol.
            (ControlState::Idle, _) => {
                self.send_and_await(
                    CommandKind::MoveForward,
                    Some(ControlState::ScanAndMove),
                    effects,
                );
            }
            (ControlState::ScanOnly, TimerId::ScanOnlyTimeout) => {
                self.send_and_await(
                    CommandKind::MoveForward,
                    Some(ControlState::MoveOnly),
                    effects,
                );
            }
            (ControlState::MoveOnly, TimerId::MoveOnlyCountdown) => {
                self.send_and_await(
                    CommandKind::Rotate90,
                    Some(ControlState::TurnSecond),
                    effects,
                );
            }
            _ => tracing::trace!(timer = %id, state = %self.state, "timer ignored"),
        }
    }

    fn on_reply(&mut self, reply: PeerReply, effects: &mut Vec<Effect>) {
        match reply {
            PeerReply::Ack { id } => self.on_ack(id, effects),
            PeerReply::ActorStatus {
                motion,
                obstacle_cm,
            } => {
                if let Some(cm) = obstacle_cm {
                    self.obstacle_near = (cm as u32) < self.behaviour.obstacle_stop_cm;
                }
                if self.awaiting.is_some() {
                    return;
                }
                match (&self.state, motion) {
                    (ControlState::TurnFirst, ActorMotion::Idle) => {
                        self.commit(ControlState::ScanOnly, effects);
                    }
                    (ControlState::TurnSecond, ActorMotion::Idle) => {
                        self.send_and_await(
                            CommandKind::MoveForward,
                            Some(ControlState::ScanAndMove),
                            effects,
                        );
                    }
                    (ControlState::TurnFirst | ControlState::TurnSecond, _) => {
                        // Still turning.
                    }
                    _ => self.maybe_rotate_for_obstacle(effects),
                }
            }
            PeerReply::ArmStatus { activity } => {
                if self.awaiting.is_some() || activity != ArmActivity::Done {
                    return;
                }
                let step = match &mut self.state {
                    ControlState::PickUpEgg { queue, in_pick } => {
                        if !*in_pick {
                            PickStep::Ignore
                        } else if let Some(target) = queue.pop_front() {
                            PickStep::SendNext(target)
                        } else {
                            *in_pick = false;
                            PickStep::Finished
                        }
                    }
                    _ => PickStep::Ignore,
                };
                match step {
                    PickStep::SendNext(target) => {
                        self.send_and_await(CommandKind::Pick { target }, None, effects);
                    }
                    PickStep::Finished => {
                        tracing::info!("pick queue drained, resuming sweep");
                        self.send_and_await(
                            CommandKind::MoveForward,
                            Some(ControlState::ScanAndMove),
                            effects,
                        );
                    }
                    PickStep::Ignore => {}
                }
            }
            // Toggles are handled peer-wide by the core, outside the states.
            PeerReply::ControlToggle { .. } => {}
        }
    }

    fn on_ack(&mut self, id: CommandId, effects: &mut Vec<Effect>) {
        let matches = self.awaiting.as_ref().map_or(false, |a| a.id == id);
        if !matches {
            tracing::debug!(command = %id, "unmatched ack");
            return;
        }
        let awaiting = self.awaiting.take().expect("matched above");
        if awaiting.exhausted {
            effects.push(Effect::CancelCountdown(TimerId::CommandRetry));
        }
        tracing::debug!(command = %id, kind = %awaiting.kind, "ack received");
        if let Some(next) = awaiting.then {
            self.commit(next, effects);
        }
    }

    fn on_command_timeout(&mut self, id: CommandId, effects: &mut Vec<Effect>) {
        let Some(awaiting) = self.awaiting.as_mut() else {
            return;
        };
        if awaiting.id != id || awaiting.exhausted {
            return;
        }

        if awaiting.attempt < self.max_send_attempts {
            awaiting.attempt += 1;
            tracing::warn!(
                command = %id,
                kind = %awaiting.kind,
                attempt = awaiting.attempt,
                "ack missing, resending"
            );
            effects.push(Effect::Send {
                id: awaiting.id,
                kind: awaiting.kind,
                attempt: awaiting.attempt,
                track: true,
            });
        } else {
            awaiting.exhausted = true;
            tracing::error!(
                command = %id,
                kind = %awaiting.kind,
                "attempts exhausted, entering slow resend loop"
            );
            effects.push(Effect::StartCountdown(TimerId::CommandRetry));
        }
    }

    /// One lap of the post-exhaustion resend loop
    fn slow_resend(&mut self, effects: &mut Vec<Effect>) {
        let Some(awaiting) = self.awaiting.as_mut() else {
            return;
        };
        if !awaiting.exhausted {
            return;
        }
        awaiting.attempt += 1;
        tracing::warn!(
            command = %awaiting.id,
            kind = %awaiting.kind,
            attempt = awaiting.attempt,
            "slow resend"
        );
        effects.push(Effect::Send {
            id: awaiting.id,
            kind: awaiting.kind,
            attempt: awaiting.attempt,
            track: false,
        });
        effects.push(Effect::StartCountdown(TimerId::CommandRetry));
    }

    // Transitions ----------------------------------------------------------

    /// Send a command and hold until its ACK, then commit `then` (if any)
    fn send_and_await(
        &mut self,
        kind: CommandKind,
        then: Option<ControlState>,
        effects: &mut Vec<Effect>,
    ) {
        debug_assert!(self.awaiting.is_none(), "one in-flight command per peer");
        let id = CommandId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.awaiting = Some(AwaitingAck {
            id,
            kind,
            attempt: 1,
            then,
            exhausted: false,
        });
        effects.push(Effect::Send {
            id,
            kind,
            attempt: 1,
            track: true,
        });
    }

    /// Leave the current state and enter `next`, collecting both effect sets
    fn commit(&mut self, next: ControlState, effects: &mut Vec<Effect>) {
        // Exit effects.
        match &self.state {
            ControlState::ScanOnly => effects.push(Effect::CancelCountdown(TimerId::ScanOnlyTimeout)),
            ControlState::MoveOnly => {
                effects.push(Effect::CancelCountdown(TimerId::MoveOnlyCountdown))
            }
            ControlState::PickUpEgg { .. } => effects.push(Effect::DisableTimer(TimerId::ArmStatus)),
            _ => {}
        }

        tracing::info!(from = %self.state, to = %next, "state transition");
        self.state = next;

        // Enter effects.
        match &self.state {
            ControlState::ScanAndMove => {
                effects.push(Effect::EnableTimer(TimerId::ActorStatus));
                self.accept_detections = true;
            }
            ControlState::PickUpEgg { .. } => {
                effects.push(Effect::DisableTimer(TimerId::ActorStatus));
                effects.push(Effect::EnableTimer(TimerId::ArmStatus));
                self.accept_detections = true;
                self.dispatch_next_pick(effects);
            }
            ControlState::TurnFirst | ControlState::TurnSecond => {
                // actor_status keeps polling so the turn's end is observed.
                self.accept_detections = false;
            }
            ControlState::ScanOnly => {
                effects.push(Effect::StartCountdown(TimerId::ScanOnlyTimeout));
                self.accept_detections = true;
            }
            ControlState::MoveOnly => {
                effects.push(Effect::StartCountdown(TimerId::MoveOnlyCountdown));
                self.accept_detections = false;
            }
            ControlState::Idle => {
                self.accept_detections = false;
            }
        }
    }

    /// Pop the queue head and command the arm; bounce back to the sweep on
    /// an empty queue
    fn dispatch_next_pick(&mut self, effects: &mut Vec<Effect>) {
        let target = match &mut self.state {
            ControlState::PickUpEgg { queue, in_pick } => match queue.pop_front() {
                Some(t) => {
                    *in_pick = true;
                    Some(t)
                }
                None => None,
            },
            _ => return,
        };
        match target {
            Some(target) => {
                self.send_and_await(CommandKind::Pick { target }, None, effects);
            }
            None => {
                tracing::debug!("entered pick state with no viable targets");
                self.send_and_await(
                    CommandKind::MoveForward,
                    Some(ControlState::ScanAndMove),
                    effects,
                );
            }
        }
    }

    fn maybe_rotate_for_obstacle(&mut self, effects: &mut Vec<Effect>) {
        if self.awaiting.is_none() && self.obstacle_near && self.state == ControlState::ScanAndMove
        {
            self.send_and_await(CommandKind::Rotate90, Some(ControlState::TurnFirst), effects);
        }
    }
}

/// Order the frame's detections into a pick queue
///
/// Closest to the robot first: largest y, ties broken by confidence.
fn build_queue(behaviour: &BehaviourConfig, ev: &DetectionEvent) -> VecDeque<Coordinate> {
    let mut candidates: Vec<_> = ev
        .detections
        .iter()
        .filter(|d| d.confidence >= behaviour.min_pick_confidence)
        .collect();
    candidates.sort_by(|a, b| {
        b.center
            .y
            .cmp(&a.center.y)
            .then(
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    candidates.iter().map(|d| d.center).collect()
}
