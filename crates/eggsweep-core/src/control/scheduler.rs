//! Command scheduler: timer registry and pending-command table
//!
//! Tick-driven rather than thread-per-timer so every deadline is computed
//! on the abstract clock. Periodic timers reschedule from their previous
//! fire time (`next += period`), never from `now`, so poll cadence does not
//! drift under a slow loop iteration.

use std::collections::HashMap;
use std::fmt;

use crate::config::SchedulerConfig;
use crate::protocol::{CommandId, Peer};

/// Logical timer names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Periodic actor status poll
    ActorStatus,
    /// Periodic arm status poll
    ArmStatus,
    /// One-shot: give up scanning in place
    ScanOnlyTimeout,
    /// One-shot: stop the blind forward leg
    MoveOnlyCountdown,
    /// One-shot: slow resend loop after ACK attempts are exhausted
    CommandRetry,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerId::ActorStatus => "actor_status",
            TimerId::ArmStatus => "arm_status",
            TimerId::ScanOnlyTimeout => "scan_only_timeout",
            TimerId::MoveOnlyCountdown => "move_only_countdown",
            TimerId::CommandRetry => "command_retry",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Periodic,
    Countdown,
}

#[derive(Debug)]
struct TimerEntry {
    id: TimerId,
    kind: TimerKind,
    period_ms: u64,
    next_fire_at: u64,
    enabled: bool,
}

/// A command awaiting its ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub peer: Peer,
    pub sent_at: u64,
    pub timeout_ms: u64,
    pub attempt: u32,
}

/// Something that came due on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Due {
    Timer(TimerId),
    CommandTimeout {
        id: CommandId,
        peer: Peer,
        attempt: u32,
    },
}

/// Timer registry plus pending-command table
pub struct CommandScheduler {
    /// Fixed registry order keeps tick output deterministic
    timers: Vec<TimerEntry>,
    pending: HashMap<CommandId, PendingCommand>,
    now_ms: u64,
}

impl CommandScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let entry = |id, kind, period_ms| TimerEntry {
            id,
            kind,
            period_ms,
            next_fire_at: 0,
            enabled: false,
        };
        Self {
            timers: vec![
                entry(
                    TimerId::ActorStatus,
                    TimerKind::Periodic,
                    config.actor_status_period_ms,
                ),
                entry(
                    TimerId::ArmStatus,
                    TimerKind::Periodic,
                    config.arm_status_period_ms,
                ),
                entry(
                    TimerId::ScanOnlyTimeout,
                    TimerKind::Countdown,
                    config.scan_only_timeout_ms,
                ),
                entry(
                    TimerId::MoveOnlyCountdown,
                    TimerKind::Countdown,
                    config.move_only_countdown_ms,
                ),
                entry(
                    TimerId::CommandRetry,
                    TimerKind::Countdown,
                    config.command_retry_ms,
                ),
            ],
            pending: HashMap::new(),
            now_ms: 0,
        }
    }

    fn timer_mut(&mut self, id: TimerId) -> &mut TimerEntry {
        self.timers
            .iter_mut()
            .find(|t| t.id == id)
            .expect("all timer ids are registered at construction")
    }

    /// Enable a periodic timer; a no-op if already running
    pub fn enable_timer(&mut self, id: TimerId) {
        let now = self.now_ms;
        let t = self.timer_mut(id);
        if t.enabled {
            return;
        }
        t.enabled = true;
        t.next_fire_at = now + t.period_ms;
        tracing::debug!(timer = %id, "timer enabled");
    }

    /// Disable a timer; a no-op if not running
    pub fn disable_timer(&mut self, id: TimerId) {
        let t = self.timer_mut(id);
        if t.enabled {
            t.enabled = false;
            tracing::debug!(timer = %id, "timer disabled");
        }
    }

    /// Arm a one-shot with its configured duration, resetting any prior run
    pub fn start_countdown(&mut self, id: TimerId) {
        let duration = self.timer_mut(id).period_ms;
        self.start_countdown_for(id, duration);
    }

    /// Arm a one-shot with an explicit duration, resetting any prior run
    pub fn start_countdown_for(&mut self, id: TimerId, duration_ms: u64) {
        let now = self.now_ms;
        let t = self.timer_mut(id);
        t.enabled = true;
        t.next_fire_at = now + duration_ms;
        tracing::debug!(timer = %id, duration_ms, "countdown started");
    }

    /// Cancel a one-shot before it fires
    pub fn cancel_countdown(&mut self, id: TimerId) {
        self.disable_timer(id);
    }

    pub fn timer_enabled(&self, id: TimerId) -> bool {
        self.timers
            .iter()
            .find(|t| t.id == id)
            .map_or(false, |t| t.enabled)
    }

    /// Track a sent command until its ACK or deadline
    pub fn register_pending(&mut self, id: CommandId, peer: Peer, timeout_ms: u64, attempt: u32) {
        self.pending.insert(
            id,
            PendingCommand {
                peer,
                sent_at: self.now_ms,
                timeout_ms,
                attempt,
            },
        );
    }

    /// Clear a pending command; `None` if it was not tracked
    pub fn ack(&mut self, id: CommandId) -> Option<PendingCommand> {
        self.pending.remove(&id)
    }

    /// Number of ACK-tracked commands in flight toward a peer
    pub fn in_flight(&self, peer: Peer) -> usize {
        self.pending.values().filter(|p| p.peer == peer).count()
    }

    /// Advance the clock and collect everything that came due
    pub fn tick(&mut self, now_ms: u64) -> Vec<Due> {
        self.now_ms = now_ms;
        let mut due = Vec::new();

        for t in &mut self.timers {
            while t.enabled && t.next_fire_at <= now_ms {
                due.push(Due::Timer(t.id));
                match t.kind {
                    TimerKind::Periodic => t.next_fire_at += t.period_ms,
                    TimerKind::Countdown => t.enabled = false,
                }
            }
        }

        let mut expired: Vec<CommandId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_at + p.timeout_ms <= now_ms)
            .map(|(&id, _)| id)
            .collect();
        expired.sort();
        for id in expired {
            let p = self.pending.remove(&id).expect("collected above");
            tracing::warn!(command = %id, peer = %p.peer, attempt = p.attempt, "command timed out");
            due.push(Due::CommandTimeout {
                id,
                peer: p.peer,
                attempt: p.attempt,
            });
        }

        due
    }

    /// Earliest upcoming deadline, for bounding the event-loop wait
    pub fn next_deadline(&self) -> Option<u64> {
        let timer = self
            .timers
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.next_fire_at)
            .min();
        let pending = self
            .pending
            .values()
            .map(|p| p.sent_at + p.timeout_ms)
            .min();
        match (timer, pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Disable every timer (shutdown path)
    pub fn disable_all(&mut self) {
        for t in &mut self.timers {
            t.enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> CommandScheduler {
        CommandScheduler::new(&SchedulerConfig::default())
    }

    #[test]
    fn test_periodic_timer_fires_on_schedule() {
        let mut s = scheduler();
        s.tick(0);
        s.enable_timer(TimerId::ActorStatus);

        assert!(s.tick(999).is_empty());
        assert_eq!(s.tick(1000), vec![Due::Timer(TimerId::ActorStatus)]);
        assert_eq!(s.tick(2000), vec![Due::Timer(TimerId::ActorStatus)]);
    }

    #[test]
    fn test_periodic_timer_does_not_drift() {
        let mut s = scheduler();
        s.tick(0);
        s.enable_timer(TimerId::ActorStatus);

        // A late tick: the next fire stays anchored to the schedule.
        assert_eq!(s.tick(1300), vec![Due::Timer(TimerId::ActorStatus)]);
        assert_eq!(s.tick(2000), vec![Due::Timer(TimerId::ActorStatus)]);
    }

    #[test]
    fn test_enable_is_idempotent() {
        let mut s = scheduler();
        s.tick(0);
        s.enable_timer(TimerId::ActorStatus);
        s.tick(600);
        s.enable_timer(TimerId::ActorStatus);
        // Re-enabling must not push the deadline out.
        assert_eq!(s.tick(1000), vec![Due::Timer(TimerId::ActorStatus)]);
    }

    #[test]
    fn test_countdown_fires_once() {
        let mut s = scheduler();
        s.tick(0);
        s.start_countdown(TimerId::ScanOnlyTimeout);

        assert!(s.tick(4999).is_empty());
        assert_eq!(s.tick(5000), vec![Due::Timer(TimerId::ScanOnlyTimeout)]);
        assert!(s.tick(10000).is_empty());
    }

    #[test]
    fn test_countdown_restart_resets_deadline() {
        let mut s = scheduler();
        s.tick(0);
        s.start_countdown(TimerId::MoveOnlyCountdown);
        s.tick(3000);
        s.start_countdown(TimerId::MoveOnlyCountdown);

        assert!(s.tick(5000).is_empty());
        assert_eq!(s.tick(8000), vec![Due::Timer(TimerId::MoveOnlyCountdown)]);
    }

    #[test]
    fn test_cancelled_countdown_never_fires() {
        let mut s = scheduler();
        s.tick(0);
        s.start_countdown(TimerId::ScanOnlyTimeout);
        s.cancel_countdown(TimerId::ScanOnlyTimeout);
        assert!(s.tick(10000).is_empty());
    }

    #[test]
    fn test_pending_command_times_out() {
        let mut s = scheduler();
        s.tick(0);
        s.register_pending(CommandId(1), Peer::Actor, 5000, 1);
        assert_eq!(s.in_flight(Peer::Actor), 1);

        assert!(s.tick(4999).is_empty());
        assert_eq!(
            s.tick(5000),
            vec![Due::CommandTimeout {
                id: CommandId(1),
                peer: Peer::Actor,
                attempt: 1,
            }]
        );
        assert_eq!(s.in_flight(Peer::Actor), 0);
    }

    #[test]
    fn test_ack_clears_pending() {
        let mut s = scheduler();
        s.tick(0);
        s.register_pending(CommandId(1), Peer::Arm, 5000, 1);
        assert!(s.ack(CommandId(1)).is_some());
        assert!(s.ack(CommandId(1)).is_none());
        assert!(s.tick(10000).is_empty());
    }

    #[test]
    fn test_next_deadline_tracks_minimum() {
        let mut s = scheduler();
        s.tick(0);
        assert_eq!(s.next_deadline(), None);

        s.enable_timer(TimerId::ActorStatus);
        assert_eq!(s.next_deadline(), Some(1000));

        s.register_pending(CommandId(3), Peer::Actor, 400, 1);
        assert_eq!(s.next_deadline(), Some(400));
    }

    #[test]
    fn test_disable_all() {
        let mut s = scheduler();
        s.tick(0);
        s.enable_timer(TimerId::ActorStatus);
        s.start_countdown(TimerId::ScanOnlyTimeout);
        s.disable_all();
        assert!(s.tick(10000).is_empty());
        assert_eq!(s.next_deadline(), None);
    }
}
