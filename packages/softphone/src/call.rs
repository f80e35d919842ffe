//! Single-call lifecycle, nested inside a registered session.
//!
//! `Idle → Dialing → (Ringing) → Active → Terminating → Idle`. Dial failures
//! and remote disconnects fall back to `Idle` from wherever the call is.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::PhoneError;
use crate::session::SessionState;
use crate::timers::{Effect, TimerKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    Dialing,
    Ringing,
    Active,
    Terminating,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub state: CallState,
    pub destination: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct CallMachine {
    call: Call,
    /// Monotonic start of the active phase, for the duration display
    active_since: Option<Instant>,
}

impl CallMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn state(&self) -> CallState {
        self.call.state
    }

    /// Validates a dial intent and returns the trimmed destination
    pub fn check_can_dial(
        &self,
        session: SessionState,
        destination: &str,
    ) -> Result<String, PhoneError> {
        if session != SessionState::Registered {
            return Err(PhoneError::NotRegistered);
        }
        if self.call.state != CallState::Idle {
            return Err(PhoneError::InvalidState {
                operation: "dial",
                session,
                call: self.call.state,
            });
        }

        let destination = destination.trim();
        if destination.is_empty() {
            return Err(PhoneError::InvalidInput(
                "destination must not be empty".into(),
            ));
        }
        if destination.chars().any(char::is_whitespace) {
            return Err(PhoneError::InvalidInput(format!(
                "destination {:?} contains whitespace",
                destination
            )));
        }
        Ok(destination.to_string())
    }

    pub fn dialing(&mut self, destination: String) {
        self.call = Call {
            state: CallState::Dialing,
            destination: Some(destination),
            started_at: None,
        };
        self.active_since = None;
    }

    pub fn on_ringing(&mut self) -> bool {
        if self.call.state != CallState::Dialing {
            return false;
        }
        self.call.state = CallState::Ringing;
        true
    }

    pub fn on_established(&mut self, now: Instant, wall: DateTime<Utc>) -> Option<Vec<Effect>> {
        if !matches!(self.call.state, CallState::Dialing | CallState::Ringing) {
            return None;
        }
        self.call.state = CallState::Active;
        self.call.started_at = Some(wall);
        self.active_since = Some(now);
        Some(vec![Effect::Schedule(TimerKind::CallTick)])
    }

    pub fn on_dial_failed(&mut self) -> bool {
        if !matches!(self.call.state, CallState::Dialing | CallState::Ringing) {
            return false;
        }
        self.clear();
        true
    }

    pub fn check_can_hangup(&self, session: SessionState) -> Result<(), PhoneError> {
        if self.call.state != CallState::Active {
            return Err(PhoneError::InvalidState {
                operation: "hang up",
                session,
                call: self.call.state,
            });
        }
        Ok(())
    }

    pub fn terminating(&mut self) -> Vec<Effect> {
        self.call.state = CallState::Terminating;
        vec![Effect::Schedule(TimerKind::ForcedHangup)]
    }

    /// Terminal disconnect from any non-idle state
    pub fn on_disconnected(&mut self) -> Option<Vec<Effect>> {
        if self.call.state == CallState::Idle {
            return None;
        }
        self.clear();
        Some(vec![
            Effect::Cancel(TimerKind::CallTick),
            Effect::Cancel(TimerKind::ForcedHangup),
        ])
    }

    /// Forced-hangup timer: only meaningful while still terminating
    pub fn on_forced_timeout(&mut self) -> Option<Vec<Effect>> {
        if self.call.state != CallState::Terminating {
            return None;
        }
        self.on_disconnected()
    }

    /// Duration tick. Returns elapsed whole seconds and the follow-up effects,
    /// or `None` once the call has left its active phase.
    pub fn tick(&self, now: Instant) -> Option<(u64, Vec<Effect>)> {
        if !matches!(self.call.state, CallState::Active | CallState::Terminating) {
            return None;
        }
        let elapsed = self.elapsed_secs(now)?;
        Some((elapsed, vec![Effect::Schedule(TimerKind::CallTick)]))
    }

    pub fn elapsed_secs(&self, now: Instant) -> Option<u64> {
        self.active_since
            .map(|since| now.saturating_duration_since(since).as_secs())
    }

    pub fn clear(&mut self) {
        self.call = Call::default();
        self.active_since = None;
    }
}

/// `HH:MM:SS`; hours keep growing past 99
pub fn format_elapsed(secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dialing() -> CallMachine {
        let mut machine = CallMachine::new();
        machine.dialing("1003".into());
        machine
    }

    #[test]
    fn dial_requires_registration() {
        let machine = CallMachine::new();
        assert_eq!(
            machine.check_can_dial(SessionState::Connecting, "1003"),
            Err(PhoneError::NotRegistered)
        );
        assert_eq!(
            machine.check_can_dial(SessionState::Registered, " 1003 "),
            Ok("1003".to_string())
        );
    }

    #[test]
    fn dial_rejected_while_call_in_progress() {
        let machine = dialing();
        let err = machine
            .check_can_dial(SessionState::Registered, "1004")
            .unwrap_err();
        assert!(matches!(
            err,
            PhoneError::InvalidState {
                call: CallState::Dialing,
                ..
            }
        ));
    }

    #[test]
    fn dial_rejects_blank_destination() {
        let machine = CallMachine::new();
        for bad in ["", "   ", "10 03"] {
            assert!(matches!(
                machine.check_can_dial(SessionState::Registered, bad),
                Err(PhoneError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn ringing_is_optional() {
        let now = Instant::now();

        let mut direct = dialing();
        assert!(direct.on_established(now, Utc::now()).is_some());
        assert_eq!(direct.state(), CallState::Active);

        let mut via_ringing = dialing();
        assert!(via_ringing.on_ringing());
        assert!(!via_ringing.on_ringing());
        assert_eq!(
            via_ringing.on_established(now, Utc::now()),
            Some(vec![Effect::Schedule(TimerKind::CallTick)])
        );
        assert!(via_ringing.call().started_at.is_some());
    }

    #[test]
    fn established_ignored_when_idle() {
        let mut machine = CallMachine::new();
        assert!(machine.on_established(Instant::now(), Utc::now()).is_none());
        assert_eq!(machine.state(), CallState::Idle);
    }

    #[test]
    fn dial_failure_returns_to_idle() {
        let mut machine = dialing();
        machine.on_ringing();
        assert!(machine.on_dial_failed());
        assert_eq!(machine.call(), &Call::default());

        let mut active = dialing();
        active.on_established(Instant::now(), Utc::now());
        assert!(!active.on_dial_failed());
        assert_eq!(active.state(), CallState::Active);
    }

    #[test]
    fn hangup_only_from_active() {
        let machine = dialing();
        assert!(machine.check_can_hangup(SessionState::Registered).is_err());

        let mut active = dialing();
        active.on_established(Instant::now(), Utc::now());
        assert!(active.check_can_hangup(SessionState::Registered).is_ok());
        assert_eq!(
            active.terminating(),
            vec![Effect::Schedule(TimerKind::ForcedHangup)]
        );
        assert_eq!(active.state(), CallState::Terminating);
    }

    #[test]
    fn disconnect_cancels_call_timers() {
        let mut machine = dialing();
        assert_eq!(
            machine.on_disconnected(),
            Some(vec![
                Effect::Cancel(TimerKind::CallTick),
                Effect::Cancel(TimerKind::ForcedHangup),
            ])
        );
        assert_eq!(machine.state(), CallState::Idle);
        assert!(machine.on_disconnected().is_none());
    }

    #[test]
    fn forced_timeout_only_while_terminating() {
        let mut active = dialing();
        active.on_established(Instant::now(), Utc::now());
        assert!(active.on_forced_timeout().is_none());

        active.terminating();
        assert!(active.on_forced_timeout().is_some());
        assert_eq!(active.state(), CallState::Idle);
    }

    #[test]
    fn tick_reports_elapsed_time() {
        let start = Instant::now();
        let mut machine = dialing();
        assert!(machine.tick(start).is_none());

        machine.on_established(start, Utc::now());
        let (elapsed, effects) = machine.tick(start).unwrap();
        assert_eq!(elapsed, 0);
        assert_eq!(effects, vec![Effect::Schedule(TimerKind::CallTick)]);

        let (elapsed, _) = machine.tick(start + Duration::from_millis(61_500)).unwrap();
        assert_eq!(elapsed, 61);

        machine.clear();
        assert!(machine.tick(start).is_none());
        assert!(machine.elapsed_secs(start).is_none());
    }

    #[test]
    fn format_elapsed_pads_fields() {
        assert_eq!(format_elapsed(0), "00:00:00");
        assert_eq!(format_elapsed(5), "00:00:05");
        assert_eq!(format_elapsed(61), "00:01:01");
        assert_eq!(format_elapsed(3_725), "01:02:05");
        assert_eq!(format_elapsed(360_000), "100:00:00");
    }
}
