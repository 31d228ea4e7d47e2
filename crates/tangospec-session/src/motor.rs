//! Motor capability.
//!
//! A [`MotorProxy`] is the bridge's only handle onto a session motor.  State
//! changes arrive through a [`MotorListener`] on the session's execution
//! context, never on the caller's.

use std::sync::Arc;

use serde_json::Value;
use tangospec_types::{BridgeError, DevState};

use crate::subscription::Subscription;

/// Motor state as reported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorState {
    NotInitialized,
    Unusable,
    Ready,
    MoveStarted,
    Moving,
    OnLimit,
}

impl MotorState {
    /// Fixed mapping onto the exposed device state.
    pub fn dev_state(&self) -> DevState {
        match self {
            MotorState::NotInitialized | MotorState::Unusable => DevState::Unknown,
            MotorState::Ready => DevState::On,
            MotorState::MoveStarted | MotorState::Moving => DevState::Moving,
            MotorState::OnLimit => DevState::Alarm,
        }
    }
}

/// Software limits of a motor, in user units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorLimits {
    pub low: f64,
    pub high: f64,
}

impl MotorLimits {
    pub fn contains(&self, position: f64) -> bool {
        position >= self.low && position <= self.high
    }
}

/// Callbacks fired by a motor on the session's execution context.
///
/// All methods default to no-ops so listeners implement only what they need.
pub trait MotorListener: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
    fn position_changed(&self, _position: f64) {}
    fn state_changed(&self, _state: MotorState) {}
    /// May fire again while the listener re-reads the limits.
    fn limits_changed(&self) {}
}

/// Handle onto one session motor.
///
/// Every getter is a blocking round trip to the session.
pub trait MotorProxy: Send + Sync {
    fn mnemonic(&self) -> &str;

    fn position(&self) -> Result<f64, BridgeError>;

    fn dial_position(&self) -> Result<f64, BridgeError>;

    /// Start an absolute move.  Returns once the session accepted it.
    fn move_to(&self, target: f64) -> Result<(), BridgeError>;

    fn move_relative(&self, delta: f64) -> Result<(), BridgeError>;

    fn stop(&self) -> Result<(), BridgeError>;

    fn sign(&self) -> Result<i64, BridgeError>;

    fn set_sign(&self, sign: i64) -> Result<(), BridgeError>;

    fn offset(&self) -> Result<f64, BridgeError>;

    fn set_offset(&self, offset: f64) -> Result<(), BridgeError>;

    /// Read a named motor parameter such as `"acceleration"` or
    /// `"high_lim_hit"`.
    fn parameter(&self, name: &str) -> Result<Value, BridgeError>;

    fn set_parameter(&self, name: &str, value: Value) -> Result<(), BridgeError>;

    fn limits(&self) -> Result<MotorLimits, BridgeError>;

    fn state(&self) -> Result<MotorState, BridgeError>;

    fn subscribe(&self, listener: Arc<dyn MotorListener>) -> Result<Subscription, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_table_matches_device_states() {
        assert_eq!(MotorState::NotInitialized.dev_state(), DevState::Unknown);
        assert_eq!(MotorState::Unusable.dev_state(), DevState::Unknown);
        assert_eq!(MotorState::Ready.dev_state(), DevState::On);
        assert_eq!(MotorState::MoveStarted.dev_state(), DevState::Moving);
        assert_eq!(MotorState::Moving.dev_state(), DevState::Moving);
        assert_eq!(MotorState::OnLimit.dev_state(), DevState::Alarm);
    }

    #[test]
    fn limits_are_inclusive() {
        let limits = MotorLimits { low: -1.0, high: 1.0 };
        assert!(limits.contains(-1.0));
        assert!(limits.contains(1.0));
        assert!(!limits.contains(1.0001));
    }
}
