//! Counter capability.

use std::fmt;
use std::sync::Arc;

use tangospec_types::{BridgeError, DevState};

use crate::subscription::Subscription;

/// Counter state as reported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterState {
    NotInitialized,
    NotCounting,
    Counting,
}

impl CounterState {
    pub fn dev_state(&self) -> DevState {
        match self {
            CounterState::NotInitialized => DevState::Unknown,
            CounterState::NotCounting => DevState::On,
            CounterState::Counting => DevState::Running,
        }
    }
}

/// Role a counter plays in the session's counting chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CounterType {
    #[default]
    Unknown,
    Scaler,
    Timer,
    Monitor,
}

impl fmt::Display for CounterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CounterType::Unknown => "Unknown",
            CounterType::Scaler => "Scaler",
            CounterType::Timer => "Timer",
            CounterType::Monitor => "Monitor",
        };
        f.write_str(s)
    }
}

/// Callbacks fired by a counter on the session's execution context.
pub trait CounterListener: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
    fn value_changed(&self, _value: f64) {}
    fn state_changed(&self, _state: CounterState) {}
}

/// Handle onto one session counter.
pub trait CounterProxy: Send + Sync {
    fn mnemonic(&self) -> &str;

    fn value(&self) -> Result<f64, BridgeError>;

    /// Start counting for `seconds`.  Returns once the session accepted it.
    fn count(&self, seconds: f64) -> Result<(), BridgeError>;

    fn stop(&self) -> Result<(), BridgeError>;

    fn set_enabled(&self, enabled: bool) -> Result<(), BridgeError>;

    fn counter_type(&self) -> Result<CounterType, BridgeError>;

    fn state(&self) -> Result<CounterState, BridgeError>;

    fn subscribe(&self, listener: Arc<dyn CounterListener>) -> Result<Subscription, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_table_matches_device_states() {
        assert_eq!(CounterState::NotInitialized.dev_state(), DevState::Unknown);
        assert_eq!(CounterState::NotCounting.dev_state(), DevState::On);
        assert_eq!(CounterState::Counting.dev_state(), DevState::Running);
    }

    #[test]
    fn counter_type_names() {
        assert_eq!(CounterType::Monitor.to_string(), "Monitor");
        assert_eq!(CounterType::default().to_string(), "Unknown");
    }
}
