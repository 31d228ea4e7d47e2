//! `tangospec-types` – shared vocabulary of the SPEC bridge.
//!
//! Every other crate in the workspace speaks in these types: the kinds of
//! element a session exposes, the device states and attribute qualities a
//! client observes, the wire values that cross the device boundary, and the
//! single [`BridgeError`] taxonomy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The kind of remote element a session exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Motor,
    Counter,
    Variable,
    /// The session's console output stream (`output/tty`).
    Tty,
    /// A free-form command channel.
    Command,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Motor => "motor",
            ElementKind::Counter => "counter",
            ElementKind::Variable => "variable",
            ElementKind::Tty => "tty",
            ElementKind::Command => "command",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one remote element inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionElementHandle {
    pub kind: ElementKind,
    /// Session-side short name, e.g. `"tth"`.
    pub mnemonic: String,
    /// `host:session` of the owning session, e.g. `"localhost:fourc"`.
    pub session_address: String,
}

impl SessionElementHandle {
    pub fn new(
        kind: ElementKind,
        mnemonic: impl Into<String>,
        session_address: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            mnemonic: mnemonic.into(),
            session_address: session_address.into(),
        }
    }
}

impl fmt::Display for SessionElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_address, self.mnemonic)
    }
}

/// Externally visible device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DevState {
    On,
    Off,
    Init,
    Moving,
    Running,
    Alarm,
    Fault,
    Unknown,
}

impl DevState {
    /// States that must be reported at error severity when entered.
    pub fn is_alarm_like(&self) -> bool {
        matches!(self, DevState::Alarm | DevState::Unknown | DevState::Fault)
    }
}

impl fmt::Display for DevState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DevState::On => "ON",
            DevState::Off => "OFF",
            DevState::Init => "INIT",
            DevState::Moving => "MOVING",
            DevState::Running => "RUNNING",
            DevState::Alarm => "ALARM",
            DevState::Fault => "FAULT",
            DevState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Quality attached to an attribute value or change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttrQuality {
    #[default]
    Valid,
    /// The value is in transit (motor moving, counter counting).
    Changing,
}

/// Access mode of an exposed attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrAccess {
    Read,
    ReadWrite,
}

/// Declared type of an exposed attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireType {
    Boolean,
    Long,
    Double,
    String,
    State,
    BooleanArray,
    LongArray,
    DoubleArray,
    StringArray,
}

impl WireType {
    /// Sequence types have an unbounded wire size.
    pub fn is_sequence(&self) -> bool {
        matches!(
            self,
            WireType::BooleanArray | WireType::LongArray | WireType::DoubleArray | WireType::StringArray
        )
    }
}

/// A value as it crosses the device boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum WireValue {
    /// No value (commands without argument or result).
    Void,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    State(DevState),
    BooleanArray(Vec<bool>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl WireValue {
    /// The declared type matching this value, `None` for [`WireValue::Void`].
    pub fn wire_type(&self) -> Option<WireType> {
        Some(match self {
            WireValue::Void => return None,
            WireValue::Boolean(_) => WireType::Boolean,
            WireValue::Long(_) => WireType::Long,
            WireValue::Double(_) => WireType::Double,
            WireValue::String(_) => WireType::String,
            WireValue::State(_) => WireType::State,
            WireValue::BooleanArray(_) => WireType::BooleanArray,
            WireValue::LongArray(_) => WireType::LongArray,
            WireValue::DoubleArray(_) => WireType::DoubleArray,
            WireValue::StringArray(_) => WireType::StringArray,
        })
    }

    pub fn as_f64(&self) -> Result<f64, BridgeError> {
        match self {
            WireValue::Double(v) => Ok(*v),
            WireValue::Long(v) => Ok(*v as f64),
            other => Err(BridgeError::InvalidValue(format!("expected a number, got {other}"))),
        }
    }

    pub fn as_i64(&self) -> Result<i64, BridgeError> {
        match self {
            WireValue::Long(v) => Ok(*v),
            WireValue::Double(v) if v.fract() == 0.0 => Ok(*v as i64),
            other => Err(BridgeError::InvalidValue(format!("expected an integer, got {other}"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, BridgeError> {
        match self {
            WireValue::Boolean(v) => Ok(*v),
            other => Err(BridgeError::InvalidValue(format!("expected a boolean, got {other}"))),
        }
    }

    pub fn as_str(&self) -> Result<&str, BridgeError> {
        match self {
            WireValue::String(v) => Ok(v),
            other => Err(BridgeError::InvalidValue(format!("expected a string, got {other}"))),
        }
    }

    /// Accept either a single string or a string sequence.
    pub fn into_strings(self) -> Result<Vec<String>, BridgeError> {
        match self {
            WireValue::String(v) => Ok(vec![v]),
            WireValue::StringArray(v) => Ok(v),
            other => Err(BridgeError::InvalidValue(format!("expected strings, got {other}"))),
        }
    }
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str("]")
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Void => f.write_str("<void>"),
            WireValue::Boolean(v) => write!(f, "{v}"),
            WireValue::Long(v) => write!(f, "{v}"),
            WireValue::Double(v) => write!(f, "{v}"),
            WireValue::String(v) => f.write_str(v),
            WireValue::State(v) => write!(f, "{v}"),
            WireValue::BooleanArray(v) => join(f, v),
            WireValue::LongArray(v) => join(f, v),
            WireValue::DoubleArray(v) => join(f, v),
            WireValue::StringArray(v) => join(f, v),
        }
    }
}

/// An attribute change notification emitted by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Full device name, e.g. `"id00/spec/fourc"`.
    pub device: String,
    pub attribute: String,
    pub value: WireValue,
    pub quality: AttrQuality,
}

impl ChangeEvent {
    pub fn new(
        device: impl Into<String>,
        attribute: impl Into<String>,
        value: WireValue,
        quality: AttrQuality,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            device: device.into(),
            attribute: attribute.into(),
            value,
            quality,
        }
    }
}

/// Error taxonomy shared by the whole bridge.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    /// Session unreachable or timed out at bind time.
    #[error("Error connecting to {address}: {details}")]
    Connection { address: String, details: String },

    #[error("Invalid spec '{0}'. Must be in format <host>:<spec session>")]
    InvalidAddress(String),

    #[error("'{0}' is already defined")]
    DuplicateBinding(String),

    /// Reply requested for a command id that is not tracked.
    #[error("Unknown command id {0}")]
    UnknownId(u64),

    /// Abort requested for a command id that is not tracked.
    #[error("Command {0} not being run")]
    NotRunning(u64),

    #[error("No {kind} with name '{name}'")]
    NotFound { kind: String, name: String },

    /// The session raised while executing a command.
    #[error("{0}")]
    TaskFailure(String),

    #[error("Command '{0}' aborted")]
    Aborted(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Property store error: {0}")]
    Store(String),

    #[error("Device framework error: {0}")]
    Framework(String),

    #[error("{0} is not connected")]
    NotConnected(String),
}

impl BridgeError {
    pub fn connection(address: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::Connection {
            address: address.into(),
            details: details.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        BridgeError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_display_joins_session_and_mnemonic() {
        let handle = SessionElementHandle::new(ElementKind::Motor, "tth", "localhost:fourc");
        assert_eq!(handle.to_string(), "localhost:fourc:tth");
    }

    #[test]
    fn alarm_like_states() {
        assert!(DevState::Alarm.is_alarm_like());
        assert!(DevState::Fault.is_alarm_like());
        assert!(DevState::Unknown.is_alarm_like());
        assert!(!DevState::On.is_alarm_like());
        assert!(!DevState::Moving.is_alarm_like());
    }

    #[test]
    fn wire_value_numeric_coercion() {
        assert_eq!(WireValue::Long(3).as_f64().unwrap(), 3.0);
        assert_eq!(WireValue::Double(4.0).as_i64().unwrap(), 4);
        assert!(WireValue::Double(4.5).as_i64().is_err());
        assert!(WireValue::String("x".into()).as_f64().is_err());
    }

    #[test]
    fn wire_value_display_for_sequences() {
        let v = WireValue::StringArray(vec!["a".into(), "b".into()]);
        assert_eq!(v.to_string(), "[a, b]");
        assert_eq!(WireValue::State(DevState::Moving).to_string(), "MOVING");
    }

    #[test]
    fn sequence_types_are_flagged() {
        assert!(WireType::DoubleArray.is_sequence());
        assert!(!WireType::String.is_sequence());
        assert_eq!(
            WireValue::LongArray(vec![1]).wire_type(),
            Some(WireType::LongArray)
        );
        assert_eq!(WireValue::Void.wire_type(), None);
    }

    #[test]
    fn change_event_roundtrip() {
        let event = ChangeEvent::new(
            "id00/spec/fourc",
            "Output",
            WireValue::String("1.FOURC> ".into()),
            AttrQuality::Valid,
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.value, event.value);
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::not_found("motor", "chi");
        assert_eq!(err.to_string(), "No motor with name 'chi'");

        let err = BridgeError::InvalidAddress("nohost".into());
        assert!(err.to_string().contains("<host>:<spec session>"));

        assert_ne!(BridgeError::UnknownId(3), BridgeError::NotRunning(3));
    }
}
