//! Named session variable capability.

use serde_json::Value;
use tangospec_types::BridgeError;

use crate::subscription::Subscription;

/// Invoked with the new value whenever the session variable changes.
pub type UpdateCallback = Box<dyn Fn(Value) + Send + Sync>;

/// Handle onto one named session variable.
///
/// Session variables are dynamically typed; values travel as JSON.
pub trait VariableProxy: Send + Sync {
    fn name(&self) -> &str;

    /// Blocking read of the current value.
    fn value(&self) -> Result<Value, BridgeError>;

    /// Blocking write.
    fn set_value(&self, value: Value) -> Result<(), BridgeError>;

    fn subscribe(&self, on_update: UpdateCallback) -> Result<Subscription, BridgeError>;
}
