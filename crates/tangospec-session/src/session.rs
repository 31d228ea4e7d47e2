//! Session entry points.

use std::sync::Arc;
use std::time::Duration;

use tangospec_types::BridgeError;

use crate::address::SessionAddress;
use crate::command::CommandChannel;
use crate::counter::CounterProxy;
use crate::motor::MotorProxy;
use crate::tty::TtyProxy;
use crate::variable::VariableProxy;

/// Timeout used when a device first connects to its session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A connected session, handing out proxies onto its elements.
pub trait Session: Send + Sync {
    fn address(&self) -> &SessionAddress;

    /// Mnemonics of every motor currently configured in the session.
    fn motor_mnemonics(&self) -> Result<Vec<String>, BridgeError>;

    /// Mnemonics of every counter currently configured in the session.
    fn counter_mnemonics(&self) -> Result<Vec<String>, BridgeError>;

    /// # Errors
    ///
    /// [`BridgeError::NotFound`] when the session has no such motor.
    fn motor(&self, mnemonic: &str) -> Result<Arc<dyn MotorProxy>, BridgeError>;

    /// # Errors
    ///
    /// [`BridgeError::NotFound`] when the session has no such counter.
    fn counter(&self, mnemonic: &str) -> Result<Arc<dyn CounterProxy>, BridgeError>;

    fn variable(&self, name: &str) -> Result<Arc<dyn VariableProxy>, BridgeError>;

    fn tty(&self) -> Result<Arc<dyn TtyProxy>, BridgeError>;

    /// Open a fresh command channel.
    fn command_channel(&self) -> Result<Arc<dyn CommandChannel>, BridgeError>;
}

/// Opens sessions by address.
pub trait SessionConnector: Send + Sync {
    /// # Errors
    ///
    /// [`BridgeError::Connection`] when the session is unreachable within
    /// `timeout`.
    fn connect(
        &self,
        address: &SessionAddress,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, BridgeError>;
}
