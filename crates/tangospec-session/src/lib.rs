//! `tangospec-session` – capability-typed handles onto a SPEC session.
//!
//! The bridge never speaks the session protocol itself.  It talks to the
//! traits in this crate, one per element kind, and receives callbacks on the
//! session's own execution context.
//!
//! # Modules
//!
//! - [`address`] – `host:session` and `host:session:mnemonic` parsing.
//! - [`motor`] – [`MotorProxy`] / [`MotorListener`] and the motor state table.
//! - [`counter`] – [`CounterProxy`] / [`CounterListener`] and the counter
//!   state table.
//! - [`variable`] – [`VariableProxy`] for named session variables.
//! - [`tty`] – [`TtyProxy`] for the console output stream.
//! - [`command`] – [`CommandChannel`] for free-form commands.
//! - [`session`] – [`Session`] and [`SessionConnector`], the entry points
//!   that hand out the proxies above.
//! - [`subscription`] – RAII [`Subscription`] guard returned by every
//!   `subscribe` call.
//! - [`sim`] – [`SimSession`], an in-process session used by tests and the
//!   demo console.

pub mod address;
pub mod command;
pub mod counter;
pub mod motor;
pub mod session;
pub mod sim;
pub mod subscription;
pub mod tty;
pub mod variable;

pub use address::{ElementAddress, SessionAddress};
pub use command::CommandChannel;
pub use counter::{CounterListener, CounterProxy, CounterState, CounterType};
pub use motor::{MotorLimits, MotorListener, MotorProxy, MotorState};
pub use session::{CONNECT_TIMEOUT, Session, SessionConnector};
pub use sim::{SimConnector, SimSession};
pub use subscription::Subscription;
pub use tty::{OutputCallback, OutputChunk, TtyProxy};
pub use variable::{UpdateCallback, VariableProxy};
