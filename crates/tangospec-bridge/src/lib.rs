//! `tangospec-bridge` – The Core
//!
//! Everything between a session's callbacks and a device's attributes and
//! commands that is not specific to one device class.
//!
//! # Modules
//!
//! - [`history`] – [`CommandHistory`]: bounded, adjacent-deduplicated log of
//!   executed command texts.
//! - [`commands`] – [`CommandRegistry`]: synchronous and asynchronous command
//!   execution with reply polling and abort.
//! - [`variables`] – [`VariableBindingTable`]: session variables exposed as
//!   dynamic attributes, with their codecs.
//! - [`output`] – [`OutputLineAssembler`]: turns raw console chunks into a
//!   bounded buffer of lines.
//! - [`reconcile`] – [`InventoryDiff`] and [`reconcile()`]: mirror the session's
//!   motor/counter inventory as child devices.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: logging and
//!   optional OTLP export.

pub mod commands;
pub mod history;
pub mod output;
pub mod reconcile;
pub mod telemetry;
pub mod variables;

pub use commands::{CommandRegistry, CommandState};
pub use history::CommandHistory;
pub use output::OutputLineAssembler;
pub use reconcile::{InventoryDiff, InventoryTarget, ReconcilePlan, ReconcileReport, reconcile};
pub use variables::{Codec, TypeTag, VariableBindingTable, VariableSpec};
