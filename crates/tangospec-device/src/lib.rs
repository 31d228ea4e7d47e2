//! `tangospec-device` – The Device Classes
//!
//! Wires the core onto attributes and commands of three device classes:
//!
//! | Class | Type | Mirrors |
//! |---|---|---|
//! | `Spec` | [`SpecDevice`] | One session: console output, command execution, variables, and the motor/counter children. |
//! | `SpecMotor` | [`MotorDevice`] | One session motor. |
//! | `SpecCounter` | [`CounterDevice`] | One session counter. |
//!
//! Register all three with [`register_classes`], then create a `Spec`
//! device; it creates its children itself.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tangospec_device::{SPEC_CLASS, register_classes};
//! use tangospec_middleware::{DeviceServer, LocalServer};
//! use tangospec_session::{SimConnector, SimSession};
//! use tangospec_store::{MemoryPropertyStore, PropertyStore};
//!
//! let store = Arc::new(MemoryPropertyStore::new());
//! store
//!     .put_property("id00/spec/fourc", "Spec", &["localhost:fourc".to_string()])
//!     .unwrap();
//! let session = SimSession::builder("localhost:fourc").with_motor("th", 0.0).build().unwrap();
//!
//! let server = LocalServer::new(store);
//! register_classes(&server, Arc::new(SimConnector::new().with_session(session)));
//! server.create_device(SPEC_CLASS, "id00/spec/fourc", None).unwrap();
//! server.shutdown();
//! ```

pub mod counter;
pub mod motor;
pub mod spec;
pub mod state;

use std::sync::Arc;

use tangospec_middleware::{Device, DeviceContext, DeviceServer, LocalServer};
use tangospec_session::{ElementAddress, SessionAddress, SessionConnector};
use tangospec_types::BridgeError;

pub use counter::CounterDevice;
pub use motor::MotorDevice;
pub use spec::{SpecConfig, SpecDevice};
pub use state::StateSwitch;

pub const SPEC_CLASS: &str = "Spec";
pub const MOTOR_CLASS: &str = "SpecMotor";
pub const COUNTER_CLASS: &str = "SpecCounter";

/// Property of a `Spec` device holding its session address.
pub const SPEC_PROPERTY: &str = "Spec";
pub const DEFAULT_SPEC: &str = "localhost:spec";

/// Register the `Spec`, `SpecMotor` and `SpecCounter` classes, all
/// connecting through `connector`.
pub fn register_classes(server: &LocalServer, connector: Arc<dyn SessionConnector>) {
    let c = connector.clone();
    server.register_class(SPEC_CLASS, move |ctx: DeviceContext| -> Arc<dyn Device> {
        SpecDevice::new(ctx, c.clone())
    });
    let c = connector.clone();
    server.register_class(MOTOR_CLASS, move |ctx: DeviceContext| -> Arc<dyn Device> {
        MotorDevice::new(ctx, c.clone())
    });
    server.register_class(COUNTER_CLASS, move |ctx: DeviceContext| -> Arc<dyn Device> {
        CounterDevice::new(ctx, connector.clone())
    });
}

/// First value of a string-list property, `None` when unset or empty.
pub(crate) fn first_value(
    server: &dyn DeviceServer,
    device: &str,
    property: &str,
) -> Result<Option<String>, BridgeError> {
    let values = server.properties().get_property(device, property)?;
    Ok(values
        .and_then(|v| v.into_iter().next())
        .filter(|v| !v.trim().is_empty()))
}

/// Resolve a child's element address.
///
/// A bare mnemonic belongs to the session of the first `Spec` device
/// served by `server`.
pub(crate) fn resolve_element(
    server: &dyn DeviceServer,
    address: &str,
) -> Result<ElementAddress, BridgeError> {
    let parent = match server.devices_of_class(SPEC_CLASS).first() {
        Some(spec) => {
            let value = first_value(server, spec, SPEC_PROPERTY)?;
            SessionAddress::parse(value.as_deref().unwrap_or(DEFAULT_SPEC)).ok()
        }
        None => None,
    };
    ElementAddress::resolve(address, parent.as_ref())
}
