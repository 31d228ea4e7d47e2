//! `tangospec-middleware` – The Plumbing
//!
//! Moves work and notifications between the session's callback thread, the
//! device framework, and remote clients.
//!
//! # Modules
//!
//! - [`dispatcher`] – [`Dispatcher`]: single drain thread through which every
//!   session-originated mutation of device-visible state is funnelled.
//! - [`bus`] – [`EventBus`]: broadcast channel carrying attribute change
//!   events to subscribed clients.
//! - [`framework`] – the device-framework contract ([`DeviceServer`],
//!   [`Device`], [`DynamicAttribute`]) and [`LocalServer`], an in-process
//!   implementation of it.

pub mod bus;
pub mod dispatcher;
pub mod framework;

pub use bus::{DeviceSubscriber, EventBus};
pub use dispatcher::{Dispatcher, Submitter};
pub use framework::{
    AttrInfo, Device, DeviceContext, DeviceFactory, DeviceServer, DynamicAttribute, LocalServer,
    OnCreated, split_device_name,
};
