//! The device-framework contract and an in-process implementation.
//!
//! Devices are written against [`DeviceServer`]; they never see how
//! attributes are served or events delivered.  [`LocalServer`] is the
//! in-process server used by the console binary and the test-suite:
//!
//! * device classes are registered with a [`DeviceFactory`];
//! * every device gets a reentrant monitor which serialises attribute reads,
//!   attribute writes and change-event pushes for that device;
//! * change events go out on an [`EventBus`];
//! * properties and aliases live in a [`PropertyStore`].
//!
//! No registry lock is held while a factory, an `init`/`delete` hook, an
//! attribute hook or a creation callback runs, so devices may freely call
//! back into the server (e.g. to create child devices from a command).
//!
//! Devices hold an `Arc` onto the server; call [`LocalServer::shutdown`] to
//! tear every device down and release them.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tangospec_store::PropertyStore;
use tangospec_types::{AttrAccess, AttrQuality, BridgeError, ChangeEvent, WireType, WireValue};
use tracing::{debug, info, warn};

use crate::bus::EventBus;

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Declaration of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrInfo {
    pub name: String,
    pub wire_type: WireType,
    pub access: AttrAccess,
}

impl AttrInfo {
    pub fn new(name: impl Into<String>, wire_type: WireType, access: AttrAccess) -> Self {
        Self {
            name: name.into(),
            wire_type,
            access,
        }
    }

    pub fn read_only(name: impl Into<String>, wire_type: WireType) -> Self {
        Self::new(name, wire_type, AttrAccess::Read)
    }

    pub fn read_write(name: impl Into<String>, wire_type: WireType) -> Self {
        Self::new(name, wire_type, AttrAccess::ReadWrite)
    }
}

/// Read/write hooks of an attribute added at runtime.
pub trait DynamicAttribute: Send + Sync {
    fn read(&self) -> Result<WireValue, BridgeError>;

    fn write(&self, _value: WireValue) -> Result<(), BridgeError> {
        Err(BridgeError::InvalidValue("attribute is read-only".to_string()))
    }
}

/// A device instance served by a [`DeviceServer`].
///
/// `init` and `delete` never fail: a device that cannot initialise reports
/// it through its own state and status.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn class(&self) -> &str;

    fn init(&self);

    fn delete(&self);

    /// Statically declared attributes.
    fn attributes(&self) -> Vec<AttrInfo>;

    fn read_attribute(&self, name: &str) -> Result<WireValue, BridgeError>;

    fn write_attribute(&self, name: &str, value: WireValue) -> Result<(), BridgeError>;

    fn commands(&self) -> Vec<&'static str>;

    fn command(&self, name: &str, arg: WireValue) -> Result<WireValue, BridgeError>;
}

/// Everything a factory needs to build a device.
pub struct DeviceContext {
    pub name: String,
    pub class: String,
    pub server: Arc<dyn DeviceServer>,
}

pub type DeviceFactory = dyn Fn(DeviceContext) -> Arc<dyn Device> + Send + Sync;

/// Invoked with the new device's name after it is registered in the
/// database and before it initialises.
pub type OnCreated = Box<dyn FnOnce(&str) -> Result<(), BridgeError> + Send>;

/// The operations a device may ask of its framework.
pub trait DeviceServer: Send + Sync {
    /// Allow (or stop) change events for `attr` of `device`.
    fn set_change_event(&self, device: &str, attr: &str, enabled: bool);

    /// # Errors
    ///
    /// [`BridgeError::Framework`] when change events are not enabled for the
    /// attribute or the device is gone.
    fn push_change_event(
        &self,
        device: &str,
        attr: &str,
        value: WireValue,
        quality: AttrQuality,
    ) -> Result<(), BridgeError>;

    fn add_dynamic_attribute(
        &self,
        device: &str,
        info: AttrInfo,
        hooks: Arc<dyn DynamicAttribute>,
    ) -> Result<(), BridgeError>;

    fn remove_dynamic_attribute(&self, device: &str, name: &str) -> Result<(), BridgeError>;

    fn create_device(
        &self,
        class: &str,
        name: &str,
        on_created: Option<OnCreated>,
    ) -> Result<(), BridgeError>;

    /// Tear the device down and drop it, with its properties and aliases,
    /// from the database.
    fn delete_device(&self, class: &str, name: &str) -> Result<(), BridgeError>;

    /// Names of every live device of `class`, sorted.
    fn devices_of_class(&self, class: &str) -> Vec<String>;

    fn properties(&self) -> Arc<dyn PropertyStore>;
}

/// Split `domain/family/member`, rejecting anything else.
pub fn split_device_name(name: &str) -> Result<(&str, &str, &str), BridgeError> {
    let mut parts = name.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(d), Some(f), Some(m), None) if !d.is_empty() && !f.is_empty() && !m.is_empty() => {
            Ok((d, f, m))
        }
        _ => Err(BridgeError::Framework(format!(
            "invalid device name '{name}', expected domain/family/member"
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LocalServer
// ─────────────────────────────────────────────────────────────────────────────

struct DeviceEntry {
    class: String,
    device: Arc<dyn Device>,
    monitor: Arc<ReentrantMutex<()>>,
}

struct DynamicEntry {
    info: AttrInfo,
    hooks: Arc<dyn DynamicAttribute>,
}

#[derive(Default)]
struct Registry {
    devices: BTreeMap<String, DeviceEntry>,
    dynamic: BTreeMap<String, BTreeMap<String, DynamicEntry>>,
    events: HashSet<(String, String)>,
}

fn key(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// In-process [`DeviceServer`].
pub struct LocalServer {
    self_ref: Weak<LocalServer>,
    classes: Mutex<BTreeMap<String, Arc<DeviceFactory>>>,
    registry: Mutex<Registry>,
    store: Arc<dyn PropertyStore>,
    bus: EventBus,
}

impl LocalServer {
    pub fn new(store: Arc<dyn PropertyStore>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            classes: Mutex::new(BTreeMap::new()),
            registry: Mutex::new(Registry::default()),
            store,
            bus: EventBus::default(),
        })
    }

    /// Register the factory for `class`, replacing any earlier one.
    pub fn register_class(
        &self,
        class: &str,
        factory: impl Fn(DeviceContext) -> Arc<dyn Device> + Send + Sync + 'static,
    ) {
        self.classes.lock().insert(class.to_string(), Arc::new(factory));
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn device(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.registry
            .lock()
            .devices
            .get(&key(name))
            .map(|e| e.device.clone())
    }

    pub fn device_names(&self) -> Vec<String> {
        self.registry
            .lock()
            .devices
            .values()
            .map(|e| e.device.name().to_string())
            .collect()
    }

    /// Static and dynamic attribute names of `device`.
    pub fn attribute_list(&self, device: &str) -> Result<Vec<String>, BridgeError> {
        let (dev, dynamic) = {
            let reg = self.registry.lock();
            let entry = reg
                .devices
                .get(&key(device))
                .ok_or_else(|| BridgeError::not_found("device", device))?;
            let dynamic: Vec<String> = reg
                .dynamic
                .get(&key(device))
                .map(|m| m.values().map(|d| d.info.name.clone()).collect())
                .unwrap_or_default();
            (entry.device.clone(), dynamic)
        };
        let mut names: Vec<String> = dev.attributes().into_iter().map(|a| a.name).collect();
        names.extend(dynamic);
        Ok(names)
    }

    /// Client read.  Runs under the device monitor.
    pub fn read_attribute(&self, device: &str, attr: &str) -> Result<WireValue, BridgeError> {
        let (dev, monitor, dynamic) = self.lookup(device, attr)?;
        let _guard = monitor.lock();
        match dynamic {
            Some(d) => d.hooks.read(),
            None => dev.read_attribute(attr),
        }
    }

    /// Client write.  Runs under the device monitor.
    pub fn write_attribute(
        &self,
        device: &str,
        attr: &str,
        value: WireValue,
    ) -> Result<(), BridgeError> {
        let (dev, monitor, dynamic) = self.lookup(device, attr)?;
        let _guard = monitor.lock();
        match dynamic {
            Some(d) if d.info.access == AttrAccess::Read => Err(BridgeError::InvalidValue(
                format!("attribute {attr} of {device} is read-only"),
            )),
            Some(d) => d.hooks.write(value),
            None => dev.write_attribute(attr, value),
        }
    }

    /// Client command call.
    pub fn command(
        &self,
        device: &str,
        name: &str,
        arg: WireValue,
    ) -> Result<WireValue, BridgeError> {
        let dev = self
            .device(device)
            .ok_or_else(|| BridgeError::not_found("device", device))?;
        debug!(device, command = name, "command");
        dev.command(name, arg)
    }

    /// Re-run `delete` then `init` on a live device.
    pub fn reinit(&self, device: &str) -> Result<(), BridgeError> {
        let dev = self
            .device(device)
            .ok_or_else(|| BridgeError::not_found("device", device))?;
        dev.delete();
        dev.init();
        Ok(())
    }

    /// Tear down every device without touching the database.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.registry.lock().devices.keys().cloned().collect();
        for name in names.into_iter().rev() {
            if let Some(dev) = self.unregister(&name) {
                dev.delete();
            }
        }
        info!("device server shut down");
    }

    fn lookup(
        &self,
        device: &str,
        attr: &str,
    ) -> Result<(Arc<dyn Device>, Arc<ReentrantMutex<()>>, Option<DynamicRef>), BridgeError> {
        let reg = self.registry.lock();
        let entry = reg
            .devices
            .get(&key(device))
            .ok_or_else(|| BridgeError::not_found("device", device))?;
        let dynamic = reg
            .dynamic
            .get(&key(device))
            .and_then(|m| m.get(&key(attr)))
            .map(|d| DynamicRef {
                info: d.info.clone(),
                hooks: d.hooks.clone(),
            });
        Ok((entry.device.clone(), entry.monitor.clone(), dynamic))
    }

    fn unregister(&self, name: &str) -> Option<Arc<dyn Device>> {
        let mut reg = self.registry.lock();
        let k = key(name);
        let entry = reg.devices.remove(&k)?;
        reg.dynamic.remove(&k);
        reg.events.retain(|(d, _)| *d != k);
        Some(entry.device)
    }
}

struct DynamicRef {
    info: AttrInfo,
    hooks: Arc<dyn DynamicAttribute>,
}

impl DeviceServer for LocalServer {
    fn set_change_event(&self, device: &str, attr: &str, enabled: bool) {
        let mut reg = self.registry.lock();
        let k = (key(device), key(attr));
        if enabled {
            reg.events.insert(k);
        } else {
            reg.events.remove(&k);
        }
    }

    fn push_change_event(
        &self,
        device: &str,
        attr: &str,
        value: WireValue,
        quality: AttrQuality,
    ) -> Result<(), BridgeError> {
        let monitor = {
            let reg = self.registry.lock();
            if !reg.events.contains(&(key(device), key(attr))) {
                return Err(BridgeError::Framework(format!(
                    "change events not enabled for {device}/{attr}"
                )));
            }
            reg.devices
                .get(&key(device))
                .map(|e| e.monitor.clone())
                .ok_or_else(|| BridgeError::not_found("device", device))?
        };
        let _guard = monitor.lock();
        self.bus
            .publish(ChangeEvent::new(device, attr, value, quality));
        Ok(())
    }

    fn add_dynamic_attribute(
        &self,
        device: &str,
        info: AttrInfo,
        hooks: Arc<dyn DynamicAttribute>,
    ) -> Result<(), BridgeError> {
        let dev = self
            .device(device)
            .ok_or_else(|| BridgeError::not_found("device", device))?;
        let attr_key = key(&info.name);
        if dev.attributes().iter().any(|a| key(&a.name) == attr_key) {
            return Err(BridgeError::DuplicateBinding(info.name));
        }
        let mut reg = self.registry.lock();
        let attrs = reg.dynamic.entry(key(device)).or_default();
        if attrs.contains_key(&attr_key) {
            return Err(BridgeError::DuplicateBinding(info.name));
        }
        debug!(device, attr = %info.name, "dynamic attribute added");
        attrs.insert(attr_key, DynamicEntry { info, hooks });
        Ok(())
    }

    fn remove_dynamic_attribute(&self, device: &str, name: &str) -> Result<(), BridgeError> {
        let mut reg = self.registry.lock();
        let removed = reg
            .dynamic
            .get_mut(&key(device))
            .and_then(|m| m.remove(&key(name)));
        if removed.is_none() {
            return Err(BridgeError::not_found("attribute", name));
        }
        reg.events.remove(&(key(device), key(name)));
        debug!(device, attr = name, "dynamic attribute removed");
        Ok(())
    }

    fn create_device(
        &self,
        class: &str,
        name: &str,
        on_created: Option<OnCreated>,
    ) -> Result<(), BridgeError> {
        split_device_name(name)?;
        let factory = self
            .classes
            .lock()
            .get(class)
            .cloned()
            .ok_or_else(|| BridgeError::Framework(format!("unknown device class {class}")))?;
        if self.registry.lock().devices.contains_key(&key(name)) {
            return Err(BridgeError::Framework(format!("device {name} already exists")));
        }
        let server: Arc<dyn DeviceServer> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| BridgeError::Framework("device server is gone".to_string()))?;

        if let Some(on_created) = on_created {
            on_created(name)?;
        }

        let device = factory(DeviceContext {
            name: name.to_string(),
            class: class.to_string(),
            server,
        });
        {
            let mut reg = self.registry.lock();
            if reg.devices.contains_key(&key(name)) {
                return Err(BridgeError::Framework(format!("device {name} already exists")));
            }
            reg.devices.insert(
                key(name),
                DeviceEntry {
                    class: class.to_string(),
                    device: device.clone(),
                    monitor: Arc::new(ReentrantMutex::new(())),
                },
            );
        }
        info!(device = name, class, "device created");
        device.init();
        Ok(())
    }

    fn delete_device(&self, class: &str, name: &str) -> Result<(), BridgeError> {
        {
            let reg = self.registry.lock();
            match reg.devices.get(&key(name)) {
                Some(entry) if entry.class == class => {}
                _ => return Err(BridgeError::not_found(class, name)),
            }
        }
        if let Some(dev) = self.unregister(name) {
            dev.delete();
        }
        if let Err(e) = self.store.delete_device(name) {
            warn!(device = name, error = %e, "failed to drop device from database");
            return Err(e.into());
        }
        info!(device = name, class, "device deleted");
        Ok(())
    }

    fn devices_of_class(&self, class: &str) -> Vec<String> {
        self.registry
            .lock()
            .devices
            .values()
            .filter(|e| e.class == class)
            .map(|e| e.device.name().to_string())
            .collect()
    }

    fn properties(&self) -> Arc<dyn PropertyStore> {
        self.store.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tangospec_store::MemoryPropertyStore;

    struct Gauge {
        name: String,
        server: Arc<dyn DeviceServer>,
        inits: AtomicUsize,
        deleted: AtomicBool,
    }

    impl Device for Gauge {
        fn name(&self) -> &str {
            &self.name
        }
        fn class(&self) -> &str {
            "Gauge"
        }
        fn init(&self) {
            self.inits.fetch_add(1, Ordering::SeqCst);
            self.server.set_change_event(&self.name, "Level", true);
        }
        fn delete(&self) {
            self.deleted.store(true, Ordering::SeqCst);
        }
        fn attributes(&self) -> Vec<AttrInfo> {
            vec![AttrInfo::read_only("Level", WireType::Long)]
        }
        fn read_attribute(&self, name: &str) -> Result<WireValue, BridgeError> {
            match name {
                "Level" => Ok(WireValue::Long(self.inits.load(Ordering::SeqCst) as i64)),
                other => Err(BridgeError::not_found("attribute", other)),
            }
        }
        fn write_attribute(&self, name: &str, _value: WireValue) -> Result<(), BridgeError> {
            Err(BridgeError::not_found("attribute", name))
        }
        fn commands(&self) -> Vec<&'static str> {
            vec!["Ping"]
        }
        fn command(&self, name: &str, _arg: WireValue) -> Result<WireValue, BridgeError> {
            match name {
                "Ping" => Ok(WireValue::String("pong".into())),
                other => Err(BridgeError::not_found("command", other)),
            }
        }
    }

    struct Fixed(i64);

    impl DynamicAttribute for Fixed {
        fn read(&self) -> Result<WireValue, BridgeError> {
            Ok(WireValue::Long(self.0))
        }
    }

    fn server() -> Arc<LocalServer> {
        let server = LocalServer::new(Arc::new(MemoryPropertyStore::new()));
        server.register_class("Gauge", |ctx: DeviceContext| -> Arc<dyn Device> {
            Arc::new(Gauge {
                name: ctx.name,
                server: ctx.server,
                inits: AtomicUsize::new(0),
                deleted: AtomicBool::new(false),
            })
        });
        server
    }

    #[test]
    fn create_runs_callback_then_init() {
        let server = server();
        let store = server.properties();
        let s = store.clone();
        server
            .create_device(
                "Gauge",
                "test/gauge/1",
                Some(Box::new(move |name: &str| {
                    s.put_property(name, "Flag", &["x".to_string()])?;
                    Ok(())
                })),
            )
            .unwrap();
        assert!(store.get_property("test/gauge/1", "Flag").unwrap().is_some());
        assert_eq!(
            server.read_attribute("TEST/gauge/1", "Level").unwrap(),
            WireValue::Long(1)
        );
        assert_eq!(server.devices_of_class("Gauge"), vec!["test/gauge/1".to_string()]);
        server.shutdown();
    }

    #[test]
    fn duplicate_and_malformed_names_are_rejected() {
        let server = server();
        server.create_device("Gauge", "test/gauge/1", None).unwrap();
        assert!(server.create_device("Gauge", "test/gauge/1", None).is_err());
        assert!(server.create_device("Gauge", "test/gauge", None).is_err());
        assert!(server.create_device("Nope", "test/gauge/2", None).is_err());
        server.shutdown();
    }

    #[test]
    fn dynamic_attributes_are_case_insensitive_and_unique() {
        let server = server();
        server.create_device("Gauge", "test/gauge/1", None).unwrap();
        let info = AttrInfo::read_only("Answer", WireType::Long);
        server
            .add_dynamic_attribute("test/gauge/1", info.clone(), Arc::new(Fixed(42)))
            .unwrap();
        assert!(matches!(
            server.add_dynamic_attribute("test/gauge/1", info, Arc::new(Fixed(1))),
            Err(BridgeError::DuplicateBinding(_))
        ));
        assert_eq!(
            server.read_attribute("test/gauge/1", "answer").unwrap(),
            WireValue::Long(42)
        );
        assert!(server
            .write_attribute("test/gauge/1", "Answer", WireValue::Long(1))
            .is_err());
        assert!(server
            .attribute_list("test/gauge/1")
            .unwrap()
            .contains(&"Answer".to_string()));

        server.remove_dynamic_attribute("test/gauge/1", "ANSWER").unwrap();
        assert!(server.read_attribute("test/gauge/1", "Answer").is_err());
        server.shutdown();
    }

    #[tokio::test]
    async fn change_events_require_enabling() {
        let server = server();
        server.create_device("Gauge", "test/gauge/1", None).unwrap();
        let mut sub = server.bus().subscribe_device("test/gauge/1", None);

        assert!(server
            .push_change_event("test/gauge/1", "Other", WireValue::Long(1), AttrQuality::Valid)
            .is_err());
        server
            .push_change_event("test/gauge/1", "Level", WireValue::Long(7), AttrQuality::Valid)
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.attribute, "Level");
        assert_eq!(event.value, WireValue::Long(7));
        server.shutdown();
    }

    #[test]
    fn delete_device_tears_down_and_drops_properties() {
        let server = server();
        server.create_device("Gauge", "test/gauge/1", None).unwrap();
        server
            .properties()
            .put_property("test/gauge/1", "Flag", &["x".to_string()])
            .unwrap();
        let dev = server.device("test/gauge/1").unwrap();

        assert!(server.delete_device("Other", "test/gauge/1").is_err());
        server.delete_device("Gauge", "test/gauge/1").unwrap();

        assert!(server.device("test/gauge/1").is_none());
        assert!(server.properties().get_property("test/gauge/1", "Flag").unwrap().is_none());
        assert_eq!(dev.command("Ping", WireValue::Void).unwrap(), WireValue::String("pong".into()));
        server.shutdown();
    }

    #[test]
    fn command_routes_to_device() {
        let server = server();
        server.create_device("Gauge", "test/gauge/1", None).unwrap();
        assert_eq!(
            server.command("test/gauge/1", "Ping", WireValue::Void).unwrap(),
            WireValue::String("pong".into())
        );
        assert!(server.command("test/gauge/9", "Ping", WireValue::Void).is_err());
        server.shutdown();
    }

    #[test]
    fn split_device_name_parts() {
        assert_eq!(split_device_name("a/b/c").unwrap(), ("a", "b", "c"));
        assert!(split_device_name("a//c").is_err());
        assert!(split_device_name("a/b/c/d").is_err());
    }
}
