//! In-process property store.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::{PropertyStore, StoreError, device_key};

#[derive(Default)]
struct Tables {
    properties: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    aliases: BTreeMap<String, String>,
}

/// Property store held in memory; contents vanish with the value.
#[derive(Default)]
pub struct MemoryPropertyStore {
    tables: Mutex<Tables>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get_property(&self, device: &str, name: &str) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self
            .tables
            .lock()
            .properties
            .get(&device_key(device))
            .and_then(|props| props.get(name))
            .cloned())
    }

    fn put_property(&self, device: &str, name: &str, values: &[String]) -> Result<(), StoreError> {
        self.tables
            .lock()
            .properties
            .entry(device_key(device))
            .or_default()
            .insert(name.to_string(), values.to_vec());
        Ok(())
    }

    fn delete_property(&self, device: &str, name: &str) -> Result<(), StoreError> {
        if let Some(props) = self.tables.lock().properties.get_mut(&device_key(device)) {
            props.remove(name);
        }
        Ok(())
    }

    fn device_properties(&self, device: &str) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        Ok(self
            .tables
            .lock()
            .properties
            .get(&device_key(device))
            .cloned()
            .unwrap_or_default())
    }

    fn delete_device(&self, device: &str) -> Result<(), StoreError> {
        let key = device_key(device);
        let mut tables = self.tables.lock();
        tables.properties.remove(&key);
        tables.aliases.retain(|_, owner| *owner != key);
        Ok(())
    }

    fn get_alias(&self, alias: &str) -> Result<Option<String>, StoreError> {
        Ok(self.tables.lock().aliases.get(alias).cloned())
    }

    fn put_alias(&self, device: &str, alias: &str) -> Result<(), StoreError> {
        let key = device_key(device);
        let mut tables = self.tables.lock();
        match tables.aliases.get(alias) {
            Some(owner) if *owner != key => Err(StoreError::AliasTaken {
                alias: alias.to_string(),
                device: owner.clone(),
            }),
            _ => {
                tables.aliases.insert(alias.to_string(), key);
                Ok(())
            }
        }
    }

    fn delete_alias(&self, alias: &str) -> Result<(), StoreError> {
        self.tables.lock().aliases.remove(alias);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_are_case_insensitive() {
        let store = MemoryPropertyStore::new();
        store
            .put_property("ID00/Spec/FourC", "Spec", &["localhost:fourc".to_string()])
            .unwrap();
        assert!(store.get_property("id00/spec/fourc", "Spec").unwrap().is_some());
    }

    #[test]
    fn alias_conflict_is_reported() {
        let store = MemoryPropertyStore::new();
        store.put_alias("a/b/c", "c").unwrap();
        assert!(store.put_alias("a/b/d", "c").is_err());
        store.delete_alias("c").unwrap();
        store.put_alias("a/b/d", "c").unwrap();
        assert_eq!(store.get_alias("c").unwrap().as_deref(), Some("a/b/d"));
    }
}
