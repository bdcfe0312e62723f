//! Known targets and active sessions, keyed by normalized target name
//!
//! Descriptors are written by the discovery watcher, sessions by the
//! orchestrator. Both maps reject duplicate names.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::RegistryError;
use crate::protocol::TargetDescriptor;
use crate::session::SessionHandle;

pub struct DeviceRegistry<S = SessionHandle> {
    devices: DashMap<String, TargetDescriptor>,
    sessions: DashMap<String, S>,
}

impl<S> DeviceRegistry<S> {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Register a descriptor. Returns `false` if the name is already known.
    pub fn insert_device(&self, descriptor: TargetDescriptor) -> bool {
        match self.devices.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
                true
            }
        }
    }

    pub fn remove_device(&self, name: &str) -> Option<TargetDescriptor> {
        self.devices.remove(name).map(|(_, descriptor)| descriptor)
    }

    pub fn contains_device(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn device(&self, name: &str) -> Option<TargetDescriptor> {
        self.devices.get(name).map(|d| d.value().clone())
    }

    /// All known devices, sorted by name
    pub fn devices(&self) -> Vec<TargetDescriptor> {
        let mut devices: Vec<_> = self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Register a session, rejecting a second one for the same name
    pub fn try_insert_session(&self, name: &str, session: S) -> Result<(), RegistryError> {
        match self.sessions.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::SessionExists(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn remove_session(&self, name: &str) -> Option<S> {
        self.sessions.remove(name).map(|(_, session)| session)
    }

    /// Remove the session only if `predicate` holds for it
    pub fn remove_session_if<F>(&self, name: &str, predicate: F) -> Option<S>
    where
        F: FnOnce(&S) -> bool,
    {
        self.sessions
            .remove_if(name, |_, session| predicate(session))
            .map(|(_, session)| session)
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sessions.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `f` against a session without removing it
    pub fn with_session<R>(&self, name: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.sessions.get(name).map(|session| f(session.value()))
    }

    /// Apply `f` to every session
    pub fn map_sessions<R>(&self, mut f: impl FnMut(&str, &S) -> R) -> Vec<R> {
        self.sessions
            .iter()
            .map(|entry| f(entry.key(), entry.value()))
            .collect()
    }

    /// Remove and return every session
    pub fn drain_sessions(&self) -> Vec<(String, S)> {
        let names: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.sessions.remove(&name))
            .collect()
    }
}

impl<S> Default for DeviceRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor(name: &str) -> TargetDescriptor {
        TargetDescriptor {
            name: name.to_string(),
            host: "host.local".into(),
            address: "10.0.0.5".into(),
            port: 8009,
            model: "Unknown".into(),
            is_group: false,
        }
    }

    #[test]
    fn test_device_dedup() {
        let registry: DeviceRegistry<u32> = DeviceRegistry::new();
        assert!(registry.insert_device(descriptor("Kitchen Speaker")));
        assert!(!registry.insert_device(descriptor("Kitchen Speaker")));
        assert_eq!(registry.device_count(), 1);

        assert!(registry.remove_device("Kitchen Speaker").is_some());
        assert!(registry.remove_device("Kitchen Speaker").is_none());
    }

    #[test]
    fn test_second_session_rejected() {
        let registry: DeviceRegistry<u32> = DeviceRegistry::new();
        registry.try_insert_session("Den", 1).unwrap();
        assert_eq!(
            registry.try_insert_session("Den", 2),
            Err(RegistryError::SessionExists("Den".into()))
        );
        assert_eq!(registry.with_session("Den", |s| *s), Some(1));
    }

    #[test]
    fn test_conditional_remove() {
        let registry: DeviceRegistry<u32> = DeviceRegistry::new();
        registry.try_insert_session("Den", 7).unwrap();

        assert!(registry.remove_session_if("Den", |s| *s == 8).is_none());
        assert!(registry.has_session("Den"));
        assert_eq!(registry.remove_session_if("Den", |s| *s == 7), Some(7));
        assert!(!registry.has_session("Den"));
    }

    #[test]
    fn test_devices_sorted() {
        let registry: DeviceRegistry<u32> = DeviceRegistry::new();
        registry.insert_device(descriptor("Office"));
        registry.insert_device(descriptor("Bedroom"));
        let names: Vec<_> = registry.devices().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Bedroom", "Office"]);
    }

    #[test]
    fn test_concurrent_inserts_single_winner() {
        let registry = std::sync::Arc::new(DeviceRegistry::<usize>::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.try_insert_session("Den", i).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.session_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_two_sessions_per_name(ops in proptest::collection::vec((0u8..4, any::<bool>()), 0..64)) {
            let registry: DeviceRegistry<u8> = DeviceRegistry::new();
            let mut expected = std::collections::HashSet::new();

            for (id, insert) in ops {
                let name = format!("target-{}", id);
                if insert {
                    let inserted = registry.try_insert_session(&name, id).is_ok();
                    prop_assert_eq!(inserted, expected.insert(name.clone()));
                } else {
                    let removed = registry.remove_session(&name).is_some();
                    prop_assert_eq!(removed, expected.remove(&name));
                }
                prop_assert_eq!(registry.session_count(), expected.len());
            }
        }
    }
}
