//! The per-core interface handle table.

use std::collections::HashMap;

use conflux_core::{GlobalFederateId, GlobalHandle, InterfaceHandle, LocalFederateId};

use crate::frame::InterfaceKind;

/// Separator between a federate name and a locally-scoped interface key.
pub const NAME_SEGMENT_SEPARATOR: char = '/';

/// Everything a core records about one registered interface.
#[derive(Debug, Clone)]
pub struct BasicHandleInfo {
    pub handle: InterfaceHandle,
    pub local_federate: LocalFederateId,
    pub global_federate: GlobalFederateId,
    pub kind: InterfaceKind,
    /// The federation-wide key: either the exact global name or
    /// `federate/name` for locally-scoped registrations.
    pub key: String,
    pub type_name: String,
    pub units: String,
    pub flags: u16,
    pub info: String,
    pub tags: Vec<(String, String)>,
    /// Set once anything links to or traffics through the interface, so
    /// unused interfaces can be reported at connection finalization.
    pub used: bool,
    /// A closed interface stays in the arena but accepts no traffic.
    pub tombstoned: bool,
}

impl BasicHandleInfo {
    pub fn global_handle(&self) -> GlobalHandle {
        GlobalHandle::new(self.global_federate, self.handle)
    }
}

/// Arena of handle records with a name index.
///
/// Handles are monotonic within the core; the arena index is the handle
/// value itself. Closed handles are tombstoned, never reused.
#[derive(Debug, Default)]
pub struct HandleManager {
    handles: Vec<BasicHandleInfo>,
    by_key: HashMap<(InterfaceKind, String), InterfaceHandle>,
}

impl HandleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        local_federate: LocalFederateId,
        global_federate: GlobalFederateId,
        kind: InterfaceKind,
        key: impl Into<String>,
        type_name: impl Into<String>,
        units: impl Into<String>,
        flags: u16,
    ) -> InterfaceHandle {
        let handle = InterfaceHandle::new(self.handles.len() as u32);
        let key = key.into();
        let info = BasicHandleInfo {
            handle,
            local_federate,
            global_federate,
            kind,
            key: key.clone(),
            type_name: type_name.into(),
            units: units.into(),
            flags,
            info: String::new(),
            tags: Vec::new(),
            used: false,
            tombstoned: false,
        };
        self.handles.push(info);
        if !key.is_empty() {
            self.by_key.insert((kind, key), handle);
        }
        handle
    }

    pub fn get(&self, handle: InterfaceHandle) -> Option<&BasicHandleInfo> {
        self.handles.get(handle.raw() as usize).filter(|h| !h.tombstoned)
    }

    pub fn get_mut(&mut self, handle: InterfaceHandle) -> Option<&mut BasicHandleInfo> {
        self.handles
            .get_mut(handle.raw() as usize)
            .filter(|h| !h.tombstoned)
    }

    pub fn find(&self, kind: InterfaceKind, key: &str) -> Option<&BasicHandleInfo> {
        self.by_key
            .get(&(kind, key.to_owned()))
            .and_then(|&handle| self.get(handle))
    }

    /// Look up by key across all interface kinds.
    pub fn find_any(&self, key: &str) -> Option<&BasicHandleInfo> {
        [
            InterfaceKind::Publication,
            InterfaceKind::Input,
            InterfaceKind::Endpoint,
            InterfaceKind::Filter,
            InterfaceKind::Translator,
        ]
        .iter()
        .find_map(|&kind| self.find(kind, key))
    }

    pub fn set_global_federate(&mut self, local: LocalFederateId, global: GlobalFederateId) {
        for info in &mut self.handles {
            if info.local_federate == local {
                info.global_federate = global;
            }
        }
    }

    pub fn mark_used(&mut self, handle: InterfaceHandle) {
        if let Some(info) = self.get_mut(handle) {
            info.used = true;
        }
    }

    /// Tombstone the handle; returns whether it existed and was live.
    pub fn close(&mut self, handle: InterfaceHandle) -> bool {
        match self.handles.get_mut(handle.raw() as usize) {
            Some(info) if !info.tombstoned => {
                info.tombstoned = true;
                self.by_key.remove(&(info.kind, info.key.clone()));
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BasicHandleInfo> {
        self.handles.iter().filter(|h| !h.tombstoned)
    }

    pub fn owned_by(
        &self,
        federate: LocalFederateId,
    ) -> impl Iterator<Item = &BasicHandleInfo> {
        self.iter().filter(move |h| h.local_federate == federate)
    }

    /// Keys of interfaces nothing ever connected to.
    pub fn unused_keys(&self) -> Vec<&str> {
        self.iter()
            .filter(|h| !h.used)
            .map(|h| h.key.as_str())
            .collect()
    }
}

/// Qualify a locally-scoped key with its federate name.
pub fn qualify_key(federate_name: &str, key: &str) -> String {
    if key.is_empty() {
        key.to_owned()
    } else {
        format!("{federate_name}{NAME_SEGMENT_SEPARATOR}{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(keys: &[&str]) -> HandleManager {
        let mut mgr = HandleManager::default();
        for key in keys {
            mgr.create(
                LocalFederateId::new(1),
                GlobalFederateId::INVALID,
                InterfaceKind::Endpoint,
                *key,
                "",
                "",
                0,
            );
        }
        mgr
    }

    #[test]
    fn handles_are_monotonic_and_indexable() {
        let mgr = manager_with(&["a", "b", "c"]);
        assert_eq!(mgr.find(InterfaceKind::Endpoint, "b").unwrap().handle.raw(), 1);
        assert_eq!(mgr.get(InterfaceHandle::new(2)).unwrap().key, "c");
    }

    #[test]
    fn close_tombstones_without_reuse() {
        let mut mgr = manager_with(&["a"]);
        let handle = mgr.find(InterfaceKind::Endpoint, "a").unwrap().handle;
        assert!(mgr.close(handle));
        assert!(!mgr.close(handle));
        assert!(mgr.get(handle).is_none());
        assert!(mgr.find(InterfaceKind::Endpoint, "a").is_none());

        // A fresh registration under the same key gets a new handle.
        let fresh = mgr.create(
            LocalFederateId::new(1),
            GlobalFederateId::INVALID,
            InterfaceKind::Endpoint,
            "a",
            "",
            "",
            0,
        );
        assert_ne!(fresh, handle);
    }

    #[test]
    fn same_key_under_different_kinds_coexists() {
        let mut mgr = manager_with(&["shared"]);
        mgr.create(
            LocalFederateId::new(1),
            GlobalFederateId::INVALID,
            InterfaceKind::Publication,
            "shared",
            "double",
            "",
            0,
        );
        assert_eq!(
            mgr.find(InterfaceKind::Publication, "shared").unwrap().type_name,
            "double"
        );
        assert!(mgr.find(InterfaceKind::Endpoint, "shared").is_some());
    }

    #[test]
    fn unused_tracking() {
        let mut mgr = manager_with(&["a", "b"]);
        let a = mgr.find(InterfaceKind::Endpoint, "a").unwrap().handle;
        mgr.mark_used(a);
        assert_eq!(mgr.unused_keys(), vec!["b"]);
    }

    #[test]
    fn qualified_keys() {
        assert_eq!(qualify_key("fedA", "port1"), "fedA/port1");
        assert_eq!(qualify_key("fedA", ""), "");
    }
}
