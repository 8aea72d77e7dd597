//! Object tables: per-connection resources and server-wide globals.
//!
//! Every connection maps 32-bit ids to typed resources; id 0 is always
//! the connection's core. Globals are server-wide objects a client can
//! bind into its own id space through the registry. Both tables keep
//! insertion order so global advertisement replays deterministically.

use crate::proto::{ObjectKind, ProtocolError};
use indexmap::IndexMap;

/// A server-side object addressable by a per-connection id.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: u32,
    pub kind: ObjectKind,
    /// The global this resource is a binding of, if any.
    pub global: Option<u32>,
}

/// The id table of one client connection. All ids die together when the
/// connection closes.
#[derive(Debug, Default)]
pub struct ResourceTable {
    map: IndexMap<u32, Resource>,
}

impl ResourceTable {
    pub fn new() -> ResourceTable {
        ResourceTable::default()
    }

    /// Client-assigned and server-assigned ids share one namespace;
    /// a collision is a protocol error.
    pub fn insert(&mut self, resource: Resource) -> Result<(), ProtocolError> {
        if self.map.contains_key(&resource.id) {
            return Err(ProtocolError::new(format!(
                "resource id {} already in use",
                resource.id
            )));
        }
        self.map.insert(resource.id, resource);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&Resource> {
        self.map.get(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Resource> {
        self.map.shift_remove(&id)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.map.values()
    }

    /// Ids of every resource bound to the given global.
    pub fn bound_to(&self, global: u32) -> Vec<u32> {
        self.map
            .values()
            .filter(|r| r.global == Some(global))
            .map(|r| r.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A globally visible object the server advertises to registries.
#[derive(Debug, Clone, Copy)]
pub struct Global {
    pub id: u32,
    pub kind: ObjectKind,
}

/// Server-wide globals with monotonically assigned ids.
#[derive(Debug)]
pub struct GlobalMap {
    next_id: u32,
    map: IndexMap<u32, Global>,
}

impl Default for GlobalMap {
    fn default() -> GlobalMap {
        GlobalMap {
            next_id: 1,
            map: IndexMap::new(),
        }
    }
}

impl GlobalMap {
    pub fn new() -> GlobalMap {
        GlobalMap::default()
    }

    pub fn add(&mut self, kind: ObjectKind) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, Global { id, kind });
        id
    }

    pub fn get(&self, id: u32) -> Option<&Global> {
        self.map.get(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Global> {
        self.map.shift_remove(&id)
    }

    /// Globals in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Global> {
        self.map.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_collision_rejected() {
        let mut table = ResourceTable::new();
        table
            .insert(Resource {
                id: 0,
                kind: ObjectKind::Core,
                global: None,
            })
            .unwrap();
        let clash = table.insert(Resource {
            id: 0,
            kind: ObjectKind::Registry,
            global: None,
        });
        assert!(clash.is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn close_releases_everything() {
        let mut table = ResourceTable::new();
        for id in 0..4 {
            table
                .insert(Resource {
                    id,
                    kind: ObjectKind::Node,
                    global: Some(id + 10),
                })
                .unwrap();
        }
        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn globals_replay_in_registration_order() {
        let mut globals = GlobalMap::new();
        let a = globals.add(ObjectKind::Module);
        let b = globals.add(ObjectKind::Node);
        let c = globals.add(ObjectKind::Client);
        globals.remove(b);
        let order: Vec<u32> = globals.iter().map(|g| g.id).collect();
        assert_eq!(order, vec![a, c]);
        // ids are never reused
        assert_eq!(globals.add(ObjectKind::Link), c + 1);
    }
}
