//! Spawned world objects and the in-memory Object Registry.
//!
//! The registry mirrors the persistence store. It is only written after a
//! successful store write, and only emptied by owner disconnect.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::protocol::ObjectSpawnedMsg;
use crate::session::ConnectionId;
use crate::vec3::Vec3;

/// A placed world object.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnedObject {
    /// Client-generated, unique across the registry
    pub id: String,
    pub asset_id: String,
    pub position: Vec3,
    pub owner_id: ConnectionId,
    pub created_at: DateTime<Utc>,
}

impl SpawnedObject {
    pub fn new(id: String, asset_id: String, position: Vec3, owner_id: ConnectionId) -> Self {
        Self {
            id,
            asset_id,
            position,
            owner_id,
            created_at: Utc::now(),
        }
    }

    pub fn to_wire(&self) -> ObjectSpawnedMsg {
        ObjectSpawnedMsg {
            id: self.id.clone(),
            asset_id: self.asset_id.clone(),
            position: self.position,
            player_id: self.owner_id.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<String, SpawnedObject>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a persisted object. Returns false if the id is already present.
    pub fn insert(&mut self, object: SpawnedObject) -> bool {
        if self.objects.contains_key(&object.id) {
            return false;
        }
        self.objects.insert(object.id.clone(), object);
        true
    }

    pub fn get(&self, id: &str) -> Option<&SpawnedObject> {
        self.objects.get(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn owned_by<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a SpawnedObject> + 'a {
        self.objects.values().filter(move |o| o.owner_id == owner)
    }

    /// Remove and return every object owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: &str) -> Vec<SpawnedObject> {
        let ids: Vec<String> = self.owned_by(owner).map(|o| o.id.clone()).collect();
        ids.iter()
            .filter_map(|id| self.objects.remove(id))
            .collect()
    }
}
