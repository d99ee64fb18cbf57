//! Wire protocol, shared with clients through `world-relay-shared`.

pub use world_relay_shared::protocol::*;

use crate::objects::SpawnedObject;
use crate::session::Transform;

pub fn object_spawned(object: &SpawnedObject) -> ServerMsg {
    ServerMsg::ObjectSpawned(object.to_wire())
}

pub fn player_update(id: &str, transform: Transform) -> ServerMsg {
    ServerMsg::PlayerUpdate(PlayerUpdateMsg {
        id: id.to_string(),
        position: transform.position,
        rotation: transform.rotation,
    })
}
