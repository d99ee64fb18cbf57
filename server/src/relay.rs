use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::objects::{ObjectRegistry, SpawnedObject};
use crate::protocol::{
    self, ClientMsg, ServerMsg, SpawnObjectMsg, UpdatePositionMsg, WelcomeMsg, PROTOCOL_VERSION,
};
use crate::session::{ConnectionId, Session, SessionRegistry, Transform};
use crate::store::{ObjectStore, StoreError};
use crate::voice;

/// Commands from client connections to the relay loop
pub enum RelayCommand {
    Join {
        outbound: mpsc::Sender<ServerMsg>,
        response: oneshot::Sender<ConnectionId>,
    },
    Event {
        id: ConnectionId,
        msg: ClientMsg,
    },
    Leave {
        id: ConnectionId,
    },
}

/// Run the relay loop. Owns both registries and the store handle, so every
/// registry change and the fan-out that follows it happen without interleaving.
pub async fn run_relay(mut cmd_rx: mpsc::Receiver<RelayCommand>, mut relay: Relay) {
    while let Some(cmd) = cmd_rx.recv().await {
        relay.handle(cmd).await;
    }
    tracing::info!("Relay loop ended");
}

pub struct Relay {
    sessions: SessionRegistry,
    objects: ObjectRegistry,
    store: Arc<dyn ObjectStore>,
    store_timeout: Duration,
}

impl Relay {
    pub fn new(store: Arc<dyn ObjectStore>, store_timeout: Duration) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            objects: ObjectRegistry::new(),
            store,
            store_timeout,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub async fn handle(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Join { outbound, response } => {
                let id = self.connect(outbound).await;
                if response.send(id.clone()).is_err() {
                    // Socket task went away before learning its id; it will never send Leave.
                    self.disconnect(&id).await;
                }
            }
            RelayCommand::Event { id, msg } => self.dispatch(&id, msg).await,
            RelayCommand::Leave { id } => self.disconnect(&id).await,
        }
        self.drop_lagging_sessions().await;
    }

    /// Disconnect every session whose outbound queue overflowed. A client that
    /// misses messages can no longer mirror the world, so it is cut loose and
    /// goes through the normal cleanup. Repeats because each departure is
    /// itself broadcast.
    async fn drop_lagging_sessions(&mut self) {
        loop {
            let lagging = self.sessions.lagging();
            if lagging.is_empty() {
                return;
            }
            for id in lagging {
                tracing::warn!(connection_id = %id, "Dropping client that stopped reading");
                self.disconnect(&id).await;
            }
        }
    }

    /// Delete objects whose owners are gone. At startup no session exists, so
    /// this clears everything a previous run left behind.
    pub async fn purge_stale_objects(&mut self) {
        let stored = match self.with_timeout(self.store.load_all()).await {
            Ok(objects) => objects,
            Err(e) => {
                tracing::error!("Failed to load objects for startup purge: {}", e);
                return;
            }
        };

        let mut owners: Vec<&str> = stored
            .iter()
            .map(|o| o.owner_id.as_str())
            .filter(|owner| !self.sessions.contains(owner))
            .collect();
        owners.sort_unstable();
        owners.dedup();

        let mut purged = 0;
        for owner in owners {
            match self.with_timeout(self.store.delete_by_owner(owner)).await {
                Ok(n) => purged += n,
                Err(e) => tracing::error!(owner = %owner, "Failed to purge stale objects: {}", e),
            }
            self.objects.remove_owned_by(owner);
        }
        tracing::info!("Purged {} stale objects from store", purged);
    }

    /// Register a new connection and deliver its backlog. Returns the assigned id.
    pub async fn connect(&mut self, outbound: mpsc::Sender<ServerMsg>) -> ConnectionId {
        let mut id = Uuid::new_v4().to_string();
        while self.sessions.contains(&id) {
            id = Uuid::new_v4().to_string();
        }

        let session = Session::new(id.clone(), outbound);
        session.send(ServerMsg::Welcome(WelcomeMsg {
            protocol_version: PROTOCOL_VERSION,
            self_id: id.clone(),
        }));
        self.sessions.register(session);

        self.sessions
            .broadcast_except(&id, &ServerMsg::PlayerJoined(id.clone()));

        // Existing peers: ids first, then a snapshot for everyone who has moved.
        let mut joined = Vec::new();
        let mut snapshots = Vec::new();
        for peer in self.sessions.peers_of(&id) {
            joined.push(ServerMsg::PlayerJoined(peer.id.clone()));
            if let Some(transform) = peer.transform {
                snapshots.push(protocol::player_update(&peer.id, transform));
            }
        }
        for msg in joined.into_iter().chain(snapshots) {
            self.sessions.send_to(&id, msg);
        }

        match self.with_timeout(self.store.load_all()).await {
            Ok(objects) => {
                for object in &objects {
                    self.sessions.send_to(&id, protocol::object_spawned(object));
                }
                tracing::info!(connection_id = %id, "Sent {} existing objects to new player", objects.len());
            }
            Err(e) => {
                tracing::error!(connection_id = %id, "Error loading existing objects: {}", e);
            }
        }

        tracing::info!(connection_id = %id, "Player joined ({} connected)", self.sessions.len());
        id
    }

    /// Tear down a session. Unknown ids are a no-op.
    pub async fn disconnect(&mut self, id: &str) {
        if self.sessions.remove(id).is_none() {
            tracing::debug!(connection_id = %id, "Disconnect for unknown session ignored");
            return;
        }

        self.sessions
            .broadcast_all(&ServerMsg::PlayerDisconnected(id.to_string()));

        let removed = self.objects.remove_owned_by(id);
        match self.with_timeout(self.store.delete_by_owner(id)).await {
            Ok(deleted) => {
                if deleted != removed.len() as u64 {
                    tracing::warn!(
                        connection_id = %id,
                        "Registry/store divergence on cleanup: {} cached, {} deleted from store",
                        removed.len(),
                        deleted
                    );
                }
                tracing::info!(connection_id = %id, "Removed {} objects for disconnected player", deleted);
            }
            Err(e) => {
                tracing::error!(
                    connection_id = %id,
                    "Error removing objects on disconnect, {} may remain in store: {}",
                    removed.len(),
                    e
                );
            }
        }

        tracing::info!(connection_id = %id, "Player left ({} connected)", self.sessions.len());
    }

    async fn dispatch(&mut self, id: &str, msg: ClientMsg) {
        if !self.sessions.contains(id) {
            tracing::debug!(connection_id = %id, "Event from unknown session dropped");
            return;
        }

        match msg {
            ClientMsg::UpdatePosition(update) => self.update_position(id, update),
            ClientMsg::SpawnObject(spawn) => self.spawn_object(id, spawn).await,
            ClientMsg::VoiceOffer(req) => {
                voice::relay_offer(&self.sessions, id, req);
            }
            ClientMsg::VoiceAnswer(req) => {
                voice::relay_answer(&self.sessions, id, req);
            }
            ClientMsg::VoiceIceCandidate(req) => {
                voice::relay_ice_candidate(&self.sessions, id, req);
            }
            ClientMsg::VoiceSpeaking(req) => {
                voice::relay_speaking(&self.sessions, id, req);
            }
        }
    }

    fn update_position(&mut self, id: &str, update: UpdatePositionMsg) {
        let transform = Transform {
            position: update.position,
            rotation: update.rotation,
        };
        if !self.sessions.update_transform(id, transform) {
            return;
        }
        self.sessions
            .broadcast_except(id, &protocol::player_update(id, transform));
    }

    /// Persist, then cache, then broadcast. Nothing is cached or sent if the
    /// store rejects the write.
    async fn spawn_object(&mut self, owner: &str, spawn: SpawnObjectMsg) {
        let object = SpawnedObject::new(spawn.id, spawn.asset_id, spawn.position, owner.to_string());

        match self.with_timeout(self.store.insert(&object)).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(id)) => {
                tracing::warn!(connection_id = %owner, "Rejected spawn of existing object {}", id);
                return;
            }
            Err(e @ StoreError::Timeout(_)) => {
                // The write may still commit after we stop waiting. Roll it back
                // so the store never holds an object that peers were not told about.
                tracing::warn!(connection_id = %owner, "Saving object {} failed: {}, rolling back", object.id, e);
                if let Err(e) = self.with_timeout(self.store.delete(&object.id)).await {
                    tracing::warn!(
                        connection_id = %owner,
                        "Rollback of object {} failed, store may hold an object peers never saw: {}",
                        object.id,
                        e
                    );
                }
                return;
            }
            Err(e) => {
                tracing::error!(connection_id = %owner, "Error saving object {}: {}", object.id, e);
                return;
            }
        }
        tracing::info!(connection_id = %owner, "Object saved: {} ({})", object.id, object.asset_id);

        let msg = protocol::object_spawned(&object);
        if !self.objects.insert(object) {
            tracing::warn!(connection_id = %owner, "Object registry already held a stored id");
        }
        self.sessions.broadcast_except(owner, &msg);
    }

    async fn with_timeout<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}
