#![forbid(unsafe_code)]

// Room module - room lifecycle, membership, and topology orchestration.
pub mod participant;

use crate::error::{SignalError, SignalResult};
use crate::media::{FilterParams, MediaElement, MediaEngine};
use crate::metrics::ServerMetrics;
use crate::session::{ConnectionId, SessionRegistry};
use crate::signaling::protocol::ServerMessage;
use participant::UserSession;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Named set of participants sharing one call.
pub struct Room {
    pub name: String,
    participants: HashMap<String, Arc<UserSession>>,
}

impl Room {
    fn new(name: String) -> Self {
        Self {
            name,
            participants: HashMap::new(),
        }
    }

    /// Snapshot of the current member set. Fan-out always runs against a
    /// snapshot, never against the live map.
    fn snapshot(&self) -> Vec<Arc<UserSession>> {
        self.participants.values().cloned().collect()
    }

    fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Manages all rooms and coordinates membership changes against the media
/// engine.
///
/// Uses per-room locking: the outer HashMap is protected by a
/// std::sync::RwLock (held only for brief lookups/inserts, never across await
/// points), while each room is protected by its own tokio::sync::RwLock.
/// Media engine calls are made outside room locks so slow engine round-trips
/// never serialize a whole room.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    sessions: Arc<SessionRegistry>,
    engine: Arc<dyn MediaEngine>,
    filter: FilterParams,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        sessions: Arc<SessionRegistry>,
        filter: FilterParams,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            sessions,
            engine,
            filter,
            metrics,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Gets or creates a room. The write-lock re-check makes concurrent
    /// first-joiners converge on a single room.
    fn get_or_create_room(&self, name: &str) -> Arc<TokioRwLock<Room>> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = rooms.get(name) {
            return existing.clone();
        }

        info!("ROOM {}: created", name);
        self.metrics.inc_rooms_created();
        let room = Arc::new(TokioRwLock::new(Room::new(name.to_string())));
        rooms.insert(name.to_string(), room.clone());
        room
    }

    fn get_room(&self, name: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(name).cloned()
    }

    /// Adds a participant to a room (creating it on first join), establishing
    /// the full-mesh bookkeeping: every prior member is told about the
    /// arrival, and the prior member names are returned for the joiner's
    /// snapshot.
    ///
    /// # Errors
    /// `DuplicateIdentity` if the identity is already registered (partial
    /// media resources are released before returning), `MediaEngine` if
    /// pipeline or endpoint allocation fails.
    pub async fn join(
        &self,
        room_name: &str,
        name: &str,
        connection: ConnectionId,
        sender: mpsc::Sender<Arc<String>>,
    ) -> SignalResult<(Arc<UserSession>, Vec<String>)> {
        info!("PARTICIPANT {}: trying to join room {}", name, room_name);

        // Cheap pre-check before touching the engine; register() below is the
        // authoritative guard against a concurrent claim of the same name.
        if self.sessions.contains_identity(name) {
            return Err(SignalError::DuplicateIdentity(name.to_string()));
        }

        // Media allocation happens before any lock is taken.
        let user =
            UserSession::create(name, room_name, connection, sender, self.engine.clone()).await?;

        if let Err(e) = self.sessions.register(user.clone()) {
            user.release().await;
            return Err(e);
        }

        // Insertion races with a concurrent last-leaver: the Arc obtained
        // from get_or_create_room may be unregistered by the time the room
        // write lock is acquired. Re-verify under the outer lock after
        // inserting, and retry against a fresh room if the map moved on.
        let existing = loop {
            let room_lock = self.get_or_create_room(room_name);
            let existing = {
                let mut room = room_lock.write().await;
                let existing = room.snapshot();
                room.participants.insert(name.to_string(), user.clone());
                existing
            }; // room lock released before fan-out

            let still_registered = {
                let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
                rooms
                    .get(room_name)
                    .map_or(false, |registered| Arc::ptr_eq(registered, &room_lock))
            };
            if still_registered {
                break existing;
            }
            debug!("ROOM {}: removed during join, retrying", room_name);
            room_lock.write().await.participants.remove(name);
        };

        for peer in &existing {
            if let Err(e) = peer.send(&ServerMessage::NewParticipant {
                name: name.to_string(),
            }) {
                warn!("Could not announce {} to {}: {}", name, peer.name(), e);
            }
        }

        self.metrics.inc_joins();
        info!(
            "PARTICIPANT {}: joined room {} ({} prior members)",
            name,
            room_name,
            existing.len()
        );

        let prior_names = existing.iter().map(|p| p.name().to_string()).collect();
        Ok((user, prior_names))
    }

    /// Removes a participant from their room and releases their media
    /// resources. Idempotent: the explicit leave and the transport-close path
    /// both funnel here, and the second invocation is a no-op.
    pub async fn leave(&self, user: &Arc<UserSession>) {
        self.sessions.remove(&user.connection());

        let Some(room_lock) = self.get_room(user.room_name()) else {
            // Room already gone (shutdown or racing leave); still make sure
            // the participant's resources go away exactly once.
            user.release().await;
            return;
        };

        let (removed, remaining) = {
            let mut room = room_lock.write().await;
            let removed = room.participants.remove(user.name()).is_some();
            (removed, room.snapshot())
        }; // room lock released before engine calls and fan-out

        if !removed {
            user.release().await;
            return;
        }

        info!(
            "PARTICIPANT {}: leaving room {}",
            user.name(),
            user.room_name()
        );

        let left = ServerMessage::ParticipantLeft {
            name: user.name().to_string(),
        };
        for peer in &remaining {
            peer.cancel_video_from(user.name()).await;
            if let Err(e) = peer.send(&left) {
                warn!(
                    "Could not notify {} that {} left: {}",
                    peer.name(),
                    user.name(),
                    e
                );
            }
        }

        user.release().await;
        self.metrics.inc_leaves();
        self.remove_room_if_empty(user.room_name()).await;
    }

    /// Removes a room from the registry once its participant set is empty.
    /// Re-checks emptiness under the outer write lock so a concurrent joiner
    /// is never orphaned.
    async fn remove_room_if_empty(&self, name: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let should_remove = if let Some(room_lock) = rooms.get(name) {
            if let Ok(room) = room_lock.try_write() {
                if room.is_empty() {
                    info!("ROOM {}: empty, removed", room.name);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        } else {
            false
        };
        if should_remove {
            rooms.remove(name);
        }
    }

    /// Broadcasts a chat message to every participant currently in the
    /// sender's room. A per-recipient delivery failure is logged and does not
    /// abort delivery to the rest.
    pub async fn broadcast_chat(&self, user: &Arc<UserSession>, sender: &str, content: String) {
        let Some(room_lock) = self.get_room(user.room_name()) else {
            debug!(
                "Chat from {} for missing room {}, dropping",
                user.name(),
                user.room_name()
            );
            return;
        };

        let recipients = {
            let room = room_lock.read().await;
            room.snapshot()
        };

        let message = ServerMessage::ReceiveTextAnswer {
            sender: sender.to_string(),
            content,
        };
        for peer in &recipients {
            if let Err(e) = peer.send(&message) {
                warn!("Chat delivery to {} failed: {}", peer.name(), e);
            }
        }
    }

    /// Creates the visual-effect filter on the publisher's pipeline, inserts
    /// it behind their outbound stream, and connects it into every current
    /// viewer's inbound endpoint for that publisher.
    ///
    /// The publisher's own local preview intentionally stays unfiltered; see
    /// DESIGN.md.
    pub async fn start_filter(&self, user: &Arc<UserSession>) -> SignalResult<MediaElement> {
        info!(
            "PARTICIPANT {}: starting filter in room {}",
            user.name(),
            user.room_name()
        );

        let filter = self.engine.create_filter(user.pipeline(), &self.filter).await?;
        if let Err(e) = self.engine.connect(user.outbound(), &filter).await {
            if let Err(release_err) = self.engine.release_element(&filter).await {
                warn!(
                    "Could not release unwired filter for {}: {}",
                    user.name(),
                    release_err
                );
            }
            return Err(e.into());
        }

        let viewers: Vec<Arc<UserSession>> = match self.get_room(user.room_name()) {
            Some(room_lock) => {
                let room = room_lock.read().await;
                room.snapshot()
            }
            None => Vec::new(),
        };

        for viewer in &viewers {
            if viewer.name() == user.name() {
                debug!(
                    "PARTICIPANT {}: own preview stays unfiltered",
                    user.name()
                );
                continue;
            }
            match viewer.inbound_for(user.name()).await {
                Some(endpoint) => {
                    if let Err(e) = self.engine.connect(&filter, &endpoint).await {
                        warn!(
                            "Could not attach filter to {}'s view of {}: {}",
                            viewer.name(),
                            user.name(),
                            e
                        );
                    }
                }
                None => debug!(
                    "{} has not negotiated {}'s stream yet, skipping filter attach",
                    viewer.name(),
                    user.name()
                ),
            }
        }

        Ok(filter)
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total participant count across all rooms
    pub fn participant_count(&self) -> usize {
        self.sessions.participant_count()
    }

    /// Gracefully shuts down all rooms, releasing every participant's media
    /// resources.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (name, room_lock) in &all_rooms {
            let members = {
                let room = room_lock.read().await;
                room.snapshot()
            };
            for user in &members {
                self.sessions.remove(&user.connection());
                user.release().await;
            }
            info!("Shut down room {} ({} participants)", name, members.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FakeMediaEngine;
    use serde_json::Value;

    fn make_registry() -> (Arc<FakeMediaEngine>, RoomRegistry) {
        let fake = Arc::new(FakeMediaEngine::new());
        let engine: Arc<dyn MediaEngine> = fake.clone();
        let registry = RoomRegistry::new(
            engine,
            Arc::new(SessionRegistry::new()),
            FilterParams::default(),
            ServerMetrics::new(),
        );
        (fake, registry)
    }

    /// Drains every message currently queued for a client and parses it.
    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    fn count_with_id(messages: &[Value], id: &str) -> usize {
        messages.iter().filter(|m| m["id"] == id).count()
    }

    async fn join(
        registry: &RoomRegistry,
        room: &str,
        name: &str,
    ) -> (
        Arc<UserSession>,
        Vec<String>,
        mpsc::Receiver<Arc<String>>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let (user, existing) = registry
            .join(room, name, ConnectionId::new(), tx)
            .await
            .unwrap();
        (user, existing, rx)
    }

    #[tokio::test]
    async fn test_join_sequence_notifications() {
        let (_fake, registry) = make_registry();

        let (_alice, alice_existing, mut alice_rx) = join(&registry, "r1", "alice").await;
        assert!(alice_existing.is_empty());

        let (_bob, bob_existing, _bob_rx) = join(&registry, "r1", "bob").await;
        assert_eq!(bob_existing, vec!["alice".to_string()]);

        let alice_msgs = drain(&mut alice_rx);
        assert_eq!(count_with_id(&alice_msgs, "newParticipant"), 1);
        assert_eq!(alice_msgs[0]["name"], "bob");
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining_and_removes_empty_room() {
        let (fake, registry) = make_registry();

        let (alice, _, _alice_rx) = join(&registry, "r1", "alice").await;
        let (bob, _, mut bob_rx) = join(&registry, "r1", "bob").await;
        drain(&mut bob_rx);

        registry.leave(&alice).await;

        let bob_msgs = drain(&mut bob_rx);
        assert_eq!(count_with_id(&bob_msgs, "participantLeft"), 1);
        assert_eq!(bob_msgs[0]["name"], "alice");
        assert!(fake.pipeline_released(alice.pipeline()));
        // Room still exists while non-empty.
        assert_eq!(registry.room_count(), 1);

        registry.leave(&bob).await;
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.participant_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (_fake, registry) = make_registry();

        let (alice, _, _alice_rx) = join(&registry, "r1", "alice").await;
        let (_bob, _, mut bob_rx) = join(&registry, "r1", "bob").await;
        drain(&mut bob_rx);

        // Explicit leave followed by the transport-close path.
        registry.leave(&alice).await;
        registry.leave(&alice).await;

        let bob_msgs = drain(&mut bob_rx);
        assert_eq!(count_with_id(&bob_msgs, "participantLeft"), 1);
    }

    #[tokio::test]
    async fn test_leave_releases_viewer_inbound_endpoints() {
        let (fake, registry) = make_registry();

        let (alice, _, _alice_rx) = join(&registry, "r1", "alice").await;
        let (bob, _, _bob_rx) = join(&registry, "r1", "bob").await;

        bob.receive_video_from(&alice, "offer").await.unwrap();
        let inbound = bob.inbound_for("alice").await.unwrap();

        registry.leave(&alice).await;

        assert!(fake.element_released(&inbound));
        assert!(bob.inbound_for("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_rejoining_emptied_room_creates_fresh_room() {
        let (_fake, registry) = make_registry();

        let (alice, _, _rx) = join(&registry, "r1", "alice").await;
        registry.leave(&alice).await;
        assert_eq!(registry.room_count(), 0);

        let (_alice2, existing, _rx2) = join(&registry, "r1", "alice").await;
        assert!(existing.is_empty());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_chat_is_room_scoped() {
        let (_fake, registry) = make_registry();

        let (x, _, mut x_rx) = join(&registry, "a", "x").await;
        let (_y, _, mut y_rx) = join(&registry, "a", "y").await;
        let (_z, _, mut z_rx) = join(&registry, "b", "z").await;
        drain(&mut x_rx);
        drain(&mut y_rx);
        drain(&mut z_rx);

        registry.broadcast_chat(&x, "x", "hello".into()).await;

        let y_msgs = drain(&mut y_rx);
        assert_eq!(count_with_id(&y_msgs, "receiveTextAnswer"), 1);
        assert_eq!(y_msgs[0]["sender"], "x");
        assert_eq!(y_msgs[0]["content"], "hello");

        // Sender's own room hears it too; the other room does not.
        assert_eq!(count_with_id(&drain(&mut x_rx), "receiveTextAnswer"), 1);
        assert_eq!(count_with_id(&drain(&mut z_rx), "receiveTextAnswer"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_joins_create_exactly_one_room() {
        let (_fake, registry) = make_registry();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(64);
                let result = registry
                    .join("fresh", &format!("user-{i}"), ConnectionId::new(), tx)
                    .await;
                (result, rx)
            }));
        }
        for handle in handles {
            let (result, _rx) = handle.await.unwrap();
            result.unwrap();
        }

        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.participant_count(), 8);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected_without_disturbing_original() {
        let (fake, registry) = make_registry();

        let (alice, _, mut alice_rx) = join(&registry, "r1", "alice").await;

        let (tx, _rx) = mpsc::channel(64);
        let result = registry.join("r1", "alice", ConnectionId::new(), tx).await;
        assert!(matches!(result, Err(SignalError::DuplicateIdentity(_))));

        // The original session is untouched and got no notification.
        assert_eq!(registry.participant_count(), 1);
        assert!(!fake.pipeline_released(alice.pipeline()));
        assert_eq!(count_with_id(&drain(&mut alice_rx), "newParticipant"), 0);
    }

    #[tokio::test]
    async fn test_media_failure_leaves_no_partial_state() {
        let (fake, registry) = make_registry();
        fake.set_fail_pipelines(true);

        let (tx, _rx) = mpsc::channel(64);
        let result = registry.join("r1", "alice", ConnectionId::new(), tx).await;
        assert!(matches!(result, Err(SignalError::MediaEngine(_))));

        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.participant_count(), 0);
    }

    #[tokio::test]
    async fn test_filter_fans_out_to_current_viewers() {
        let (fake, registry) = make_registry();

        let (alice, _, _a_rx) = join(&registry, "r1", "alice").await;
        let (bob, _, _b_rx) = join(&registry, "r1", "bob").await;
        let (carol, _, _c_rx) = join(&registry, "r1", "carol").await;

        // Bob is already viewing alice; carol has not negotiated yet.
        bob.receive_video_from(&alice, "offer").await.unwrap();
        assert_eq!(fake.connection_count(), 1);

        let filter = registry.start_filter(&alice).await.unwrap();

        // Exactly two new links: outbound -> filter and filter -> bob.
        assert_eq!(fake.connection_count(), 3);

        assert!(fake.is_connected(alice.outbound(), &filter));
        let bob_inbound = bob.inbound_for("alice").await.unwrap();
        assert!(fake.is_connected(&filter, &bob_inbound));
        // No connection into carol's (nonexistent) inbound endpoint, and the
        // publisher's own outbound is not a filter sink.
        assert!(carol.inbound_for("alice").await.is_none());
        assert!(!fake.is_connected(&filter, alice.outbound()));
    }

    #[tokio::test]
    async fn test_filter_connect_failure_releases_filter() {
        let (fake, registry) = make_registry();
        let (alice, _, _a_rx) = join(&registry, "r1", "alice").await;
        let baseline = fake.element_count();

        fake.set_fail_connects(true);
        let result = registry.start_filter(&alice).await;

        assert!(matches!(result, Err(SignalError::MediaEngine(_))));
        // The unwired filter does not linger in the pipeline.
        assert_eq!(fake.element_count(), baseline);
    }

    #[tokio::test]
    async fn test_chat_delivery_failure_is_isolated_per_recipient() {
        let (_fake, registry) = make_registry();

        let (x, _, mut x_rx) = join(&registry, "a", "x").await;
        let (_y, _, mut y_rx) = join(&registry, "a", "y").await;
        let (_z, _, z_rx) = join(&registry, "a", "z").await;
        drain(&mut x_rx);
        drain(&mut y_rx);
        // z's connection is gone; sends to it fail with a closed channel.
        drop(z_rx);

        registry.broadcast_chat(&x, "x", "hello".into()).await;

        assert_eq!(count_with_id(&drain(&mut x_rx), "receiveTextAnswer"), 1);
        assert_eq!(count_with_id(&drain(&mut y_rx), "receiveTextAnswer"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_stays_visible_against_concurrent_last_leave() {
        let (_fake, registry) = make_registry();
        let registry = Arc::new(registry);

        for i in 0..200 {
            let (leaver, _, _leaver_rx) =
                join(&registry, "churn", &format!("leaver-{i}")).await;

            let leave_registry = registry.clone();
            let leave_task = tokio::spawn(async move {
                leave_registry.leave(&leaver).await;
            });

            let join_registry = registry.clone();
            let stayer_name = format!("stayer-{i}");
            let join_task = tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(64);
                let result = join_registry
                    .join("churn", &stayer_name, ConnectionId::new(), tx)
                    .await;
                (result, rx)
            });

            let (result, _stayer_rx) = join_task.await.unwrap();
            let (stayer, _) = result.unwrap();
            leave_task.await.unwrap();

            // A join that returned Ok must be visible to the next lookup,
            // even when it raced a last-leaver's empty-room removal.
            let room_lock = registry
                .get_room("churn")
                .expect("room holding a member must stay registered");
            assert!(room_lock
                .read()
                .await
                .participants
                .contains_key(stayer.name()));

            registry.leave(&stayer).await;
        }

        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everyone() {
        let (fake, registry) = make_registry();

        let (alice, _, _a_rx) = join(&registry, "r1", "alice").await;
        let (bob, _, _b_rx) = join(&registry, "r2", "bob").await;

        registry.shutdown().await;

        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.participant_count(), 0);
        assert!(fake.pipeline_released(alice.pipeline()));
        assert!(fake.pipeline_released(bob.pipeline()));
    }
}
