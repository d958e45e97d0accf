//! Single-writer room coordinator.
//!
//! One long-lived task drains one command queue and is the only code that
//! mutates room membership, so no per-room locking is needed. Broadcast
//! fan-out goes through the registry's bounded queues; a member whose queue
//! is full is dropped from the room instead of ever blocking delivery to the
//! rest.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use notably_common::{ClientEvent, ServerEvent, ThreadId, UserId};
use tokio::sync::{mpsc, oneshot};

use super::registry::{ConnId, ConnectionRegistry, SendOutcome};

/// Capacity of the coordinator's inbound command queue.
const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Commands processed by the coordinator task.
#[derive(Debug)]
pub enum HubCommand {
    /// A decoded client event, tagged with the authenticated originator.
    Client { user_id: UserId, event: ClientEvent },
    /// A connection's pumps have terminated.
    Disconnected { user_id: UserId, conn_id: ConnId },
    /// Membership snapshot for one room; `None` if the room does not exist.
    RoomMembers {
        thread_id: ThreadId,
        reply: oneshot::Sender<Option<Vec<UserId>>>,
    },
    Shutdown,
}

/// Error returned when the coordinator task has stopped.
#[derive(Debug)]
pub struct HubClosed;

impl fmt::Display for HubClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hub coordinator has shut down")
    }
}

impl std::error::Error for HubClosed {}

/// Cloneable handle for pushing commands into the coordinator.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn client_event(&self, user_id: UserId, event: ClientEvent) -> Result<(), HubClosed> {
        self.tx
            .send(HubCommand::Client { user_id, event })
            .await
            .map_err(|_| HubClosed)
    }

    pub async fn disconnected(&self, user_id: UserId, conn_id: ConnId) -> Result<(), HubClosed> {
        self.tx
            .send(HubCommand::Disconnected { user_id, conn_id })
            .await
            .map_err(|_| HubClosed)
    }

    /// Current members of a room, `None` if the room does not exist (or the
    /// coordinator has stopped).
    pub async fn room_members(&self, thread_id: ThreadId) -> Option<Vec<UserId>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::RoomMembers { thread_id, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Ask the coordinator task to exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown).await;
    }
}

/// Owner of all room-membership state.
pub struct RoomCoordinator {
    registry: Arc<ConnectionRegistry>,
    rooms: HashMap<ThreadId, HashMap<UserId, ConnId>>,
    rx: mpsc::Receiver<HubCommand>,
}

impl RoomCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let coordinator = Self {
            registry,
            rooms: HashMap::new(),
            rx,
        };
        (coordinator, HubHandle { tx })
    }

    /// Drain the command queue until `Shutdown` arrives or every handle is
    /// dropped. Spawn this on the runtime that owns the hub's lifecycle.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            if matches!(command, HubCommand::Shutdown) {
                tracing::info!("hub coordinator shutting down");
                break;
            }
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Client { user_id, event } => self.handle_client_event(user_id, event),
            HubCommand::Disconnected { user_id, conn_id } => {
                self.handle_disconnect(user_id, conn_id)
            }
            HubCommand::RoomMembers { thread_id, reply } => {
                let members = self
                    .rooms
                    .get(&thread_id)
                    .map(|room| room.keys().copied().collect());
                let _ = reply.send(members);
            }
            HubCommand::Shutdown => {}
        }
    }

    fn handle_client_event(&mut self, user_id: UserId, event: ClientEvent) {
        match event {
            ClientEvent::ThreadJoin { thread_id } => self.handle_join(thread_id, user_id),
            ClientEvent::ThreadLeave { thread_id } => self.handle_leave(thread_id, user_id),
            // Content events echo to every member, originator included; the
            // client reconciles its optimistic state against the echo.
            ClientEvent::NoteAdd { thread_id, note } => {
                self.broadcast(thread_id, None, &ServerEvent::NoteAdded { thread_id, note });
            }
            ClientEvent::NoteUpdate { thread_id, note } => {
                self.broadcast(thread_id, None, &ServerEvent::NoteUpdated { thread_id, note });
            }
            ClientEvent::NoteDelete { thread_id, note_id } => {
                self.broadcast(thread_id, None, &ServerEvent::NoteDeleted { thread_id, note_id });
            }
            ClientEvent::UserTyping { thread_id, is_typing } => {
                self.broadcast(
                    thread_id,
                    Some(user_id),
                    &ServerEvent::UserTyping { thread_id, user_id, is_typing },
                );
            }
        }
    }

    fn handle_join(&mut self, thread_id: ThreadId, user_id: UserId) {
        let Some(handle) = self.registry.get(user_id) else {
            // The connection died between enqueue and processing; its pending
            // disconnect command will find no membership to clean up either.
            tracing::debug!(%user_id, %thread_id, "join from unregistered user dropped");
            return;
        };

        // Re-joining through a new connection overwrites the stale entry.
        self.rooms
            .entry(thread_id)
            .or_default()
            .insert(user_id, handle.conn_id);
        tracing::debug!(%user_id, %thread_id, "user joined room");

        self.broadcast(
            thread_id,
            Some(user_id),
            &ServerEvent::UserJoined { thread_id, user_id },
        );
    }

    fn handle_leave(&mut self, thread_id: ThreadId, user_id: UserId) {
        let Some(room) = self.rooms.get_mut(&thread_id) else {
            return;
        };
        if room.remove(&user_id).is_none() {
            // Not a member: nothing to broadcast.
            return;
        }
        if room.is_empty() {
            self.rooms.remove(&thread_id);
        }
        tracing::debug!(%user_id, %thread_id, "user left room");

        self.broadcast(thread_id, None, &ServerEvent::UserLeft { thread_id, user_id });
    }

    /// Remove the disconnected connection's membership from every room it was
    /// in, and tell each affected room. Memberships the user has since
    /// re-established over a newer connection are left alone.
    fn handle_disconnect(&mut self, user_id: UserId, conn_id: ConnId) {
        let mut affected = Vec::new();
        self.rooms.retain(|&thread_id, room| {
            if room.get(&user_id) == Some(&conn_id) {
                room.remove(&user_id);
                affected.push(thread_id);
            }
            !room.is_empty()
        });

        if !affected.is_empty() {
            tracing::debug!(%user_id, conn_id, rooms = affected.len(), "disconnect cleanup");
        }
        for thread_id in affected {
            self.broadcast(thread_id, None, &ServerEvent::UserLeft { thread_id, user_id });
        }
    }

    /// Serialize `event` once and enqueue it to every member of the room,
    /// skipping `exclude`. Members whose queue is full or gone are removed
    /// from this room; their removal never blocks or skips the others.
    fn broadcast(&mut self, thread_id: ThreadId, exclude: Option<UserId>, event: &ServerEvent) {
        let Some(room) = self.rooms.get(&thread_id) else {
            return;
        };
        let targets: Vec<UserId> = room
            .keys()
            .copied()
            .filter(|&member| Some(member) != exclude)
            .collect();
        if targets.is_empty() {
            return;
        }

        let frame = Utf8Bytes::from(serde_json::to_string(event).unwrap());

        let mut dropped = Vec::new();
        for member in targets {
            match self.registry.send(member, frame.clone()) {
                SendOutcome::Delivered => {}
                SendOutcome::QueueFull | SendOutcome::NotConnected => dropped.push(member),
            }
        }

        if !dropped.is_empty() {
            if let Some(room) = self.rooms.get_mut(&thread_id) {
                for member in dropped {
                    room.remove(&member);
                    tracing::debug!(user_id = %member, %thread_id, "removed undeliverable member");
                }
                if room.is_empty() {
                    self.rooms.remove(&thread_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use notably_common::{Note, NoteId};

    use super::*;

    fn setup() -> (RoomCoordinator, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (coordinator, _handle) = RoomCoordinator::new(registry.clone());
        (coordinator, registry)
    }

    fn connect(
        registry: &ConnectionRegistry,
        user: u64,
        capacity: usize,
    ) -> (ConnId, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn_id = registry.register(UserId(user), tx);
        (conn_id, rx)
    }

    fn recv_event(rx: &mut mpsc::Receiver<Utf8Bytes>) -> Option<ServerEvent> {
        rx.try_recv()
            .ok()
            .map(|frame| serde_json::from_str(&frame).unwrap())
    }

    fn drain(rx: &mut mpsc::Receiver<Utf8Bytes>) {
        while rx.try_recv().is_ok() {}
    }

    fn join(coordinator: &mut RoomCoordinator, thread: u64, user: u64) {
        coordinator.handle_client_event(
            UserId(user),
            ClientEvent::ThreadJoin { thread_id: ThreadId(thread) },
        );
    }

    fn make_note(id: u64, thread: u64, user: u64, content: &str) -> Note {
        let now = Utc::now();
        Note {
            id: NoteId(id),
            thread_id: ThreadId(thread),
            user_id: UserId(user),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn members(coordinator: &RoomCoordinator, thread: u64) -> Option<Vec<UserId>> {
        coordinator.rooms.get(&ThreadId(thread)).map(|room| {
            let mut ids: Vec<UserId> = room.keys().copied().collect();
            ids.sort();
            ids
        })
    }

    #[test]
    fn join_notifies_existing_members_only() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        // Nobody else in the room yet.
        assert_eq!(recv_event(&mut rx1), None);

        join(&mut coordinator, 7, 2);
        assert_eq!(
            recv_event(&mut rx1),
            Some(ServerEvent::UserJoined { thread_id: ThreadId(7), user_id: UserId(2) })
        );
        // The joiner never receives its own join.
        assert_eq!(recv_event(&mut rx2), None);
    }

    #[test]
    fn membership_tracks_joins_and_leaves() {
        let (mut coordinator, registry) = setup();
        let (_, _rx1) = connect(&registry, 1, 8);
        let (_, _rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);
        assert_eq!(members(&coordinator, 7), Some(vec![UserId(1), UserId(2)]));

        coordinator
            .handle_client_event(UserId(1), ClientEvent::ThreadLeave { thread_id: ThreadId(7) });
        assert_eq!(members(&coordinator, 7), Some(vec![UserId(2)]));
    }

    #[test]
    fn leave_broadcasts_to_remaining_members() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);
        let (_, _rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);
        drain(&mut rx1);

        coordinator
            .handle_client_event(UserId(2), ClientEvent::ThreadLeave { thread_id: ThreadId(7) });
        assert_eq!(
            recv_event(&mut rx1),
            Some(ServerEvent::UserLeft { thread_id: ThreadId(7), user_id: UserId(2) })
        );
    }

    #[test]
    fn emptied_room_is_deleted() {
        let (mut coordinator, registry) = setup();
        let (_, _rx1) = connect(&registry, 1, 8);

        join(&mut coordinator, 7, 1);
        assert!(coordinator.rooms.contains_key(&ThreadId(7)));

        coordinator
            .handle_client_event(UserId(1), ClientEvent::ThreadLeave { thread_id: ThreadId(7) });
        assert!(!coordinator.rooms.contains_key(&ThreadId(7)));
    }

    #[test]
    fn leave_when_not_a_member_broadcasts_nothing() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);
        let (_, _rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);

        coordinator
            .handle_client_event(UserId(2), ClientEvent::ThreadLeave { thread_id: ThreadId(7) });
        assert_eq!(recv_event(&mut rx1), None);
        assert_eq!(members(&coordinator, 7), Some(vec![UserId(1)]));
    }

    #[test]
    fn note_update_echoes_to_every_member() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);
        drain(&mut rx1);

        let note = make_note(3, 7, 1, "x");
        coordinator.handle_client_event(
            UserId(1),
            ClientEvent::NoteUpdate { thread_id: ThreadId(7), note: note.clone() },
        );

        let expected = ServerEvent::NoteUpdated { thread_id: ThreadId(7), note };
        assert_eq!(recv_event(&mut rx1), Some(expected.clone()));
        assert_eq!(recv_event(&mut rx2), Some(expected));
        // Exactly one each.
        assert_eq!(recv_event(&mut rx1), None);
        assert_eq!(recv_event(&mut rx2), None);
    }

    #[test]
    fn note_delete_reaches_the_whole_room() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);
        drain(&mut rx1);

        coordinator.handle_client_event(
            UserId(2),
            ClientEvent::NoteDelete { thread_id: ThreadId(7), note_id: NoteId(3) },
        );

        let expected =
            ServerEvent::NoteDeleted { thread_id: ThreadId(7), note_id: NoteId(3) };
        assert_eq!(recv_event(&mut rx1), Some(expected.clone()));
        assert_eq!(recv_event(&mut rx2), Some(expected));
    }

    #[test]
    fn typing_is_never_echoed_to_the_typist() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);
        drain(&mut rx1);

        coordinator.handle_client_event(
            UserId(2),
            ClientEvent::UserTyping { thread_id: ThreadId(7), is_typing: true },
        );

        assert_eq!(
            recv_event(&mut rx1),
            Some(ServerEvent::UserTyping {
                thread_id: ThreadId(7),
                user_id: UserId(2),
                is_typing: true,
            })
        );
        assert_eq!(recv_event(&mut rx2), None);
    }

    #[test]
    fn disconnect_removes_user_from_every_room() {
        let (mut coordinator, registry) = setup();
        let (conn1, _rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 1, 1);
        join(&mut coordinator, 2, 1);
        join(&mut coordinator, 3, 1);
        join(&mut coordinator, 1, 2);
        join(&mut coordinator, 3, 2);
        drain(&mut rx2);

        registry.unregister(UserId(1), conn1);
        coordinator.handle_disconnect(UserId(1), conn1);

        // Every membership is gone, not just the most recent room.
        assert_eq!(members(&coordinator, 1), Some(vec![UserId(2)]));
        assert_eq!(members(&coordinator, 2), None); // emptied, deleted
        assert_eq!(members(&coordinator, 3), Some(vec![UserId(2)]));

        // One user_left per shared room.
        let mut lefts = Vec::new();
        while let Some(event) = recv_event(&mut rx2) {
            match event {
                ServerEvent::UserLeft { thread_id, user_id } => {
                    assert_eq!(user_id, UserId(1));
                    lefts.push(thread_id);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        lefts.sort();
        assert_eq!(lefts, vec![ThreadId(1), ThreadId(3)]);
    }

    #[test]
    fn stale_membership_is_cleaned_when_old_connection_dies() {
        let (mut coordinator, registry) = setup();
        let (conn1, _rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);
        drain(&mut rx2);

        // User 1 reconnects but does not re-join; the room entry is stale.
        let (_conn2, _rx1b) = connect(&registry, 1, 8);
        coordinator.handle_disconnect(UserId(1), conn1);

        assert_eq!(members(&coordinator, 7), Some(vec![UserId(2)]));
        assert_eq!(
            recv_event(&mut rx2),
            Some(ServerEvent::UserLeft { thread_id: ThreadId(7), user_id: UserId(1) })
        );
    }

    #[test]
    fn superseded_disconnect_spares_a_rejoined_member() {
        let (mut coordinator, registry) = setup();
        let (conn1, _rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);

        // User 1 reconnects and re-joins before the old pumps finish tearing
        // down; the membership now belongs to the new connection.
        let (_conn2, _rx1b) = connect(&registry, 1, 8);
        join(&mut coordinator, 7, 1);
        drain(&mut rx2);

        coordinator.handle_disconnect(UserId(1), conn1);

        assert_eq!(members(&coordinator, 7), Some(vec![UserId(1), UserId(2)]));
        assert_eq!(recv_event(&mut rx2), None);
    }

    #[test]
    fn full_queue_drops_member_without_affecting_others() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);
        let (_, mut rx2) = connect(&registry, 2, 8);
        let (_, mut rx3) = connect(&registry, 3, 1);

        join(&mut coordinator, 7, 1);
        join(&mut coordinator, 7, 2);
        join(&mut coordinator, 7, 3);
        drain(&mut rx1);
        drain(&mut rx2);

        // First broadcast fills user 3's single-slot queue.
        coordinator.handle_client_event(
            UserId(1),
            ClientEvent::NoteAdd { thread_id: ThreadId(7), note: make_note(3, 7, 1, "a") },
        );
        // Second broadcast overflows it; user 3 is dropped, the rest deliver.
        coordinator.handle_client_event(
            UserId(1),
            ClientEvent::NoteAdd { thread_id: ThreadId(7), note: make_note(4, 7, 1, "b") },
        );

        assert_eq!(members(&coordinator, 7), Some(vec![UserId(1), UserId(2)]));
        assert!(!registry.contains(UserId(3)));

        let mut count1 = 0;
        while recv_event(&mut rx1).is_some() {
            count1 += 1;
        }
        assert_eq!(count1, 2);
        let mut count2 = 0;
        while recv_event(&mut rx2).is_some() {
            count2 += 1;
        }
        assert_eq!(count2, 2);

        // The slow member saw only the frame that fit before the drop closed
        // its queue.
        assert!(recv_event(&mut rx3).is_some());
        assert_eq!(rx3.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[test]
    fn join_from_unregistered_user_is_dropped() {
        let (mut coordinator, _registry) = setup();
        join(&mut coordinator, 7, 1);
        assert!(coordinator.rooms.is_empty());
    }

    #[test]
    fn content_event_for_unknown_room_is_a_noop() {
        let (mut coordinator, registry) = setup();
        let (_, mut rx1) = connect(&registry, 1, 8);

        coordinator.handle_client_event(
            UserId(1),
            ClientEvent::NoteAdd { thread_id: ThreadId(99), note: make_note(3, 99, 1, "a") },
        );
        assert_eq!(recv_event(&mut rx1), None);
    }
}
