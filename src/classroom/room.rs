use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::relay::Outbound;

/// Unique identifier of one connection task, used to guard removals so a
/// superseded session cannot evict its replacement from the registry.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Teacher,
    Student,
}

/// One active connection's registry record. Owned by its session; the
/// registry listing is a non-owning copy used for lookup and broadcast.
#[derive(Debug, Clone)]
pub struct Participant {
    pub conn_id: ConnId,
    pub username: String,
    pub role: Role,
    pub permissions: HashMap<String, bool>,
    pub outbound: Outbound,
}

/// Roster line sent in `student_list` broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub username: String,
    pub permissions: HashMap<String, bool>,
}

#[derive(Debug, Default)]
struct RoomState {
    teacher: Option<Participant>,
    students: HashMap<String, Participant>,
    is_live: bool,
    /// Broadcast group: every connection addressed to this room, joined or not.
    subscribers: HashMap<ConnId, Outbound>,
}

impl RoomState {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.teacher.is_none() && self.students.is_empty()
    }
}

/// Owns the room-code -> room-state mapping. Rooms are created implicitly on
/// first reference and evicted once their last connection deregisters.
///
/// Locking is two-level: the outer map lock is write-held only for room
/// creation and eviction, so operations on different rooms never block each
/// other, while the per-room lock linearizes all mutations and snapshots of
/// one room's membership.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<RwLock<RoomState>>>>,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
        })
    }

    /// Run a mutation against the room's state, creating the room on first
    /// reference. The outer map guard is held across the inner-lock write:
    /// releasing it first would let a concurrent eviction remove the room in
    /// the gap and strand the mutation in an orphaned state.
    async fn with_room_entry<R>(&self, code: &str, mutate: impl FnOnce(&mut RoomState) -> R) -> R {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(code) {
                let mut state = room.write().await;
                return mutate(&mut state);
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(code.to_string()).or_insert_with(|| {
            tracing::info!(room = %code, "Created room");
            Arc::new(RwLock::new(RoomState::default()))
        });
        let mut state = room.write().await;
        mutate(&mut state)
    }

    async fn room(&self, code: &str) -> Option<Arc<RwLock<RoomState>>> {
        let rooms = self.rooms.read().await;
        rooms.get(code).cloned()
    }

    /// Add a connection to the room's broadcast group. Happens at connect
    /// time, before any join, so unjoined connections receive broadcasts.
    pub async fn register(&self, code: &str, conn_id: ConnId, outbound: Outbound) {
        self.with_room_entry(code, |state| {
            state.subscribers.insert(conn_id, outbound);
        })
        .await;
        tracing::debug!(room = %code, conn_id = conn_id, "Connection registered");
    }

    /// Remove a connection from the broadcast group and evict the room once
    /// nothing references it anymore.
    pub async fn deregister(&self, code: &str, conn_id: ConnId) {
        // Common case first: removal under the shared map lock, so one
        // room's disconnects never serialize the others.
        let observed_empty = {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(code) else {
                return;
            };
            let mut state = room.write().await;
            state.subscribers.remove(&conn_id);
            state.is_empty()
        };

        if observed_empty {
            let mut rooms = self.rooms.write().await;
            if let Some(room) = rooms.get(code) {
                // Re-check under the exclusive lock: a connection may have
                // registered since the room was observed empty.
                let still_empty = room.read().await.is_empty();
                if still_empty {
                    rooms.remove(code);
                    tracing::info!(room = %code, "Room evicted");
                }
            }
        }
    }

    /// Set the room's teacher, returning any previous record so the caller
    /// can close the superseded connection. At most one teacher at any time.
    pub async fn add_teacher(&self, code: &str, participant: Participant) -> Option<Participant> {
        let previous = self
            .with_room_entry(code, |state| state.teacher.replace(participant))
            .await;
        if previous.is_some() {
            tracing::warn!(room = %code, "Teacher replaced by a new connection");
        } else {
            tracing::info!(room = %code, "Teacher joined room");
        }
        previous
    }

    /// Insert a student, silently overwriting any entry with the same
    /// username. Returns the overwritten record if there was one.
    pub async fn add_student(&self, code: &str, participant: Participant) -> Option<Participant> {
        let username = participant.username.clone();
        let previous = self
            .with_room_entry(code, |state| state.students.insert(participant.username.clone(), participant))
            .await;
        if previous.is_some() {
            tracing::warn!(room = %code, username = %username, "Student entry overwritten by rejoin");
        } else {
            tracing::info!(room = %code, username = %username, "Student joined room");
        }
        previous
    }

    /// Clear the teacher slot and force the room off-live, but only if the
    /// stored record belongs to `conn_id`. A stale replaced session must not
    /// evict the current teacher.
    pub async fn remove_teacher(&self, code: &str, conn_id: ConnId) -> bool {
        let Some(room) = self.room(code).await else {
            return false;
        };
        let mut state = room.write().await;
        let owns_entry = state.teacher.as_ref().is_some_and(|t| t.conn_id == conn_id);
        if owns_entry {
            state.teacher = None;
            state.is_live = false;
            tracing::info!(room = %code, "Teacher left room");
        }
        owns_entry
    }

    /// Delete a student entry, guarded by connection identity like
    /// [`remove_teacher`](Self::remove_teacher). No-op if absent.
    pub async fn remove_student(&self, code: &str, username: &str, conn_id: ConnId) -> bool {
        let Some(room) = self.room(code).await else {
            return false;
        };
        let mut state = room.write().await;
        let owns_entry = state.students.get(username).is_some_and(|s| s.conn_id == conn_id);
        if owns_entry {
            state.students.remove(username);
            tracing::info!(room = %code, username = %username, "Student left room");
        }
        owns_entry
    }

    pub async fn set_live(&self, code: &str, live: bool) {
        if let Some(room) = self.room(code).await {
            let mut state = room.write().await;
            state.is_live = live;
            tracing::info!(room = %code, live = live, "Room live state changed");
        }
    }

    pub async fn is_live(&self, code: &str) -> bool {
        match self.room(code).await {
            Some(room) => room.read().await.is_live,
            None => false,
        }
    }

    /// Consistent point-in-time roster snapshot, ordered by username.
    pub async fn snapshot_students(&self, code: &str) -> Vec<RosterEntry> {
        let Some(room) = self.room(code).await else {
            return Vec::new();
        };
        let state = room.read().await;
        let mut roster: Vec<RosterEntry> = state
            .students
            .values()
            .map(|s| RosterEntry {
                username: s.username.clone(),
                permissions: s.permissions.clone(),
            })
            .collect();
        roster.sort_by(|a, b| a.username.cmp(&b.username));
        roster
    }

    pub async fn teacher_handle(&self, code: &str) -> Option<Outbound> {
        let room = self.room(code).await?;
        let state = room.read().await;
        state.teacher.as_ref().map(|t| t.outbound.clone())
    }

    pub async fn student_handle(&self, code: &str, username: &str) -> Option<Outbound> {
        let room = self.room(code).await?;
        let state = room.read().await;
        state.students.get(username).map(|s| s.outbound.clone())
    }

    /// Resolve a username against room state, teacher first, then students.
    pub async fn resolve_handle(&self, code: &str, username: &str) -> Option<Outbound> {
        let room = self.room(code).await?;
        let state = room.read().await;
        if let Some(teacher) = &state.teacher {
            if teacher.username == username {
                return Some(teacher.outbound.clone());
            }
        }
        state.students.get(username).map(|s| s.outbound.clone())
    }

    /// Write one permission flag on a student and hand back their delivery
    /// handle in the same critical section, so the follow-up unicast cannot
    /// race the mutation. `None` when the student is not present.
    pub async fn set_permission(
        &self,
        code: &str,
        username: &str,
        permission: &str,
        status: bool,
    ) -> Option<Outbound> {
        let room = self.room(code).await?;
        let mut state = room.write().await;
        let student = state.students.get_mut(username)?;
        student.permissions.insert(permission.to_string(), status);
        Some(student.outbound.clone())
    }

    /// Snapshot of the room's broadcast group, optionally excluding one
    /// connection (e.g. the sender of a `teacher_ready`).
    pub async fn subscribers(&self, code: &str, exclude: Option<ConnId>) -> Vec<Outbound> {
        let Some(room) = self.room(code).await else {
            return Vec::new();
        };
        let state = room.read().await;
        state
            .subscribers
            .iter()
            .filter(|(conn_id, _)| Some(**conn_id) != exclude)
            .map(|(_, outbound)| outbound.clone())
            .collect()
    }

    pub async fn contains_room(&self, code: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms.contains_key(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn participant(conn_id: ConnId, username: &str, role: Role) -> (Participant, mpsc::UnboundedReceiver<warp::ws::Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Participant {
                conn_id,
                username: username.to_string(),
                role,
                permissions: HashMap::new(),
                outbound: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_room_created_implicitly_on_register() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.register("R1", 1, tx).await;
        assert!(registry.contains_room("R1").await);
        assert!(!registry.contains_room("R2").await);
    }

    #[tokio::test]
    async fn test_at_most_one_teacher() {
        let registry = RoomRegistry::new();
        let (first, _rx1) = participant(1, "mr_a", Role::Teacher);
        let (second, _rx2) = participant(2, "mr_b", Role::Teacher);

        assert!(registry.add_teacher("R1", first).await.is_none());
        let replaced = registry.add_teacher("R1", second).await;

        assert_eq!(replaced.unwrap().username, "mr_a");
        assert!(registry.resolve_handle("R1", "mr_b").await.is_some());
        assert!(registry.resolve_handle("R1", "mr_a").await.is_none());
    }

    #[tokio::test]
    async fn test_student_usernames_unique_within_room() {
        let registry = RoomRegistry::new();
        let (first, _rx1) = participant(1, "bob", Role::Student);
        let (second, _rx2) = participant(2, "bob", Role::Student);

        registry.add_student("R1", first).await;
        let replaced = registry.add_student("R1", second).await;

        assert_eq!(replaced.unwrap().conn_id, 1);
        assert_eq!(registry.snapshot_students("R1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_remove_replacement() {
        let registry = RoomRegistry::new();
        let (old, _rx1) = participant(1, "bob", Role::Student);
        let (new, _rx2) = participant(2, "bob", Role::Student);
        registry.add_student("R1", old).await;
        registry.add_student("R1", new).await;

        // Removal guarded by connection id: the overwritten session is a no-op
        assert!(!registry.remove_student("R1", "bob", 1).await);
        assert_eq!(registry.snapshot_students("R1").await.len(), 1);

        assert!(registry.remove_student("R1", "bob", 2).await);
        assert!(registry.snapshot_students("R1").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_teacher_forces_not_live() {
        let registry = RoomRegistry::new();
        let (teacher, _rx) = participant(1, "mr_a", Role::Teacher);
        registry.add_teacher("R1", teacher).await;
        registry.set_live("R1", true).await;
        assert!(registry.is_live("R1").await);

        assert!(registry.remove_teacher("R1", 1).await);
        assert!(!registry.is_live("R1").await);
    }

    #[tokio::test]
    async fn test_stale_teacher_cannot_clear_live_replacement() {
        let registry = RoomRegistry::new();
        let (old, _rx1) = participant(1, "mr_a", Role::Teacher);
        let (new, _rx2) = participant(2, "mr_a", Role::Teacher);
        registry.add_teacher("R1", old).await;
        registry.add_teacher("R1", new).await;
        registry.set_live("R1", true).await;

        assert!(!registry.remove_teacher("R1", 1).await);
        assert!(registry.is_live("R1").await);
        assert!(registry.teacher_handle("R1").await.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_is_ordered_by_username() {
        let registry = RoomRegistry::new();
        for (conn_id, name) in [(1, "zoe"), (2, "alice"), (3, "mike")] {
            let (student, _rx) = participant(conn_id, name, Role::Student);
            registry.add_student("R1", student).await;
        }

        let roster: Vec<String> = registry
            .snapshot_students("R1")
            .await
            .into_iter()
            .map(|e| e.username)
            .collect();
        assert_eq!(roster, vec!["alice", "mike", "zoe"]);
    }

    #[tokio::test]
    async fn test_set_permission_mutates_and_resolves() {
        let registry = RoomRegistry::new();
        let (student, _rx) = participant(1, "bob", Role::Student);
        registry.add_student("R1", student).await;

        assert!(registry.set_permission("R1", "bob", "mic", true).await.is_some());
        assert!(registry.set_permission("R1", "ghost", "mic", true).await.is_none());

        let roster = registry.snapshot_students("R1").await;
        assert_eq!(roster[0].permissions.get("mic"), Some(&true));
    }

    #[tokio::test]
    async fn test_resolve_handle_checks_teacher_first() {
        let registry = RoomRegistry::new();
        let (teacher, _rx1) = participant(1, "mr_a", Role::Teacher);
        let (student, _rx2) = participant(2, "bob", Role::Student);
        registry.add_teacher("R1", teacher).await;
        registry.add_student("R1", student).await;

        assert!(registry.resolve_handle("R1", "mr_a").await.is_some());
        assert!(registry.resolve_handle("R1", "bob").await.is_some());
        assert!(registry.resolve_handle("R1", "ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_subscribers_can_exclude_one_connection() {
        let registry = RoomRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.register("R1", 1, tx1).await;
        registry.register("R1", 2, tx2).await;

        assert_eq!(registry.subscribers("R1", None).await.len(), 2);
        assert_eq!(registry.subscribers("R1", Some(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_room_evicted_when_last_connection_leaves() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("R1", 1, tx).await;

        registry.deregister("R1", 1).await;
        assert!(!registry.contains_room("R1").await);

        // Deregistering again is a harmless no-op
        registry.deregister("R1", 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_eviction_never_strands_a_connection() {
        let registry = RoomRegistry::new();

        // Race a new registration against the departure of the room's last
        // connection. Whatever the interleaving, the registration must land
        // in the reachable room, never in an evicted copy of its state.
        for i in 0..500u64 {
            let old_conn = i * 2;
            let new_conn = old_conn + 1;
            let (old_tx, _old_rx) = mpsc::unbounded_channel();
            registry.register("R1", old_conn, old_tx).await;

            let joining = registry.clone();
            let leaving = registry.clone();
            let join_task = tokio::spawn(async move {
                let (new_tx, new_rx) = mpsc::unbounded_channel();
                joining.register("R1", new_conn, new_tx).await;
                new_rx
            });
            let leave_task = tokio::spawn(async move {
                leaving.deregister("R1", old_conn).await;
            });

            let _new_rx = join_task.await.unwrap();
            leave_task.await.unwrap();

            assert!(registry.contains_room("R1").await);
            assert_eq!(registry.subscribers("R1", None).await.len(), 1);

            registry.deregister("R1", new_conn).await;
            assert!(!registry.contains_room("R1").await);
        }
    }

    #[tokio::test]
    async fn test_room_not_evicted_while_occupied() {
        let registry = RoomRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.register("R1", 1, tx1).await;
        registry.register("R1", 2, tx2).await;

        registry.deregister("R1", 1).await;
        assert!(registry.contains_room("R1").await);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new();
        let (s1, _rx1) = participant(1, "bob", Role::Student);
        let (s2, _rx2) = participant(2, "eve", Role::Student);
        registry.add_student("R1", s1).await;
        registry.add_student("R2", s2).await;

        assert!(registry.resolve_handle("R1", "eve").await.is_none());
        assert_eq!(registry.snapshot_students("R1").await.len(), 1);
        assert_eq!(registry.snapshot_students("R2").await.len(), 1);
    }
}
