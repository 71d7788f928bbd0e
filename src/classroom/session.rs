use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use warp::ws::Message;

use super::relay::{self, Outbound};
use super::room::{ConnId, Participant, Role, RoomRegistry};
use super::signaling::{ClientMessage, ServerMessage};
use crate::error::{RelayError, Result};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Identity {
    username: String,
    role: Role,
}

/// Per-connection lifecycle controller.
///
/// Owns the connection's registry record and is the only writer of its own
/// identity. Lives from WebSocket upgrade to disconnect:
/// connected-unjoined -> joined (after a `join` envelope) -> disconnected.
/// The connection subscribes to room broadcasts immediately on connect, before
/// any join, and is only added to the membership maps once it joins.
pub struct ClassroomSession {
    registry: Arc<RoomRegistry>,
    room_code: String,
    conn_id: ConnId,
    outbound: Outbound,
    identity: Option<Identity>,
    closed: bool,
}

impl ClassroomSession {
    /// Register a fresh connection with the room's broadcast group.
    pub async fn connect(registry: Arc<RoomRegistry>, room_code: String, outbound: Outbound) -> Self {
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        registry.register(&room_code, conn_id, outbound.clone()).await;
        tracing::info!(room = %room_code, conn_id = conn_id, "Connection joined broadcast group");

        Self {
            registry,
            room_code,
            conn_id,
            outbound,
            identity: None,
            closed: false,
        }
    }

    /// Decode one raw inbound payload and dispatch it. All failure modes are
    /// soft: unparsable payloads and unrecognized types are logged and
    /// dropped, the connection stays open.
    pub async fn handle_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                if e.classify() == serde_json::error::Category::Data {
                    tracing::warn!(room = %self.room_code, error = %e, "Ignoring envelope with unknown or malformed type");
                } else {
                    tracing::warn!(room = %self.room_code, error = %e, "Ignoring unparsable payload");
                }
                return;
            }
        };

        self.handle_message(message).await;
    }

    /// Dispatch one decoded envelope. Handler failures are part of the silent
    /// drop contract: the sender gets no error envelope.
    pub async fn handle_message(&mut self, message: ClientMessage) {
        if let Err(e) = self.dispatch(message).await {
            tracing::debug!(room = %self.room_code, conn_id = self.conn_id, reason = %e, "Dropped signaling message");
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Join { username, is_teacher } => self.on_join(username, is_teacher).await,
            ClientMessage::ChatMessage { message } => self.on_chat_message(message).await,
            ClientMessage::PermissionUpdate { student_name, permission, status } => {
                self.on_permission_update(student_name, permission, status).await
            }
            ClientMessage::TeacherReady => self.on_teacher_ready().await,
            ClientMessage::RequestStream => self.on_request_stream().await,
            ClientMessage::Offer { offer, target_user } => self.on_offer(offer, target_user).await,
            ClientMessage::Answer { answer } => self.on_answer(answer).await,
            ClientMessage::StudentOffer { offer } => self.on_student_offer(offer).await,
            ClientMessage::StudentAnswer { answer, target_user } => {
                self.on_student_answer(answer, target_user).await
            }
            ClientMessage::IceCandidate { candidate, target_user, is_teacher_stream } => {
                self.on_ice_candidate(candidate, target_user, is_teacher_stream).await
            }
            ClientMessage::StreamStopped => self.on_stream_stopped().await,
        }
    }

    async fn on_join(&mut self, username: String, is_teacher: bool) -> Result<()> {
        if self.identity.is_some() {
            return Err(RelayError::AlreadyJoined);
        }

        let role = if is_teacher { Role::Teacher } else { Role::Student };
        let participant = Participant {
            conn_id: self.conn_id,
            username: username.clone(),
            role,
            permissions: HashMap::new(),
            outbound: self.outbound.clone(),
        };

        match role {
            Role::Teacher => {
                // A second teacher silently replaces the registry entry; the
                // superseded connection is told to close instead of lingering
                // as a stale broadcast receiver.
                if let Some(previous) = self.registry.add_teacher(&self.room_code, participant).await {
                    if previous.conn_id != self.conn_id {
                        let _ = previous.outbound.send(Message::close());
                    }
                }
            }
            Role::Student => {
                self.registry.add_student(&self.room_code, participant).await;
            }
        }

        self.identity = Some(Identity { username, role });
        self.broadcast_roster().await;

        if role == Role::Student && self.registry.is_live(&self.room_code).await {
            relay::unicast(&self.outbound, &ServerMessage::TeacherIsLive);
        }

        Ok(())
    }

    async fn on_chat_message(&self, message: String) -> Result<()> {
        let username = self.joined()?.username.clone();
        let targets = self.registry.subscribers(&self.room_code, None).await;
        relay::broadcast(&targets, &ServerMessage::ChatMessage { message, username });
        Ok(())
    }

    async fn on_permission_update(&self, student_name: String, permission: String, status: bool) -> Result<()> {
        self.as_teacher()?;
        let handle = self
            .registry
            .set_permission(&self.room_code, &student_name, &permission, status)
            .await
            .ok_or(RelayError::TargetNotFound(student_name))?;
        relay::unicast(&handle, &ServerMessage::PermissionGranted { permission, status });
        Ok(())
    }

    async fn on_teacher_ready(&self) -> Result<()> {
        self.as_teacher()?;
        self.registry.set_live(&self.room_code, true).await;
        // Everyone but the teacher itself learns the stream is up
        let targets = self.registry.subscribers(&self.room_code, Some(self.conn_id)).await;
        relay::broadcast(&targets, &ServerMessage::TeacherIsLive);
        Ok(())
    }

    async fn on_request_stream(&self) -> Result<()> {
        let from_user = self.as_student()?.username.clone();
        let teacher = self
            .registry
            .teacher_handle(&self.room_code)
            .await
            .ok_or(RelayError::NoTeacher)?;
        relay::unicast(&teacher, &ServerMessage::StudentRequestingStream { from_user });
        Ok(())
    }

    async fn on_offer(&self, offer: serde_json::Value, target_user: String) -> Result<()> {
        let from_user = self.as_teacher()?.username.clone();
        let student = self
            .registry
            .student_handle(&self.room_code, &target_user)
            .await
            .ok_or(RelayError::TargetNotFound(target_user))?;
        relay::unicast(&student, &ServerMessage::Offer { offer, from_user });
        Ok(())
    }

    async fn on_answer(&self, answer: serde_json::Value) -> Result<()> {
        let from_user = self.as_student()?.username.clone();
        let teacher = self
            .registry
            .teacher_handle(&self.room_code)
            .await
            .ok_or(RelayError::NoTeacher)?;
        relay::unicast(&teacher, &ServerMessage::Answer { answer, from_user });
        Ok(())
    }

    async fn on_student_offer(&self, offer: serde_json::Value) -> Result<()> {
        let from_user = self.as_student()?.username.clone();
        let teacher = self
            .registry
            .teacher_handle(&self.room_code)
            .await
            .ok_or(RelayError::NoTeacher)?;
        relay::unicast(&teacher, &ServerMessage::StudentOffer { offer, from_user });
        Ok(())
    }

    async fn on_student_answer(&self, answer: serde_json::Value, target_user: String) -> Result<()> {
        let from_user = self.as_teacher()?.username.clone();
        let student = self
            .registry
            .student_handle(&self.room_code, &target_user)
            .await
            .ok_or(RelayError::TargetNotFound(target_user))?;
        relay::unicast(&student, &ServerMessage::StudentAnswer { answer, from_user });
        Ok(())
    }

    async fn on_ice_candidate(
        &self,
        candidate: serde_json::Value,
        target_user: String,
        is_teacher_stream: bool,
    ) -> Result<()> {
        let from_user = self.joined()?.username.clone();

        // Never hand a participant back their own candidate
        if target_user == from_user {
            tracing::trace!(room = %self.room_code, username = %from_user, "Suppressed ICE candidate echo");
            return Ok(());
        }

        let target = self
            .registry
            .resolve_handle(&self.room_code, &target_user)
            .await
            .ok_or(RelayError::TargetNotFound(target_user))?;
        relay::unicast(
            &target,
            &ServerMessage::IceCandidate { candidate, from_user, is_teacher_stream },
        );
        Ok(())
    }

    async fn on_stream_stopped(&self) -> Result<()> {
        let identity = self.joined()?.clone();
        if identity.role == Role::Teacher {
            self.registry.set_live(&self.room_code, false).await;
        }
        let targets = self.registry.subscribers(&self.room_code, None).await;
        relay::broadcast(
            &targets,
            &ServerMessage::StreamStopped {
                username: identity.username,
                is_teacher: identity.role == Role::Teacher,
            },
        );
        Ok(())
    }

    /// Remove this connection from the room. Idempotent, and runs the same
    /// way whether the client closed cleanly or the transport dropped.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(identity) = self.identity.clone() {
            let removed = match identity.role {
                Role::Teacher => self.registry.remove_teacher(&self.room_code, self.conn_id).await,
                Role::Student => {
                    self.registry
                        .remove_student(&self.room_code, &identity.username, self.conn_id)
                        .await
                }
            };

            // A superseded connection no longer owns its registry entry and
            // must not announce a departure on the replacement's behalf.
            if removed {
                let targets = self.registry.subscribers(&self.room_code, None).await;
                relay::broadcast(&targets, &ServerMessage::UserLeft { username: identity.username });
                self.broadcast_roster().await;
            }
        }

        self.registry.deregister(&self.room_code, self.conn_id).await;
        tracing::info!(room = %self.room_code, conn_id = self.conn_id, "Connection left broadcast group");
    }

    async fn broadcast_roster(&self) {
        let students = self.registry.snapshot_students(&self.room_code).await;
        let targets = self.registry.subscribers(&self.room_code, None).await;
        relay::broadcast(&targets, &ServerMessage::StudentList { students });
    }

    fn joined(&self) -> Result<&Identity> {
        self.identity.as_ref().ok_or(RelayError::NotJoined)
    }

    fn as_teacher(&self) -> Result<&Identity> {
        let identity = self.joined()?;
        if identity.role != Role::Teacher {
            return Err(RelayError::Unauthorized("teacher"));
        }
        Ok(identity)
    }

    fn as_student(&self) -> Result<&Identity> {
        let identity = self.joined()?;
        if identity.role != Role::Student {
            return Err(RelayError::Unauthorized("student"));
        }
        Ok(identity)
    }
}
