use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::room::RosterEntry;

/// Inbound envelopes, one variant per accepted `type` tag. Parsing into this
/// closed enum is the whole protocol validation step: payloads that do not
/// match any variant are dropped by the session without closing the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        username: String,
        #[serde(default)]
        is_teacher: bool,
    },

    ChatMessage {
        message: String,
    },

    PermissionUpdate {
        student_name: String,
        permission: String,
        status: bool,
    },

    // Teacher -> students stream signaling
    TeacherReady,

    RequestStream,

    Offer {
        offer: Value,
        target_user: String,
    },

    Answer {
        answer: Value,
    },

    // Student -> teacher stream signaling
    StudentOffer {
        offer: Value,
    },

    StudentAnswer {
        answer: Value,
        target_user: String,
    },

    IceCandidate {
        candidate: Value,
        target_user: String,
        #[serde(default)]
        is_teacher_stream: bool,
    },

    StreamStopped,
}

/// Outbound envelopes. Offer/answer/candidate payloads stay opaque
/// [`Value`]s: the relay forwards them and never interprets SDP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StudentList {
        students: Vec<RosterEntry>,
    },

    UserLeft {
        username: String,
    },

    ChatMessage {
        message: String,
        username: String,
    },

    PermissionGranted {
        permission: String,
        status: bool,
    },

    TeacherIsLive,

    StudentRequestingStream {
        from_user: String,
    },

    Offer {
        offer: Value,
        from_user: String,
    },

    Answer {
        answer: Value,
        from_user: String,
    },

    StudentOffer {
        offer: Value,
        from_user: String,
    },

    StudentAnswer {
        answer: Value,
        from_user: String,
    },

    IceCandidate {
        candidate: Value,
        from_user: String,
        is_teacher_stream: bool,
    },

    StreamStopped {
        username: String,
        is_teacher: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_defaults_to_student() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join","username":"alice"}"#).unwrap();
        match msg {
            ClientMessage::Join { username, is_teacher } => {
                assert_eq!(username, "alice");
                assert!(!is_teacher);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ice_candidate_defaults_stream_flag() {
        let raw = r#"{"type":"ice_candidate","candidate":{"sdpMid":"0"},"target_user":"bob"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::IceCandidate { target_user, is_teacher_stream, .. } => {
                assert_eq!(target_user, "bob");
                assert!(!is_teacher_stream);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"reboot_server"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"username":"alice"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_chat_broadcast() {
        let msg = ServerMessage::ChatMessage {
            message: "hi".to_string(),
            username: "alice".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "chat_message", "message": "hi", "username": "alice"}));
    }

    #[test]
    fn test_serialize_teacher_is_live() {
        let value: serde_json::Value = serde_json::to_value(&ServerMessage::TeacherIsLive).unwrap();
        assert_eq!(value, json!({"type": "teacher_is_live"}));
    }
}
