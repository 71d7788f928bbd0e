use tokio::sync::mpsc;
use warp::ws::Message;

use super::signaling::ServerMessage;

/// Delivery handle for one connection: the write half of the per-connection
/// outbound channel. Valid exactly for the lifetime of the connection task.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// Deliver an envelope to every handle in the set, exactly once each.
///
/// Delivery is fire-and-forget: a handle whose connection task has already
/// gone away is skipped. Nothing is queued or retried.
pub fn broadcast(targets: &[Outbound], message: &ServerMessage) {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize broadcast envelope");
            return;
        }
    };

    for target in targets {
        if target.send(Message::text(text.clone())).is_err() {
            tracing::debug!("Skipped broadcast to closed connection");
        }
    }
}

/// Deliver an envelope to exactly one handle, fire-and-forget.
pub fn unicast(target: &Outbound, message: &ServerMessage) {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize unicast envelope");
            return;
        }
    };

    if target.send(Message::text(text)).is_err() {
        tracing::debug!("Skipped unicast to closed connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_delivers_to_every_handle_once() {
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        broadcast(&[tx1, tx2], &ServerMessage::TeacherIsLive);

        assert!(rx1.try_recv().unwrap().to_str().unwrap().contains("teacher_is_live"));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().unwrap().to_str().unwrap().contains("teacher_is_live"));
    }

    #[test]
    fn test_closed_handle_is_skipped() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        drop(rx1);

        broadcast(&[tx1, tx2], &ServerMessage::TeacherIsLive);

        // The live handle still gets its copy
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_unicast_to_closed_handle_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        unicast(&tx, &ServerMessage::TeacherIsLive);
    }
}
