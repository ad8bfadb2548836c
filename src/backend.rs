//! Messages exchanged with the game servers.
//!
//! The RPC transport that actually carries these values is external to the
//! gateway. Sessions push [`BackendMessage`]s onto the shared uplink queue
//! and receive [`Downlink`] commands on their backend-inbound channel.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Kind of a gateway-to-game-server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum MessageKind {
    /// A new client joined through this gateway.
    Register = 0,
    /// Regular client traffic.
    Normal = 1,
    /// The client left.
    Quit = 2,
}

impl MessageKind {
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

/// A message routed from the gateway to a game server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    /// Gateway the message originates from.
    pub gate_id: u32,
    /// Users the message concerns.
    pub user_ids: Vec<i64>,
    pub kind: MessageKind,
    /// Decrypted client payload, empty for control messages.
    pub payload: Bytes,
}

impl BackendMessage {
    pub fn new(gate_id: u32, user_id: i64, kind: MessageKind, payload: Bytes) -> Self {
        Self {
            gate_id,
            user_ids: vec![user_id],
            kind,
            payload,
        }
    }
}

/// A command from a game server to one session.
#[allow(dead_code)] // Will be used when the backend downlink is wired in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downlink {
    /// Send a payload to the client.
    Deliver(Bytes),
    /// Attach an authenticated user and its game server to the session.
    Bind { user_id: i64, game_id: u32 },
    /// Disconnect the client.
    Kick,
}

/// Sending side of the shared uplink queue.
pub type Uplink = mpsc::Sender<BackendMessage>;

/// Create the uplink queue.
pub fn uplink(depth: usize) -> (Uplink, mpsc::Receiver<BackendMessage>) {
    mpsc::channel(depth)
}

/// Drain the uplink queue until every sender is gone.
///
/// Stands in for the RPC client: messages are logged and counted, not sent.
/// Returns the number of messages drained.
pub async fn drain_uplink(mut rx: mpsc::Receiver<BackendMessage>, registry: String) -> u64 {
    info!(registry = %registry, "Backend uplink ready");

    let mut drained = 0u64;
    while let Some(msg) = rx.recv().await {
        drained += 1;
        trace!(
            gate_id = msg.gate_id,
            users = ?msg.user_ids,
            kind = msg.kind.as_i8(),
            len = msg.payload.len(),
            "Uplink message"
        );
    }

    debug!(drained, "Backend uplink closed");
    drained
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_values() {
        assert_eq!(MessageKind::Register.as_i8(), 0);
        assert_eq!(MessageKind::Normal.as_i8(), 1);
        assert_eq!(MessageKind::Quit.as_i8(), 2);
    }

    #[test]
    fn test_message_new() {
        let msg = BackendMessage::new(3, 42, MessageKind::Normal, Bytes::from_static(b"hi"));
        assert_eq!(msg.gate_id, 3);
        assert_eq!(msg.user_ids, vec![42]);
        assert_eq!(msg.payload, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_drain_uplink_counts() {
        let (tx, rx) = uplink(4);
        let task = tokio::spawn(drain_uplink(rx, "127.0.0.1:1987".to_string()));

        for kind in [MessageKind::Register, MessageKind::Normal, MessageKind::Quit] {
            tx.send(BackendMessage::new(0, 0, kind, Bytes::new()))
                .await
                .unwrap();
        }
        drop(tx);

        assert_eq!(task.await.unwrap(), 3);
    }
}
