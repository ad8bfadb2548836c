//! Compiled-in defaults for the gateway.

use std::time::Duration;

/// Socket send/receive buffer size applied to every accepted connection.
pub const SOCKET_BUFFER_SIZE: usize = 32767;

/// Read deadline for one whole frame (header and payload).
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between reclamation sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Number of sessions pre-allocated per gateway.
pub const POOL_CAPACITY: usize = 1000;

/// Pre-shared RC4 key used by every session.
///
/// All clients of all gateways share it. The KEY_EXCHANGED status bit is
/// reserved for a future per-session handshake and is never set.
pub const SESSION_KEY: &[u8] = b"fea534584cbd0b49390ec8b6f8b681e8";

/// Depth of the client-inbound channel.
pub const CLIENT_QUEUE_DEPTH: usize = 8;

/// Depth of the outbound reply channel.
pub const REPLY_QUEUE_DEPTH: usize = 8;

/// Depth of the backend-inbound channel. Kept at one so the backend side
/// waits for the session to pick up each message.
pub const BACKEND_QUEUE_DEPTH: usize = 1;

/// Depth of the shared uplink queue towards the game servers.
pub const UPLINK_QUEUE_DEPTH: usize = 1024;

/// Length of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:6600";

/// Default backend registry address.
pub const DEFAULT_REGISTRY: &str = "127.0.0.1:1987";
