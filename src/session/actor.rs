//! The session loop.
//!
//! One loop runs per acquisition. It owns the receiving ends of the
//! session's channels and the write side of the connection, and is the only
//! writer of the session's state while it runs. It exits after die is
//! signalled, leaving the session inactive and zeroed for the sweep.

use super::handle::DieSignal;
use super::{SessionHandle, Transport};
use crate::backend::{BackendMessage, Downlink, MessageKind};
use crate::constants::MAX_FRAME_PAYLOAD;
use crate::crypto::SessionFlags;
use crate::frame::write_frame;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Receiving ends of one binding.
pub(crate) struct Inbox {
    pub client: mpsc::Receiver<Bytes>,
    pub replies: mpsc::Receiver<Bytes>,
    pub backend: mpsc::Receiver<Downlink>,
    pub die: DieSignal,
    pub transport: Transport,
}

/// One wake-up of the loop.
enum Event {
    Client(Bytes),
    Reply(Bytes),
    Backend(Downlink),
    Die,
}

/// What the loop does after handling a message.
enum Flow {
    Continue,
    Stop,
}

pub(crate) async fn run(handle: SessionHandle, inbox: Inbox) {
    let Inbox {
        mut client,
        mut replies,
        mut backend,
        mut die,
        mut transport,
    } = inbox;
    let session_id = handle.id();

    let ip = {
        let mut state = handle.session().lock();
        state.ciphers = Some(handle.context().key.ciphers());
        state.flags.set(SessionFlags::ENCRYPT);
        state.ip
    };
    debug!(session_id, ip = ?ip, "Session loop started");

    uplink(&handle, 0, MessageKind::Register, Bytes::new()).await;

    loop {
        let event = tokio::select! {
            Some(payload) = client.recv() => Event::Client(payload),
            Some(payload) = replies.recv() => Event::Reply(payload),
            Some(command) = backend.recv() => Event::Backend(command),
            _ = die.wait() => Event::Die,
        };
        let flow = match event {
            Event::Client(payload) => on_client(&handle, payload).await,
            Event::Reply(payload) => to_client(&handle, &mut transport, &mut die, payload).await,
            Event::Backend(command) => on_backend(&handle, &mut transport, &mut die, command).await,
            Event::Die => Flow::Stop,
        };
        if let Flow::Stop = flow {
            break;
        }
    }

    // Wake the connection handler if the loop decided to stop on its own.
    handle.signal_die();

    let (game_id, packets, flags, connected_for) = {
        let state = handle.session().lock();
        (
            state.game_id,
            state.telemetry.packet_count,
            state.flags.bits(),
            state.telemetry.connected_at.map(|at| Utc::now() - at),
        )
    };
    let user_id = handle.session().release(handle.generation());
    if let Some(user_id) = user_id {
        uplink(&handle, user_id, MessageKind::Quit, Bytes::new()).await;
    }
    let _ = transport.shutdown().await;

    info!(
        session_id,
        ip = ?ip,
        user_id = ?user_id,
        game_id,
        packets,
        flags,
        connected_for = ?connected_for,
        "Session closed"
    );
}

/// Handle a payload read from the client.
async fn on_client(handle: &SessionHandle, payload: Bytes) -> Flow {
    let session = handle.session();
    if !session.is_active() {
        trace!(session_id = session.id(), "Dropping client payload for inactive session");
        return Flow::Continue;
    }

    let limit = handle.context().max_packets_per_minute;
    let mut data = BytesMut::from(&payload[..]);
    let (user_id, rate) = {
        let mut state = session.lock();
        let rate = state.telemetry.record_packet(Utc::now());
        trace!(session_id = session.id(), gap = ?state.telemetry.packet_gap(), "Client packet");
        if let Some(ciphers) = state.ciphers.as_mut() {
            ciphers.decrypt(&mut data);
        }
        if limit > 0 && rate > limit {
            state.flags.set(SessionFlags::KICKED_OUT);
        }
        (state.user_id, rate)
    };

    if limit > 0 && rate > limit {
        warn!(
            session_id = session.id(),
            rate, limit, "Packet rate limit exceeded, kicking client"
        );
        return Flow::Stop;
    }

    uplink(handle, user_id, MessageKind::Normal, data.freeze()).await;
    Flow::Continue
}

/// Handle a command from the backend.
async fn on_backend(
    handle: &SessionHandle,
    transport: &mut Transport,
    die: &mut DieSignal,
    command: Downlink,
) -> Flow {
    let session = handle.session();
    match command {
        Downlink::Deliver(payload) => to_client(handle, transport, die, payload).await,
        Downlink::Bind { user_id, game_id } => {
            let mut state = session.lock();
            state.user_id = user_id;
            state.game_id = game_id;
            state.flags.set(SessionFlags::AUTHORIZED);
            debug!(session_id = session.id(), user_id, game_id, "User bound");
            Flow::Continue
        }
        Downlink::Kick => {
            session.lock().flags.set(SessionFlags::KICKED_OUT);
            info!(session_id = session.id(), "Session kicked by backend");
            Flow::Stop
        }
    }
}

/// Encrypt a payload and write it to the client as one frame.
///
/// A client that stops reading must not hold the loop: die abandons the
/// write.
async fn to_client(
    handle: &SessionHandle,
    transport: &mut Transport,
    die: &mut DieSignal,
    payload: Bytes,
) -> Flow {
    let session_id = handle.id();

    // Checked before encrypting so an unsendable payload does not advance
    // the keystream.
    if payload.len() > MAX_FRAME_PAYLOAD {
        warn!(session_id, len = payload.len(), "Dropping oversized reply");
        return Flow::Continue;
    }

    let mut data = BytesMut::from(&payload[..]);
    {
        let mut state = handle.session().lock();
        match state.ciphers.as_mut() {
            Some(ciphers) => ciphers.encrypt(&mut data),
            None => return Flow::Stop,
        }
    }

    tokio::select! {
        written = write_frame(transport, &data) => match written {
            Ok(()) => Flow::Continue,
            Err(e) => {
                debug!(session_id, error = %e, "Write to client failed");
                Flow::Stop
            }
        },
        _ = die.wait() => {
            debug!(session_id, "Write to client abandoned");
            Flow::Stop
        }
    }
}

/// Push a message towards the game servers.
async fn uplink(handle: &SessionHandle, user_id: i64, kind: MessageKind, payload: Bytes) {
    let ctx = handle.context();
    let msg = BackendMessage::new(ctx.gate_id, user_id, kind, payload);
    if ctx.uplink.send(msg).await.is_err() {
        warn!(session_id = handle.id(), kind = ?kind, "Backend uplink closed, message dropped");
    }
}
