// src/connection/handler.rs

//! The per-client state machine:
//!
//! ```text
//! accepting -> prelogin_read -> selected -> admitted -> dialed
//!           -> handshake_forwarded -> splicing -> terminating
//! ```
//!
//! One task per client; no shared mutable state across sessions except
//! through the (already thread-safe) coordinator and admission queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::guard::SlotGuard;
use super::session::{Session, SessionPhase};
use crate::admission::AdmissionError;
use crate::core::errors::{ProxyError, ProxyResult};
use crate::server::context::ServerState;
use crate::tds::error_encoder::{ProxyErrorCode, build_rejection};
use crate::tds::framing::{self, PacketType};

/// TDS packet size used for anything the proxy itself emits; pre-login
/// negotiation has not happened yet, so this is the protocol's default.
const DEFAULT_PACKET_SIZE: usize = 4096;

/// Handles one accepted TCP connection end to end. Errors are logged by the
/// caller; this function never propagates a panic-worthy condition.
pub async fn handle_connection(
    client: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    session_id: u64,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let mut session = Session::new(session_id, addr);
    if let Err(e) = run(client, &mut session, &state, shutdown_rx).await {
        debug!(session = session_id, %addr, error = %e, "session terminated with an error");
    }
}

async fn run(
    mut client: TcpStream,
    session: &mut Session,
    state: &Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ProxyResult<()> {
    let setup_deadline = state.config.proxy.session_timeout;

    session.advance(SessionPhase::PreloginRead);
    let prelogin = tokio::time::timeout(setup_deadline, framing::read_message(&mut client))
        .await
        .map_err(|_| ProxyError::Internal("timed out waiting for Pre-Login".into()))??;

    if prelogin.packet_type != PacketType::PRE_LOGIN {
        return Err(ProxyError::InvalidFrame(format!(
            "expected Pre-Login (0x12), got packet type {:#04x}",
            prelogin.packet_type.0
        )));
    }

    // Bucket selection: the core's required behavior is "first configured
    // bucket" (see DESIGN.md for why a richer selector is out of scope).
    session.advance(SessionPhase::Selected);
    let bucket = state
        .config
        .buckets
        .first()
        .ok_or(ProxyError::NoBucketsConfigured)?
        .clone();
    session.bucket_id = Some(bucket.id.clone());
    info!(session = session.id, bucket = %bucket.id, addr = %session.addr, "bucket selected");

    session.advance(SessionPhase::Admitted);
    match state
        .admission
        .acquire(&bucket.id, shutdown_rx.resubscribe())
        .await
    {
        Ok(_) => {
            session.slot_acquired = true;
        }
        Err(err) => {
            reject(&mut client, admission_error_code(err)).await;
            info!(session = session.id, bucket = %bucket.id, ?err, "admission rejected");
            return Ok(());
        }
    }
    let guard = SlotGuard::new(state.admission.clone(), bucket.id.clone());

    session.advance(SessionPhase::Dialed);
    let dial_timeout = bucket.effective_dial_timeout(&state.config.proxy);
    let mut backend = match tokio::time::timeout(dial_timeout, TcpStream::connect(bucket.address())).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            reject(&mut client, ProxyErrorCode::BackendDialFailed).await;
            guard.release().await;
            return Err(ProxyError::BackendDialFailed(bucket.id.clone(), e.to_string()));
        }
        Err(_) => {
            reject(&mut client, ProxyErrorCode::BackendDialFailed).await;
            guard.release().await;
            return Err(ProxyError::BackendDialFailed(
                bucket.id.clone(),
                "dial timed out".into(),
            ));
        }
    };

    session.advance(SessionPhase::HandshakeForwarded);
    if let Err(e) = forward_handshake(&mut client, &mut backend, &prelogin.raw_packets).await {
        guard.release().await;
        return Err(e);
    }

    session.advance(SessionPhase::Splicing);
    splice(client, backend).await;

    session.advance(SessionPhase::Terminating);
    guard.release().await;
    debug!(
        session = session.id,
        elapsed_ms = session.started_at.elapsed().as_millis() as u64,
        "session torn down"
    );
    Ok(())
}

/// Writes the captured Pre-Login packets to the backend, then relays its
/// single reply message back to the client, verbatim and uninterpreted.
async fn forward_handshake(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    prelogin_packets: &[bytes::Bytes],
) -> ProxyResult<()> {
    framing::write_packets(backend, prelogin_packets).await?;
    let reply = framing::read_message(backend).await?;
    framing::write_packets(client, &reply.raw_packets).await?;
    Ok(())
}

/// Spawns the two byte-copy directions and returns once the first finishes.
/// Each direction half-closes the opposite socket's write side on EOF so the
/// other direction can drain any bytes already in flight; spawning them
/// (rather than racing two in-place futures with `select!`) means the
/// losing direction keeps running to actually perform that drain instead of
/// being dropped the instant the winner resolves.
async fn splice(client: TcpStream, backend: TcpStream) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let client_to_backend = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
    });
    let backend_to_client = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    });

    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }
}

fn admission_error_code(err: AdmissionError) -> ProxyErrorCode {
    match err {
        AdmissionError::QueueFull => ProxyErrorCode::QueueFull,
        AdmissionError::QueueTimeout => ProxyErrorCode::QueueTimeout,
        AdmissionError::Unconfigured | AdmissionError::Canceled => ProxyErrorCode::Generic,
    }
}

/// Sends a wire-format rejection. Failures to write it are swallowed: the
/// client is being torn down either way.
async fn reject(client: &mut TcpStream, code: ProxyErrorCode) {
    let packets = build_rejection(code, code.default_message(), DEFAULT_PACKET_SIZE);
    if let Err(e) = framing::write_packets(client, &packets).await {
        warn!(error = %e, "failed to write rejection to client, closing anyway");
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), client.shutdown()).await;
}
