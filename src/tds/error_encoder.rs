// src/tds/error_encoder.rs

//! Builds TDS ERROR + DONE(error) tokens so the proxy can reject a client
//! with a message a real TDS client can parse, instead of just closing the
//! socket. This is the only thing the proxy itself ever emits to a client.

use bytes::{BufMut, Bytes, BytesMut};

use super::framing::{PacketType, build_packets};

const TOKEN_ERROR: u8 = 0xAA;
const TOKEN_DONE: u8 = 0xFD;
const DONE_STATUS_ERROR: u16 = 0x0002;
const SERVER_NAME: &str = "tds-admission-proxy";

/// The error numbers the core is required to emit verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Generic internal error.
    Generic,
    /// Reserved: local warm-pool exhaustion. Not emitted by this core.
    LocalPoolExhausted,
    /// Reserved: no route found. Not emitted under the first-bucket policy.
    NoRoute,
    /// Backend dial failed.
    BackendDialFailed,
    /// Admission queue wait timed out.
    QueueTimeout,
    /// Admission queue full (circuit breaker tripped).
    QueueFull,
}

impl ProxyErrorCode {
    pub fn number(self) -> u32 {
        match self {
            ProxyErrorCode::Generic => 50000,
            ProxyErrorCode::LocalPoolExhausted => 50001,
            ProxyErrorCode::NoRoute => 50002,
            ProxyErrorCode::BackendDialFailed => 50003,
            ProxyErrorCode::QueueTimeout => 50004,
            ProxyErrorCode::QueueFull => 50005,
        }
    }

    pub fn severity(self) -> u8 {
        match self {
            ProxyErrorCode::BackendDialFailed => 20,
            _ => 16,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ProxyErrorCode::Generic => "an internal proxy error occurred",
            ProxyErrorCode::LocalPoolExhausted => "local connection pool exhausted",
            ProxyErrorCode::NoRoute => "no route to a backend for this request",
            ProxyErrorCode::BackendDialFailed => "failed to connect to the backend database",
            ProxyErrorCode::QueueTimeout => "timed out waiting for an available connection slot",
            ProxyErrorCode::QueueFull => "connection admission queue is full, try again later",
        }
    }
}

fn utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Encodes one ERROR token: number, state, severity, message (char-count
/// prefixed UTF-16LE), server name (byte-count prefixed UTF-16LE), an empty
/// procedure name, and a line number.
fn encode_error_token(code: ProxyErrorCode, state: u8, message: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TOKEN_ERROR);
    buf.put_u32_le(code.number());
    buf.put_u8(state);
    buf.put_u8(code.severity());

    let msg_units = message.encode_utf16().count() as u16;
    buf.put_u16_le(msg_units);
    buf.put_slice(&utf16le(message));

    let server_bytes = utf16le(SERVER_NAME);
    buf.put_u8(server_bytes.len() as u8);
    buf.put_slice(&server_bytes);

    // Empty procedure name.
    buf.put_u8(0);

    // Line number.
    buf.put_u32_le(0);

    buf.freeze()
}

/// Encodes the fixed-shape DONE token with the error-status flag set.
fn encode_done_with_error() -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_u8(TOKEN_DONE);
    buf.put_u16_le(DONE_STATUS_ERROR);
    buf.put_u16_le(0); // CurCmd, unused.
    buf.put_u64_le(0); // Row count, always zero for a rejection.
    buf.freeze()
}

/// Builds the full wire-format rejection: one ERROR token followed by one
/// DONE(error) token, framed as TABULAR_RESULT packets.
pub fn build_rejection(code: ProxyErrorCode, message: &str, max_packet_size: usize) -> Vec<Bytes> {
    let mut payload = BytesMut::new();
    payload.extend_from_slice(&encode_error_token(code, 1, message));
    payload.extend_from_slice(&encode_done_with_error());
    build_packets(PacketType::TABULAR_RESULT, &payload, max_packet_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tds::framing::read_message;

    #[tokio::test]
    async fn encodes_a_parseable_queue_full_rejection() {
        let packets = build_rejection(
            ProxyErrorCode::QueueFull,
            ProxyErrorCode::QueueFull.default_message(),
            4096,
        );
        let mut bytes = BytesMut::new();
        for p in &packets {
            bytes.extend_from_slice(p);
        }
        let mut reader = std::io::Cursor::new(bytes.to_vec());
        let msg = read_message(&mut reader).await.unwrap();
        assert_eq!(msg.packet_type, PacketType::TABULAR_RESULT);

        let payload = msg.payload;
        assert_eq!(payload[0], TOKEN_ERROR);
        let number = u32::from_le_bytes(payload[1..5].try_into().unwrap());
        assert_eq!(number, 50005);
        let severity = payload[6];
        assert_eq!(severity, 16);

        // The DONE token must be the final 13 bytes and flag the error status.
        let done = &payload[payload.len() - 13..];
        assert_eq!(done[0], TOKEN_DONE);
        let status = u16::from_le_bytes([done[1], done[2]]);
        assert_eq!(status & DONE_STATUS_ERROR, DONE_STATUS_ERROR);
    }

    #[test]
    fn backend_dial_failed_uses_severity_20() {
        assert_eq!(ProxyErrorCode::BackendDialFailed.severity(), 20);
        assert_eq!(ProxyErrorCode::BackendDialFailed.number(), 50003);
    }
}
