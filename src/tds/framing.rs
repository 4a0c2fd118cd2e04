// src/tds/framing.rs

//! Minimal TDS packet framing: just enough to read and write whole messages
//! one packet at a time without interpreting anything beyond the header.
//!
//! A TDS *message* is a sequence of *packets*, each carrying an 8-byte header:
//!
//! ```text
//! byte 0      : packet type
//! byte 1      : status flags (bit 0 = end-of-message)
//! bytes 2..4  : total packet length, big-endian, header included
//! bytes 4..6  : SPID
//! byte 6      : packet id
//! byte 7      : reserved / window
//! ```
//!
//! This is expressed as plain async functions over `AsyncRead`/`AsyncWrite`
//! rather than a `tokio_util::codec::Framed` pipeline: the session handler
//! needs the raw packet boundaries to relay them verbatim, and a `Framed`
//! stream would only ever hand back reassembled messages.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::errors::{ProxyError, ProxyResult};

pub const HEADER_LEN: usize = 8;
pub const MAX_PACKET_LEN: usize = 32768;
const STATUS_END_OF_MESSAGE: u8 = 0x01;

/// TDS packet types the core needs to recognize by name. All other values
/// are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketType(pub u8);

impl PacketType {
    pub const SQL_BATCH: PacketType = PacketType(0x01);
    pub const RPC: PacketType = PacketType(0x03);
    pub const TABULAR_RESULT: PacketType = PacketType(0x04);
    pub const LOGIN7: PacketType = PacketType(0x10);
    pub const PRE_LOGIN: PacketType = PacketType(0x12);
}

/// One fully framed message: its packet type and the reassembled payload,
/// plus the raw packets it was split across (needed for verbatim forwarding).
#[derive(Debug, Clone)]
pub struct Message {
    pub packet_type: PacketType,
    pub payload: Bytes,
    pub raw_packets: Vec<Bytes>,
}

/// Reads packets from `conn` until one carries the end-of-message flag,
/// reassembling their payloads while keeping the original packet framing.
pub async fn read_message<R: AsyncRead + Unpin>(conn: &mut R) -> ProxyResult<Message> {
    let mut payload = BytesMut::new();
    let mut raw_packets = Vec::new();
    let mut packet_type = None;

    loop {
        let mut header = [0u8; HEADER_LEN];
        conn.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProxyError::InvalidFrame("EOF before end-of-message".to_string())
            } else {
                ProxyError::Io(std::sync::Arc::new(e))
            }
        })?;

        let this_type = header[0];
        let status = header[1];
        let total_len = u16::from_be_bytes([header[2], header[3]]) as usize;

        if total_len < HEADER_LEN || total_len > MAX_PACKET_LEN {
            return Err(ProxyError::InvalidFrame(format!(
                "packet length {total_len} out of bounds"
            )));
        }

        let body_len = total_len - HEADER_LEN;
        let mut packet = BytesMut::with_capacity(total_len);
        packet.extend_from_slice(&header);
        if body_len > 0 {
            let mut body = vec![0u8; body_len];
            conn.read_exact(&mut body).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    ProxyError::InvalidFrame("EOF before end-of-message".to_string())
                } else {
                    ProxyError::Io(std::sync::Arc::new(e))
                }
            })?;
            payload.extend_from_slice(&body);
            packet.extend_from_slice(&body);
        }

        packet_type.get_or_insert(this_type);
        raw_packets.push(packet.freeze());

        if status & STATUS_END_OF_MESSAGE != 0 {
            break;
        }
    }

    Ok(Message {
        packet_type: PacketType(packet_type.unwrap_or(0)),
        payload: payload.freeze(),
        raw_packets,
    })
}

/// Writes raw packets verbatim, in order.
pub async fn write_packets<W: AsyncWrite + Unpin>(
    conn: &mut W,
    packets: &[Bytes],
) -> ProxyResult<()> {
    for packet in packets {
        conn.write_all(packet).await?;
    }
    conn.flush().await?;
    Ok(())
}

/// Splits `payload` into packets of at most `max_size` bytes (header included),
/// setting the end-of-message flag only on the last one and assigning
/// sequential packet ids starting at zero.
pub fn build_packets(packet_type: PacketType, payload: &[u8], max_size: usize) -> Vec<Bytes> {
    let max_body = max_size.saturating_sub(HEADER_LEN).max(1);
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[][..]]
    } else {
        payload.chunks(max_body).collect()
    };

    let last_index = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let total_len = HEADER_LEN + chunk.len();
            let mut packet = BytesMut::with_capacity(total_len);
            let status = if i == last_index {
                STATUS_END_OF_MESSAGE
            } else {
                0
            };
            packet.extend_from_slice(&[packet_type.0, status]);
            packet.extend_from_slice(&(total_len as u16).to_be_bytes());
            packet.extend_from_slice(&[0, 0]); // SPID, unused by the core
            packet.extend_from_slice(&[i as u8, 0]); // packet id, reserved
            packet.extend_from_slice(chunk);
            packet.freeze()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_single_packet_message() {
        let payload = b"hello tds".to_vec();
        let packets = build_packets(PacketType::PRE_LOGIN, &payload, 4096);
        assert_eq!(packets.len(), 1);

        let mut buf = BytesMut::new();
        for p in &packets {
            buf.extend_from_slice(p);
        }
        let mut reader = std::io::Cursor::new(buf.to_vec());
        let msg = read_message(&mut reader).await.unwrap();
        assert_eq!(msg.packet_type, PacketType::PRE_LOGIN);
        assert_eq!(msg.payload.as_ref(), payload.as_slice());
        assert_eq!(msg.raw_packets, packets);
    }

    #[tokio::test]
    async fn round_trips_a_multi_packet_message() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let packets = build_packets(PacketType::SQL_BATCH, &payload, 2048);
        assert!(packets.len() > 1);
        for (i, p) in packets.iter().enumerate() {
            let is_last = i == packets.len() - 1;
            assert_eq!(p[1] & STATUS_END_OF_MESSAGE != 0, is_last);
            assert_eq!(p[6], i as u8);
        }

        let mut buf = BytesMut::new();
        for p in &packets {
            buf.extend_from_slice(p);
        }
        let mut reader = std::io::Cursor::new(buf.to_vec());
        let msg = read_message(&mut reader).await.unwrap();
        assert_eq!(msg.payload.as_ref(), payload.as_slice());
        assert_eq!(msg.raw_packets.len(), packets.len());
    }

    #[tokio::test]
    async fn rejects_eof_before_end_of_message() {
        let packets = build_packets(PacketType::PRE_LOGIN, b"partial", 4096);
        // Truncate so the end-of-message packet never arrives.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&packets[0][..HEADER_LEN + 2]);
        let mut reader = std::io::Cursor::new(buf.to_vec());
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_length() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = PacketType::PRE_LOGIN.0;
        header[1] = STATUS_END_OF_MESSAGE;
        header[2..4].copy_from_slice(&(40000u16).to_be_bytes());
        let mut reader = std::io::Cursor::new(header.to_vec());
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn rejects_length_below_header_size() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = PacketType::PRE_LOGIN.0;
        header[1] = STATUS_END_OF_MESSAGE;
        header[2..4].copy_from_slice(&(4u16).to_be_bytes());
        let mut reader = std::io::Cursor::new(header.to_vec());
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidFrame(_)));
    }
}
