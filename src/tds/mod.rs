// src/tds/mod.rs

//! TDS wire-format framing and the minimal error encoder used to reject
//! clients in a way a real TDS driver can still parse.

pub mod error_encoder;
pub mod framing;

pub use framing::{Message, PacketType, build_packets, read_message, write_packets};
