//! Length-prefixed packet framing shared by the block store and KV
//! protocols, plus a client-side adapter that multiplexes pipelined
//! requests over a single connection.
//!
//! On the wire every packet is `u64 ID | u32 len | len bytes`, both
//! integers big-endian. Request IDs are chosen by the client; responses
//! carry the ID of the request they answer and may arrive in any order.

pub mod client;
pub mod frame;

pub use client::RequestQueue;
pub use frame::{FrameReader, FrameWriter, Packet};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds maximum")]
    Oversized(u32),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
