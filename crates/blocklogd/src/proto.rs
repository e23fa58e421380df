//! Request parsing and response encoding for the block log protocol.
//!
//! Requests are framed packets whose payload starts with a `u32` type:
//!
//! ```text
//! 0 PARAMS    (empty)
//! 1 GET       u64 blkno
//! 2 APPEND    u32 nblks | u64 blkno | nblks * blklen bytes
//! 3 FREE      u64 blkno
//! 4 PARAMS2   (empty)
//! ```
//!
//! An APPEND's block length is implied by the payload size and must match
//! the server's; a packet that does not parse drops the connection.

use bytes::Bytes;
use wire::{FrameWriter, Packet};

pub const TYPE_PARAMS: u32 = 0;
pub const TYPE_GET: u32 = 1;
pub const TYPE_APPEND: u32 = 2;
pub const TYPE_FREE: u32 = 3;
pub const TYPE_PARAMS2: u32 = 4;

#[derive(Debug)]
pub enum Request {
    Params,
    Params2,
    Get {
        blkno: u64,
    },
    Append {
        nblks: u32,
        blklen: u32,
        blkno: u64,
        buf: Bytes,
    },
    Free {
        blkno: u64,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("malformed block log request")]
pub struct MalformedRequest;

impl Request {
    pub fn parse(packet: &Packet) -> Result<Request, MalformedRequest> {
        let p = &packet.payload;
        if p.len() < 4 {
            return Err(MalformedRequest);
        }
        let kind = be32(&p[0..4]);
        match kind {
            TYPE_PARAMS | TYPE_PARAMS2 => {
                if p.len() != 4 {
                    return Err(MalformedRequest);
                }
                Ok(if kind == TYPE_PARAMS {
                    Request::Params
                } else {
                    Request::Params2
                })
            }
            TYPE_GET => {
                if p.len() != 12 {
                    return Err(MalformedRequest);
                }
                Ok(Request::Get {
                    blkno: be64(&p[4..12]),
                })
            }
            TYPE_APPEND => {
                if p.len() < 16 {
                    return Err(MalformedRequest);
                }
                let nblks = be32(&p[4..8]);
                let blkno = be64(&p[8..16]);
                let datalen = p.len() - 16;
                if nblks == 0 || datalen % nblks as usize != 0 {
                    return Err(MalformedRequest);
                }
                Ok(Request::Append {
                    nblks,
                    blklen: (datalen / nblks as usize) as u32,
                    blkno,
                    buf: packet.payload.slice(16..),
                })
            }
            TYPE_FREE => {
                if p.len() != 12 {
                    return Err(MalformedRequest);
                }
                Ok(Request::Free {
                    blkno: be64(&p[4..12]),
                })
            }
            _ => Err(MalformedRequest),
        }
    }
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes(b.try_into().unwrap())
}

fn be64(b: &[u8]) -> u64 {
    u64::from_be_bytes(b.try_into().unwrap())
}

pub fn respond_params<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut FrameWriter<W>,
    id: u64,
    blklen: u32,
    nextblk: u64,
) {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&blklen.to_be_bytes());
    buf.extend_from_slice(&nextblk.to_be_bytes());
    w.write_packet(id, &buf);
}

pub fn respond_params2<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut FrameWriter<W>,
    id: u64,
    blklen: u32,
    nextblk: u64,
    lastblk: u64,
) {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&blklen.to_be_bytes());
    buf.extend_from_slice(&nextblk.to_be_bytes());
    buf.extend_from_slice(&lastblk.to_be_bytes());
    w.write_packet(id, &buf);
}

pub fn respond_get<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut FrameWriter<W>,
    id: u64,
    data: Option<&[u8]>,
) {
    match data {
        Some(data) => {
            let mut buf = Vec::with_capacity(4 + data.len());
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(data);
            w.write_packet(id, &buf);
        }
        None => w.write_packet(id, &1u32.to_be_bytes()),
    }
}

pub fn respond_append<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut FrameWriter<W>,
    id: u64,
    status: u32,
    nextblk: u64,
) {
    if status == 0 {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&nextblk.to_be_bytes());
        w.write_packet(id, &buf);
    } else {
        w.write_packet(id, &status.to_be_bytes());
    }
}

pub fn respond_free<W: tokio::io::AsyncWrite + Unpin>(w: &mut FrameWriter<W>, id: u64) {
    w.write_packet(id, &0u32.to_be_bytes());
}
