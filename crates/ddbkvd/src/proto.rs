//! Request parsing and response encoding for the KV protocol.
//!
//! ```text
//! 0 PUT     u32 keylen | key | value
//! 1 GET     u32 keylen | key
//! 2 GETC    u32 keylen | key
//! 3 DELETE  u32 keylen | key
//! ```
//!
//! Keys are embedded into DynamoDB JSON request bodies and therefore
//! must be UTF-8; anything else is a malformed request.

use bytes::Bytes;
use wire::{FrameWriter, Packet};

pub const TYPE_PUT: u32 = 0;
pub const TYPE_GET: u32 = 1;
pub const TYPE_GETC: u32 = 2;
pub const TYPE_DELETE: u32 = 3;

#[derive(Debug)]
pub enum KvRequest {
    Put { key: String, value: Bytes },
    Get { key: String },
    Getc { key: String },
    Delete { key: String },
}

#[derive(Debug, thiserror::Error)]
#[error("malformed KV request")]
pub struct MalformedRequest;

impl KvRequest {
    pub fn parse(packet: &Packet) -> Result<KvRequest, MalformedRequest> {
        let p = &packet.payload;
        if p.len() < 8 {
            return Err(MalformedRequest);
        }
        let kind = u32::from_be_bytes(p[0..4].try_into().unwrap());
        let keylen = u32::from_be_bytes(p[4..8].try_into().unwrap()) as usize;
        if p.len() < 8 + keylen {
            return Err(MalformedRequest);
        }
        let key = std::str::from_utf8(&p[8..8 + keylen])
            .map_err(|_| MalformedRequest)?
            .to_string();

        match kind {
            TYPE_PUT => Ok(KvRequest::Put {
                key,
                value: packet.payload.slice(8 + keylen..),
            }),
            TYPE_GET | TYPE_GETC | TYPE_DELETE => {
                if p.len() != 8 + keylen {
                    return Err(MalformedRequest);
                }
                Ok(match kind {
                    TYPE_GET => KvRequest::Get { key },
                    TYPE_GETC => KvRequest::Getc { key },
                    _ => KvRequest::Delete { key },
                })
            }
            _ => Err(MalformedRequest),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            KvRequest::Put { key, .. }
            | KvRequest::Get { key }
            | KvRequest::Getc { key }
            | KvRequest::Delete { key } => key,
        }
    }
}

/// PUT and DELETE share a response shape: a bare status.
pub fn respond_status<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut FrameWriter<W>,
    id: u64,
    status: u32,
) {
    w.write_packet(id, &status.to_be_bytes());
}

/// GET/GETC response: status, then the length-prefixed value if present.
pub fn respond_value<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut FrameWriter<W>,
    id: u64,
    status: u32,
    value: Option<&[u8]>,
) {
    match value {
        Some(value) => {
            let mut buf = Vec::with_capacity(8 + value.len());
            buf.extend_from_slice(&status.to_be_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
            w.write_packet(id, &buf);
        }
        None => w.write_packet(id, &status.to_be_bytes()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet(payload: Vec<u8>) -> Packet {
        Packet {
            id: 3,
            payload: payload.into(),
        }
    }

    fn framed(kind: u32, key: &str, value: Option<&[u8]>) -> Vec<u8> {
        let mut p = kind.to_be_bytes().to_vec();
        p.extend_from_slice(&(key.len() as u32).to_be_bytes());
        p.extend_from_slice(key.as_bytes());
        if let Some(value) = value {
            p.extend_from_slice(value);
        }
        p
    }

    #[test]
    fn parse_all_types() {
        match KvRequest::parse(&packet(framed(TYPE_PUT, "k", Some(b"v")))).unwrap() {
            KvRequest::Put { key, value } => {
                assert_eq!(key, "k");
                assert_eq!(&value[..], b"v");
            }
            other => panic!("parsed {other:?}"),
        }
        assert!(matches!(
            KvRequest::parse(&packet(framed(TYPE_GET, "k", None))).unwrap(),
            KvRequest::Get { .. }
        ));
        assert!(matches!(
            KvRequest::parse(&packet(framed(TYPE_GETC, "k", None))).unwrap(),
            KvRequest::Getc { .. }
        ));
        assert!(matches!(
            KvRequest::parse(&packet(framed(TYPE_DELETE, "k", None))).unwrap(),
            KvRequest::Delete { .. }
        ));
    }

    #[test]
    fn rejects_malformed() {
        // Trailing bytes on a GET.
        assert!(KvRequest::parse(&packet(framed(TYPE_GET, "k", Some(b"junk")))).is_err());
        // Key length pointing past the payload.
        let mut p = TYPE_GET.to_be_bytes().to_vec();
        p.extend_from_slice(&100u32.to_be_bytes());
        p.extend_from_slice(b"short");
        assert!(KvRequest::parse(&packet(p)).is_err());
        // Non-UTF-8 key.
        let mut p = TYPE_GET.to_be_bytes().to_vec();
        p.extend_from_slice(&2u32.to_be_bytes());
        p.extend_from_slice(&[0xff, 0xfe]);
        assert!(KvRequest::parse(&packet(p)).is_err());
        // Unknown type.
        assert!(KvRequest::parse(&packet(framed(9, "k", None))).is_err());
    }
}
