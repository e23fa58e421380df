use crate::FrameError;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// `ID | len | payload` header size.
pub const HEADER_LEN: usize = 12;

/// Upper bound on a single frame's payload. The largest legal request is
/// an APPEND of many maximum-size blocks; anything beyond this is a
/// malformed frame and the connection carrying it should be dropped.
pub const MAX_FRAME_LEN: u32 = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub payload: Bytes,
}

/// Buffered packet reader over a byte stream.
///
/// `read_packet` is cancel-safe: bytes consumed from the stream are held
/// in the internal buffer, so dropping the future partway through a frame
/// loses nothing.
pub struct FrameReader<R> {
    src: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next packet. Returns `Ok(None)` on EOF at a frame
    /// boundary; EOF inside a frame is an error.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        loop {
            if let Some(packet) = self.parse()? {
                return Ok(Some(packet));
            }
            let n = self.src.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Truncated);
            }
        }
    }

    fn parse(&mut self) -> Result<Option<Packet>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let id = u64::from_be_bytes(self.buf[0..8].try_into().unwrap());
        let len = u32::from_be_bytes(self.buf[8..12].try_into().unwrap());
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(len));
        }
        let total = HEADER_LEN + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(HEADER_LEN);
        Ok(Some(Packet {
            id,
            payload: frame.freeze(),
        }))
    }
}

/// Coalescing packet writer.
///
/// Packets accumulate in an internal buffer until `flush`. After the
/// first write failure the writer goes dead: further packets and flushes
/// are silently dropped, and `failed()` reports the condition so the
/// owner can tear the connection down.
pub struct FrameWriter<W> {
    dst: W,
    buf: BytesMut,
    failed: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(dst: W) -> Self {
        Self {
            dst,
            buf: BytesMut::with_capacity(4096),
            failed: false,
        }
    }

    pub fn write_packet(&mut self, id: u64, payload: &[u8]) {
        if self.failed {
            return;
        }
        self.buf.reserve(HEADER_LEN + payload.len());
        self.buf.extend_from_slice(&id.to_be_bytes());
        self.buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub async fn flush(&mut self) {
        if self.failed || self.buf.is_empty() {
            return;
        }
        let pending = self.buf.split();
        if let Err(err) = self.dst.write_all(&pending).await {
            tracing::debug!("write failed, dropping further output: {err}");
            self.failed = true;
        }
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn packet_round_trip() {
        let (client, server) = tokio::io::duplex(64);
        let (rd, _wr) = tokio::io::split(server);
        let (_crd, cwr) = tokio::io::split(client);

        let mut writer = FrameWriter::new(cwr);
        writer.write_packet(7, b"hello");
        writer.write_packet(8, b"");
        writer.flush().await;
        assert!(!writer.failed());

        let mut reader = FrameReader::new(rd);
        let p = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(p.id, 7);
        assert_eq!(&p.payload[..], b"hello");
        let p = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(p.id, 8);
        assert!(p.payload.is_empty());
    }

    #[tokio::test]
    async fn frame_split_across_reads() {
        // A small duplex buffer forces the reader to assemble the frame
        // from multiple read calls.
        let (client, server) = tokio::io::duplex(4);
        let (rd, _wr) = tokio::io::split(server);
        let (_crd, cwr) = tokio::io::split(client);

        let payload = vec![0xa5u8; 300];
        let expect = payload.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(cwr);
            writer.write_packet(42, &payload);
            writer.flush().await;
        });

        let mut reader = FrameReader::new(rd);
        let p = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(p.id, 42);
        assert_eq!(&p.payload[..], &expect[..]);
    }

    #[tokio::test]
    async fn eof_at_boundary_and_mid_frame() {
        let (mut client, server) = tokio::io::duplex(64);

        // A complete frame followed by half a header.
        client.write_all(&1u64.to_be_bytes()).await.unwrap();
        client.write_all(&0u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0u8; 5]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(reader.read_packet().await.unwrap().is_some());
        assert!(matches!(
            reader.read_packet().await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let (rd, _wr) = tokio::io::split(server);
        let (_crd, mut cwr) = tokio::io::split(client);

        cwr.write_all(&1u64.to_be_bytes()).await.unwrap();
        cwr.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let mut reader = FrameReader::new(rd);
        assert!(matches!(
            reader.read_packet().await,
            Err(FrameError::Oversized(_))
        ));
    }
}
