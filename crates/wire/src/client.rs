use crate::frame::{FrameReader, FrameWriter};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Client-side request multiplexer over a framed connection.
///
/// Allocates request IDs, tracks the callback for each in-flight request,
/// and demultiplexes responses by ID. Once the connection fails, every
/// pending and future request resolves to `None`.
pub struct RequestQueue {
    inner: Arc<Inner>,
    reader: tokio::task::JoinHandle<()>,
}

struct Inner {
    writer: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
    pending: Mutex<Pending>,
}

struct Pending {
    next_id: u64,
    replies: HashMap<u64, oneshot::Sender<Bytes>>,
    failed: bool,
}

impl RequestQueue {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        let (rd, wr) = stream.into_split();
        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(FrameWriter::new(wr)),
            pending: Mutex::new(Pending {
                next_id: 0,
                replies: HashMap::new(),
                failed: false,
            }),
        });
        let reader = tokio::spawn(read_responses(FrameReader::new(rd), inner.clone()));
        Self { inner, reader }
    }

    /// Send one request and wait for its response payload. `None` means
    /// the connection failed before a response arrived.
    pub async fn request(&self, payload: &[u8]) -> Option<Bytes> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.inner.pending.lock();
            if pending.failed {
                return None;
            }
            let id = pending.next_id;
            pending.next_id += 1;
            pending.replies.insert(id, tx);
            id
        };

        {
            let mut writer = self.inner.writer.lock().await;
            writer.write_packet(id, payload);
            writer.flush().await;
            if writer.failed() {
                self.inner.fail_all();
            }
        }

        rx.await.ok()
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Inner {
    fn fail_all(&self) {
        let mut pending = self.pending.lock();
        pending.failed = true;
        // Dropping the senders resolves every waiter with None.
        pending.replies.clear();
    }
}

async fn read_responses(mut reader: FrameReader<OwnedReadHalf>, inner: Arc<Inner>) {
    loop {
        match reader.read_packet().await {
            Ok(Some(packet)) => {
                let reply = inner.pending.lock().replies.remove(&packet.id);
                match reply {
                    Some(tx) => {
                        tx.send(packet.payload).ok();
                    }
                    None => {
                        tracing::warn!("response for unknown request ID {}", packet.id);
                        inner.fail_all();
                        return;
                    }
                }
            }
            Ok(None) | Err(_) => {
                inner.fail_all();
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{FrameReader, FrameWriter};
    use tokio::net::TcpListener;

    /// Answers each request out of order (pairs swapped) to exercise the
    /// ID demux.
    async fn swap_pair_server(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, wr) = stream.into_split();
        let mut reader = FrameReader::new(rd);
        let mut writer = FrameWriter::new(wr);
        loop {
            let a = match reader.read_packet().await {
                Ok(Some(p)) => p,
                _ => return,
            };
            let b = match reader.read_packet().await {
                Ok(Some(p)) => p,
                _ => return,
            };
            writer.write_packet(b.id, &b.payload);
            writer.write_packet(a.id, &a.payload);
            writer.flush().await;
        }
    }

    #[tokio::test]
    async fn demux_out_of_order_responses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(swap_pair_server(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let q = Arc::new(RequestQueue::new(stream));

        let qa = q.clone();
        let a = tokio::spawn(async move { qa.request(b"first").await });
        let qb = q.clone();
        let b = tokio::spawn(async move { qb.request(b"second").await });

        assert_eq!(a.await.unwrap().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(b.await.unwrap().unwrap(), Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn pending_requests_fail_on_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Read one packet and hang up without answering.
            let (rd, _wr) = stream.into_split();
            let mut reader = FrameReader::new(rd);
            reader.read_packet().await.ok();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let q = RequestQueue::new(stream);
        assert_eq!(q.request(b"doomed").await, None);
    }
}
