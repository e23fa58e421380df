//! Per-connection protocol state machine.
//!
//! One client connection is served at a time. The event loop interleaves
//! two sources: request packets from the client and completions from the
//! worker pool. Responses go out in completion order; clients pipeline
//! using request IDs.

use crate::proto::{self, Request};
use crate::worker::{Completion, Job, Outcome, WorkerPool};
use blockstore::Store;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use wire::{FrameReader, FrameWriter};

pub struct Dispatcher {
    store: Arc<Store>,
    block_len: u32,
    pool: WorkerPool,
    /// Stack of read workers with no work assigned.
    idle_readers: Vec<usize>,
    writer_busy: bool,
    deleter_busy: bool,
}

struct Conn {
    /// GETs waiting for an idle read worker: (request ID, block number).
    readq: VecDeque<(u64, u64)>,
    /// Responses owed for work handed to the worker pool. The connection
    /// must stay alive until these drain, because the workers hold
    /// buffers for them.
    npending: usize,
    /// Still accepting requests from the socket.
    reading: bool,
}

/// The client broke the protocol; the connection gets dropped.
struct Violation;

impl Dispatcher {
    pub fn new(store: Arc<Store>, nreaders: usize) -> Self {
        let block_len = store.block_len() as u32;
        let pool = WorkerPool::start(store.clone(), nreaders);
        Self {
            store,
            block_len,
            pool,
            idle_readers: (0..nreaders).collect(),
            writer_busy: false,
            deleter_busy: false,
        }
    }

    /// Accept and serve connections, one at a time.
    pub async fn serve(&mut self, listener: TcpListener, once: bool) -> anyhow::Result<()> {
        let completions = self.pool.completions();
        loop {
            // Workers (the deleter in particular) may still be finishing
            // work from the previous connection while we wait.
            let stream = loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted?;
                        tracing::debug!("connection from {peer}");
                        break stream;
                    }
                    completion = completions.recv_async() => {
                        self.absorb_completion(completion?);
                    }
                }
            };

            self.handle_connection(stream).await;
            tracing::debug!("connection closed");

            if once {
                return Ok(());
            }
        }
    }

    async fn handle_connection(&mut self, stream: TcpStream) {
        stream.set_nodelay(true).ok();
        let (rd, wr) = stream.into_split();
        let mut reader = FrameReader::new(rd);
        let mut writer = FrameWriter::new(wr);
        let completions = self.pool.completions();

        let mut conn = Conn {
            readq: VecDeque::new(),
            npending: 0,
            reading: true,
        };

        while conn.reading || conn.npending > 0 {
            tokio::select! {
                packet = reader.read_packet(), if conn.reading => {
                    match packet {
                        Ok(Some(packet)) => {
                            if self.handle_packet(&packet, &mut conn, &mut writer).is_err() {
                                self.drop_connection(&mut conn);
                            }
                        }
                        // EOF or a malformed frame.
                        Ok(None) | Err(_) => self.drop_connection(&mut conn),
                    }
                }
                completion = completions.recv_async() => {
                    let Ok(completion) = completion else { return };
                    self.handle_completion(completion, &mut conn, &mut writer);
                }
            }

            writer.flush().await;
            if writer.failed() && conn.reading {
                // Can't send responses any more; stop taking requests and
                // just drain the in-flight work.
                self.drop_connection(&mut conn);
            }
        }
    }

    /// Stop reading and forget queued (unassigned) reads. Work already
    /// assigned to workers still completes and is drained via npending.
    fn drop_connection(&self, conn: &mut Conn) {
        conn.reading = false;
        conn.npending -= conn.readq.len();
        conn.readq.clear();
    }

    fn handle_packet(
        &mut self,
        packet: &wire::Packet,
        conn: &mut Conn,
        writer: &mut FrameWriter<OwnedWriteHalf>,
    ) -> Result<(), Violation> {
        let request = Request::parse(packet).map_err(|_| Violation)?;
        let id = packet.id;

        match request {
            // PARAMS reports a stable next block number, which is
            // meaningless while an APPEND is in progress.
            Request::Params => {
                if self.writer_busy {
                    return Err(Violation);
                }
                proto::respond_params(writer, id, self.block_len, self.store.next_block());
            }
            Request::Params2 => {
                if self.writer_busy {
                    return Err(Violation);
                }
                let nextblk = self.store.next_block();
                // Last block ever written; all-ones if there is none.
                let lastblk = nextblk.wrapping_sub(1);
                proto::respond_params2(writer, id, self.block_len, nextblk, lastblk);
            }
            Request::Get { blkno } => {
                conn.npending += 1;
                conn.readq.push_back((id, blkno));
                self.poke_readq(conn);
            }
            Request::Append {
                nblks,
                blklen,
                blkno,
                buf,
            } => {
                // Reject rather than assign: a wrong block length, a
                // stale block number, or a concurrent APPEND (in which
                // case the client cannot know the right block number)
                // all get a failure response and touch nothing.
                if blklen != self.block_len
                    || self.writer_busy
                    || blkno != self.store.next_block()
                {
                    proto::respond_append(writer, id, 1, u64::MAX);
                } else {
                    self.writer_busy = true;
                    conn.npending += 1;
                    self.pool.assign(
                        self.pool.writer_index(),
                        Job::Write {
                            blkno,
                            nblks: nblks as u64,
                            buf: buf.to_vec(),
                            req_id: id,
                        },
                    );
                }
            }
            Request::Free { blkno } => {
                // FREE is advisory: ack immediately, and only bother the
                // deleter if it is idle. A dropped FREE is caught up by
                // the next one.
                if !self.deleter_busy {
                    self.deleter_busy = true;
                    self.pool
                        .assign(self.pool.deleter_index(), Job::Delete { blkno });
                }
                proto::respond_free(writer, id);
            }
        }

        Ok(())
    }

    /// Launch queued GETs while idle read workers are available.
    fn poke_readq(&mut self, conn: &mut Conn) {
        while !self.idle_readers.is_empty() && !conn.readq.is_empty() {
            let (req_id, blkno) = conn.readq.pop_front().unwrap();
            let reader = self.idle_readers.pop().unwrap();
            self.pool.assign(reader, Job::Read { blkno, req_id });
        }
    }

    fn handle_completion(
        &mut self,
        completion: Completion,
        conn: &mut Conn,
        writer: &mut FrameWriter<OwnedWriteHalf>,
    ) {
        match completion.outcome {
            Outcome::Read { req_id, data } => {
                proto::respond_get(writer, req_id, data.as_deref());
                self.idle_readers.push(completion.worker);
                conn.npending -= 1;
                self.poke_readq(conn);
            }
            Outcome::Write { req_id } => {
                proto::respond_append(writer, req_id, 0, self.store.next_block());
                self.writer_busy = false;
                conn.npending -= 1;
            }
            Outcome::Delete => {
                // The ack went out when the FREE arrived.
                self.deleter_busy = false;
            }
        }
    }

    /// Completion handling for the window when no connection is open.
    fn absorb_completion(&mut self, completion: Completion) {
        match completion.outcome {
            Outcome::Read { .. } => self.idle_readers.push(completion.worker),
            Outcome::Write { .. } => self.writer_busy = false,
            Outcome::Delete => self.deleter_busy = false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use wire::RequestQueue;

    async fn start_server(block_len: usize) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), block_len, 0, false).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut dispatcher = Dispatcher::new(store, 4);
            dispatcher.serve(listener, true).await.unwrap();
        });
        (addr, task, dir)
    }

    fn params_req() -> Vec<u8> {
        0u32.to_be_bytes().to_vec()
    }

    fn params2_req() -> Vec<u8> {
        4u32.to_be_bytes().to_vec()
    }

    fn get_req(blkno: u64) -> Vec<u8> {
        let mut p = 1u32.to_be_bytes().to_vec();
        p.extend_from_slice(&blkno.to_be_bytes());
        p
    }

    fn append_req(nblks: u32, blkno: u64, data: &[u8]) -> Vec<u8> {
        let mut p = 2u32.to_be_bytes().to_vec();
        p.extend_from_slice(&nblks.to_be_bytes());
        p.extend_from_slice(&blkno.to_be_bytes());
        p.extend_from_slice(data);
        p
    }

    fn free_req(blkno: u64) -> Vec<u8> {
        let mut p = 3u32.to_be_bytes().to_vec();
        p.extend_from_slice(&blkno.to_be_bytes());
        p
    }

    fn be32(b: &[u8]) -> u32 {
        u32::from_be_bytes(b[0..4].try_into().unwrap())
    }

    fn be64(b: &[u8]) -> u64 {
        u64::from_be_bytes(b[0..8].try_into().unwrap())
    }

    #[tokio::test]
    async fn basic_round_trip() {
        let (addr, server, _dir) = start_server(512).await;
        let client = RequestQueue::new(TcpStream::connect(addr).await.unwrap());

        // PARAMS: empty store.
        let r = client.request(&params_req()).await.unwrap();
        assert_eq!(be32(&r[0..4]), 512);
        assert_eq!(be64(&r[4..12]), 0);

        // APPEND one block of 0x42.
        let r = client
            .request(&append_req(1, 0, &[0x42; 512]))
            .await
            .unwrap();
        assert_eq!(be32(&r[0..4]), 0);
        assert_eq!(be64(&r[4..12]), 1);

        // GET it back.
        let r = client.request(&get_req(0)).await.unwrap();
        assert_eq!(be32(&r[0..4]), 0);
        assert_eq!(&r[4..], &[0x42u8; 512][..]);

        // GET past the end of the log misses.
        let r = client.request(&get_req(1)).await.unwrap();
        assert_eq!(be32(&r[0..4]), 1);
        assert_eq!(r.len(), 4);

        // FREE always succeeds.
        let r = client.request(&free_req(1)).await.unwrap();
        assert_eq!(be32(&r[0..4]), 0);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn append_rejects_without_touching_the_log() {
        let (addr, server, _dir) = start_server(512).await;
        let client = RequestQueue::new(TcpStream::connect(addr).await.unwrap());

        let r = client
            .request(&append_req(1, 0, &[0x01; 512]))
            .await
            .unwrap();
        assert_eq!(be32(&r[0..4]), 0);

        // Wrong block number.
        let r = client
            .request(&append_req(1, 9, &[0x02; 512]))
            .await
            .unwrap();
        assert_eq!(be32(&r[0..4]), 1);
        assert_eq!(r.len(), 4);

        // Wrong (implied) block length.
        let r = client
            .request(&append_req(1, 1, &[0x03; 256]))
            .await
            .unwrap();
        assert_eq!(be32(&r[0..4]), 1);

        // The log is exactly where it was.
        let r = client.request(&params_req()).await.unwrap();
        assert_eq!(be64(&r[4..12]), 1);
        let r = client.request(&get_req(1)).await.unwrap();
        assert_eq!(be32(&r[0..4]), 1);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn params2_reports_last_block() {
        let (addr, server, _dir) = start_server(512).await;
        let client = RequestQueue::new(TcpStream::connect(addr).await.unwrap());

        let r = client.request(&params2_req()).await.unwrap();
        assert_eq!(be32(&r[0..4]), 512);
        assert_eq!(be64(&r[4..12]), 0);
        assert_eq!(be64(&r[12..20]), u64::MAX);

        client
            .request(&append_req(2, 0, &[0x55; 1024]))
            .await
            .unwrap();

        let r = client.request(&params2_req()).await.unwrap();
        assert_eq!(be64(&r[4..12]), 2);
        assert_eq!(be64(&r[12..20]), 1);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn pipelined_gets_all_answered() {
        let (addr, server, _dir) = start_server(512).await;
        let client = Arc::new(RequestQueue::new(TcpStream::connect(addr).await.unwrap()));

        for i in 0..8u64 {
            let r = client
                .request(&append_req(1, i, &[i as u8; 512]))
                .await
                .unwrap();
            assert_eq!(be32(&r[0..4]), 0);
        }

        // More GETs in flight than there are read workers.
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                (i, client.request(&get_req(i)).await.unwrap())
            }));
        }
        for handle in handles {
            let (i, r) = handle.await.unwrap();
            assert_eq!(be32(&r[0..4]), 0);
            assert_eq!(&r[4..], &[i as u8; 512][..]);
        }

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn freed_blocks_eventually_miss() {
        let (addr, server, _dir) = start_server(512).await;
        let client = RequestQueue::new(TcpStream::connect(addr).await.unwrap());

        // 17 single-block appends: 16 segment files, the last holding
        // blocks 15 and 16.
        for i in 0..17u64 {
            client
                .request(&append_req(1, i, &[i as u8; 512]))
                .await
                .unwrap();
        }

        let r = client.request(&free_req(3)).await.unwrap();
        assert_eq!(be32(&r[0..4]), 0);

        // The deleter runs asynchronously; poll until block 0 is gone.
        // FREE is idempotent, so re-sending is harmless.
        for _ in 0..100 {
            client.request(&free_req(3)).await.unwrap();
            let r = client.request(&get_req(0)).await.unwrap();
            if be32(&r[0..4]) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let r = client.request(&get_req(0)).await.unwrap();
        assert_eq!(be32(&r[0..4]), 1);

        // Block 3 survived.
        let r = client.request(&get_req(3)).await.unwrap();
        assert_eq!(be32(&r[0..4]), 0);
        assert_eq!(&r[4..], &[3u8; 512][..]);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_packet_drops_the_connection() {
        let (addr, server, _dir) = start_server(512).await;
        let client = RequestQueue::new(TcpStream::connect(addr).await.unwrap());

        // Unknown request type: the server hangs up, so the request
        // resolves with no response.
        assert!(client.request(&99u32.to_be_bytes()).await.is_none());

        drop(client);
        server.await.unwrap();
    }
}
