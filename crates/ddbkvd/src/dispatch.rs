//! Bridges the binary KV protocol to the DynamoDB request queues.
//!
//! One client connection is served at a time. Writes (PUT, DELETE) and
//! reads (GET, GETC) go to separate queues so their rate limits track
//! the table's write and read capacity independently. Each request is
//! bridged by a small task that waits for the queue's terminal response
//! and writes the protocol reply; when the client disconnects, both
//! queues are flushed and those tasks wind down unanswered.

use crate::kv;
use crate::proto::{self, KvRequest};
use ddb_queue::{RequestQueue, ResponseBody};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use wire::{FrameReader, FrameWriter};

const MAXRLEN_WRITE: usize = 1024;
const MAXRLEN_READ: usize = 1024 * 1024;

pub struct KvDispatcher {
    write_queue: RequestQueue,
    read_queue: RequestQueue,
    table: String,
}

type SharedWriter = Arc<tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>>;

impl KvDispatcher {
    pub fn new(write_queue: RequestQueue, read_queue: RequestQueue, table: impl Into<String>) -> Self {
        Self {
            write_queue,
            read_queue,
            table: table.into(),
        }
    }

    /// Accept and serve connections, one at a time.
    pub async fn serve(&self, listener: TcpListener, once: bool) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!("connection from {peer}");
            self.handle_connection(stream).await;
            tracing::debug!("connection closed");
            if once {
                return Ok(());
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) {
        stream.set_nodelay(true).ok();
        let (rd, wr) = stream.into_split();
        let mut reader = FrameReader::new(rd);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(wr)));

        loop {
            match reader.read_packet().await {
                Ok(Some(packet)) => {
                    let request = match KvRequest::parse(&packet) {
                        Ok(request) => request,
                        Err(_) => break,
                    };
                    self.dispatch(packet.id, request, writer.clone());
                }
                Ok(None) | Err(_) => break,
            }
        }

        // The client is gone; responses have nowhere to go, so stop
        // processing what it asked for.
        self.write_queue.flush();
        self.read_queue.flush();
    }

    fn dispatch(&self, id: u64, request: KvRequest, writer: SharedWriter) {
        let key = request.key().to_string();
        let (queue, op, prio, maxrlen, body) = match &request {
            KvRequest::Put { key, value } => (
                &self.write_queue,
                "PutItem",
                0,
                MAXRLEN_WRITE,
                kv::put_body(&self.table, key, value),
            ),
            KvRequest::Get { key } => (
                &self.read_queue,
                "GetItem",
                0,
                MAXRLEN_READ,
                kv::get_body(&self.table, key),
            ),
            KvRequest::Getc { key } => (
                &self.read_queue,
                "GetItem",
                0,
                MAXRLEN_READ,
                kv::getc_body(&self.table, key),
            ),
            KvRequest::Delete { key } => (
                &self.write_queue,
                "DeleteItem",
                1,
                MAXRLEN_WRITE,
                kv::delete_body(&self.table, key),
            ),
        };

        let reply = queue.enqueue(prio, op, body, maxrlen, Some(key));
        tokio::spawn(async move {
            // A closed channel means the queue was flushed; the client is
            // gone and there is nobody to answer.
            let Ok(response) = reply.await else { return };

            let mut writer = writer.lock().await;
            match request {
                KvRequest::Put { .. } | KvRequest::Delete { .. } => {
                    let status = if response.status == 200 { 0 } else { 1 };
                    proto::respond_status(&mut writer, id, status);
                }
                KvRequest::Get { .. } | KvRequest::Getc { .. } => {
                    if response.status != 200 || response.body == ResponseBody::TooLarge {
                        proto::respond_value(&mut writer, id, 1, None);
                    } else {
                        match kv::extract_value(response.bytes()) {
                            Some(value) => {
                                proto::respond_value(&mut writer, id, 0, Some(&value));
                            }
                            // A 200 without a stored value: present the
                            // absence distinctly from failure.
                            None => proto::respond_value(&mut writer, id, 2, None),
                        }
                    }
                }
            }
            writer.flush().await;
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ddb_queue::testing::{FakeHttpClient, FakeReply};
    use server_pool::{ServerPool, StaticResolver};
    use std::time::Duration;
    use wire::RequestQueue as WireClient;

    const PUT_OK: &str = r#"{"ConsumedCapacity":{"TableName":"tbl","CapacityUnits":1.0}}"#;
    const GET_HIT: &str = r#"{"Item":{"V":{"B":"dmFsdWUK"},"K":{"S":"key"}},"ConsumedCapacity":{"CapacityUnits":0.5}}"#;
    const GET_MISS: &str = r#"{"ConsumedCapacity":{"CapacityUnits":0.5}}"#;

    async fn start_server(
        fake: Arc<FakeHttpClient>,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let resolver = Arc::new(StaticResolver::new(vec!["127.0.0.1:443".parse().unwrap()]));
        let pool = ServerPool::spawn(
            resolver,
            "dynamodb.test:443",
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        let write_queue = RequestQueue::new(pool.clone(), fake.clone());
        let read_queue = RequestQueue::new(pool, fake);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let dispatcher = KvDispatcher::new(write_queue, read_queue, "tbl");
            dispatcher.serve(listener, true).await.unwrap();
        });
        (addr, task)
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

    fn be32(b: &[u8]) -> u32 {
        u32::from_be_bytes(b[0..4].try_into().unwrap())
    }

    #[tokio::test]
    async fn put_get_delete_flow() {
        let fake = FakeHttpClient::new();
        fake.push(FakeReply::status(200, PUT_OK)); // PUT
        fake.push(FakeReply::status(200, GET_HIT)); // GETC
        fake.push(FakeReply::status(200, PUT_OK)); // DELETE
        fake.push(FakeReply::status(200, GET_MISS)); // GET after delete
        let (addr, server) = start_server(fake.clone()).await;

        let client = WireClient::new(TcpStream::connect(addr).await.unwrap());

        // PUT k = "value\n"
        let r = client
            .request(&framed(proto::TYPE_PUT, "k", Some(b"value\n")))
            .await
            .unwrap();
        assert_eq!(be32(&r), 0);

        // GETC sees the value.
        let r = client
            .request(&framed(proto::TYPE_GETC, "k", None))
            .await
            .unwrap();
        assert_eq!(be32(&r[0..4]), 0);
        assert_eq!(be32(&r[4..8]), 6);
        assert_eq!(&r[8..], b"value\n");

        // DELETE succeeds.
        let r = client
            .request(&framed(proto::TYPE_DELETE, "k", None))
            .await
            .unwrap();
        assert_eq!(be32(&r), 0);

        // GET now reports no value: status 2, no length.
        let r = client
            .request(&framed(proto::TYPE_GET, "k", None))
            .await
            .unwrap();
        assert_eq!(be32(&r), 2);
        assert_eq!(r.len(), 4);

        // The backend saw the right operations with the right bodies.
        let ops = fake.ops();
        assert_eq!(ops, vec!["PutItem", "GetItem", "DeleteItem", "GetItem"]);
        let calls = fake.calls();
        assert!(calls[1].body.contains("\"ConsistentRead\":true"));
        assert!(!calls[3].body.contains("ConsistentRead"));

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_200_maps_to_failure_status() {
        let fake = FakeHttpClient::new();
        fake.push(FakeReply::status(
            400,
            r#"{"__type":"ValidationException"}"#,
        ));
        fake.push(FakeReply::status(
            400,
            r#"{"__type":"ValidationException"}"#,
        ));
        // An over-length body reaches the dispatcher as TooLarge and is
        // indistinguishable from failure for the client.
        fake.push(FakeReply::Respond(ddb_queue::HttpResponse {
            status: 200,
            body: ResponseBody::TooLarge,
        }));
        let (addr, server) = start_server(fake).await;

        let client = WireClient::new(TcpStream::connect(addr).await.unwrap());

        let r = client
            .request(&framed(proto::TYPE_PUT, "k", Some(b"v")))
            .await
            .unwrap();
        assert_eq!(be32(&r), 1);

        let r = client
            .request(&framed(proto::TYPE_GET, "k", None))
            .await
            .unwrap();
        assert_eq!(be32(&r), 1);
        assert_eq!(r.len(), 4);

        let r = client
            .request(&framed(proto::TYPE_GET, "k", None))
            .await
            .unwrap();
        assert_eq!(be32(&r), 1);
        assert_eq!(r.len(), 4);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_request_drops_connection() {
        let fake = FakeHttpClient::new();
        let (addr, server) = start_server(fake).await;

        let client = WireClient::new(TcpStream::connect(addr).await.unwrap());
        assert!(client.request(&[0u8; 2]).await.is_none());

        drop(client);
        server.await.unwrap();
    }
}
