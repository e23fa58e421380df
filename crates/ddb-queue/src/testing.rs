//! A scriptable in-memory HTTP backend for exercising the request queue
//! and its consumers without a network.

use crate::{HttpClient, HttpResponse, ResponseBody};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub enum FakeReply {
    Respond(HttpResponse),
    /// Connection-level failure; the client callback sees no response.
    Fail,
    /// Never complete. The attempt only ends when the queue times it out
    /// or cancels it.
    Hang,
}

impl FakeReply {
    pub fn status(status: u16, body: &str) -> Self {
        FakeReply::Respond(HttpResponse {
            status,
            body: if body.is_empty() {
                ResponseBody::Empty
            } else {
                ResponseBody::Data(body.as_bytes().to_vec())
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct FakeCall {
    pub op: String,
    pub body: String,
    pub addr: SocketAddr,
}

/// Pops one scripted reply per request, in order; an exhausted script
/// hangs. Every request is recorded for later assertions.
#[derive(Default)]
pub struct FakeHttpClient {
    script: Mutex<VecDeque<FakeReply>>,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: FakeReply) {
        self.script.lock().push_back(reply);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.op.clone()).collect()
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn request(
        &self,
        addr: SocketAddr,
        op: &str,
        body: &[u8],
        _maxrlen: usize,
    ) -> Option<HttpResponse> {
        self.calls.lock().push(FakeCall {
            op: op.to_string(),
            body: String::from_utf8_lossy(body).to_string(),
            addr,
        });

        let reply = self.script.lock().pop_front();
        match reply {
            Some(FakeReply::Respond(response)) => Some(response),
            Some(FakeReply::Fail) => None,
            Some(FakeReply::Hang) | None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
