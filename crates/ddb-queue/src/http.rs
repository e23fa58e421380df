use crate::{sign, AwsCredentials};
use async_trait::async_trait;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// The response had no body.
    Empty,
    /// The body exceeded the caller's size cap and was discarded.
    TooLarge,
    Data(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.body {
            ResponseBody::Data(data) => Some(data),
            ResponseBody::Empty | ResponseBody::TooLarge => None,
        }
    }

    /// Body length as reported in the audit log; an over-length body
    /// reports the all-ones sentinel.
    pub fn body_len(&self) -> usize {
        match &self.body {
            ResponseBody::Data(data) => data.len(),
            ResponseBody::Empty => 0,
            ResponseBody::TooLarge => usize::MAX,
        }
    }
}

/// One HTTP attempt against a specific target address. `None` means the
/// attempt failed at the connection level (no response was read); the
/// request queue retries those indefinitely.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn request(
        &self,
        addr: SocketAddr,
        op: &str,
        body: &[u8],
        maxrlen: usize,
    ) -> Option<HttpResponse>;
}

/// SigV4-signing DynamoDB client. Each attempt opens its own connection
/// to the address the scheduler picked, with TLS verified against the
/// real endpoint hostname.
pub struct AwsHttpClient {
    creds: AwsCredentials,
    region: String,
    host: String,
}

impl AwsHttpClient {
    pub fn new(creds: AwsCredentials, region: impl Into<String>) -> Self {
        let region = region.into();
        let host = format!("dynamodb.{region}.amazonaws.com");
        Self {
            creds,
            region,
            host,
        }
    }
}

#[async_trait]
impl HttpClient for AwsHttpClient {
    async fn request(
        &self,
        addr: SocketAddr,
        op: &str,
        body: &[u8],
        maxrlen: usize,
    ) -> Option<HttpResponse> {
        let headers = sign::dynamodb_headers(
            &self.creds,
            &self.region,
            &self.host,
            op,
            body,
            chrono::Utc::now(),
        );

        let client = reqwest::Client::builder()
            .resolve(&self.host, addr)
            .build()
            .ok()?;

        let mut req = client.post(format!("https://{}/", self.host));
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let response = match req.body(body.to_vec()).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!("DynamoDB {op} to {addr} failed: {err}");
                return None;
            }
        };

        let status = response.status().as_u16();

        if let Some(announced) = response.content_length() {
            if announced as usize > maxrlen {
                return Some(HttpResponse {
                    status,
                    body: ResponseBody::TooLarge,
                });
            }
        }

        let data = match response.bytes().await {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!("error reading DynamoDB {op} response body: {err}");
                return None;
            }
        };

        let body = if data.len() > maxrlen {
            ResponseBody::TooLarge
        } else if data.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Data(data.to_vec())
        };

        Some(HttpResponse { status, body })
    }
}
