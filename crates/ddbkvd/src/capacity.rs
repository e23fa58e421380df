//! Tracks the table's provisioned throughput and feeds it to the request
//! queues.
//!
//! DescribeTable is polled every 15 seconds (every second until the
//! first success). The first poll is awaited before the daemon starts
//! serving, so the very first client request is already rate-limited.

use ddb_queue::{HttpClient, RequestQueue};
use serde_json::json;
use server_pool::ServerPool;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
enum CapacityMode {
    /// PAY_PER_REQUEST: no rate limiting.
    OnDemand,
    Provisioned { read: u32, write: u32 },
}

pub struct CapacityPoller {
    pool: ServerPool,
    client: Arc<dyn HttpClient>,
    table: String,
    write_queue: RequestQueue,
    read_queue: RequestQueue,
}

impl CapacityPoller {
    pub fn new(
        pool: ServerPool,
        client: Arc<dyn HttpClient>,
        table: impl Into<String>,
        write_queue: RequestQueue,
        read_queue: RequestQueue,
    ) -> Self {
        Self {
            pool,
            client,
            table: table.into(),
            write_queue,
            read_queue,
        }
    }

    /// Fetch the table's capacity once (retrying until it succeeds),
    /// then keep it fresh from a background task.
    pub async fn start(self) -> tokio::task::JoinHandle<()> {
        while !self.fetch_once().await {
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                self.fetch_once().await;
            }
        })
    }

    async fn fetch_once(&self) -> bool {
        let body = json!({ "TableName": self.table }).to_string();
        let addr = self.pool.pick();
        let response = self
            .client
            .request(addr, "DescribeTable", body.as_bytes(), 4096)
            .await;

        let Some(response) = response else {
            tracing::debug!("DescribeTable to {addr} failed");
            return false;
        };
        let Some(bytes) = response.bytes() else {
            return false;
        };

        match parse_capacity(bytes) {
            Some(CapacityMode::OnDemand) => {
                self.read_queue.set_capacity(0);
                self.write_queue.set_capacity(0);
            }
            Some(CapacityMode::Provisioned { read, write }) => {
                self.read_queue.set_capacity(read);
                self.write_queue.set_capacity(write);
            }
            // A response we cannot interpret leaves the previous
            // capacities in place; the next poll may do better.
            None => tracing::warn!("unparseable DescribeTable response for {}", self.table),
        }

        true
    }
}

fn parse_capacity(body: &[u8]) -> Option<CapacityMode> {
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    let table = v.get("Table")?;

    // Tables which have always been provisioned may omit the billing
    // mode summary entirely; only an explicit PAY_PER_REQUEST means
    // unlimited.
    if let Some(mode) = table
        .get("BillingModeSummary")
        .and_then(|s| s.get("BillingMode"))
        .and_then(|m| m.as_str())
    {
        if mode == "PAY_PER_REQUEST" {
            return Some(CapacityMode::OnDemand);
        }
    }

    let throughput = table.get("ProvisionedThroughput")?;
    let read = throughput.get("ReadCapacityUnits")?.as_u64()?;
    let write = throughput.get("WriteCapacityUnits")?.as_u64()?;
    Some(CapacityMode::Provisioned {
        read: read.min(u32::MAX as u64) as u32,
        write: write.min(u32::MAX as u64) as u32,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_on_demand() {
        let body = br#"{"Table":{"BillingModeSummary":{"BillingMode":"PAY_PER_REQUEST"}}}"#;
        assert_eq!(parse_capacity(body), Some(CapacityMode::OnDemand));
    }

    #[test]
    fn parses_provisioned() {
        let body = br#"{"Table":{
            "BillingModeSummary":{"BillingMode":"PROVISIONED"},
            "ProvisionedThroughput":{
                "ReadCapacityUnits":100,
                "WriteCapacityUnits":25,
                "NumberOfDecreasesToday":0
            }}}"#;
        assert_eq!(
            parse_capacity(body),
            Some(CapacityMode::Provisioned {
                read: 100,
                write: 25
            })
        );
    }

    #[test]
    fn missing_billing_mode_falls_back_to_throughput() {
        let body = br#"{"Table":{"ProvisionedThroughput":{
            "ReadCapacityUnits":7,"WriteCapacityUnits":3}}}"#;
        assert_eq!(
            parse_capacity(body),
            Some(CapacityMode::Provisioned { read: 7, write: 3 })
        );
    }

    #[test]
    fn unparseable_is_none() {
        assert_eq!(parse_capacity(b"not json"), None);
        assert_eq!(parse_capacity(b"{}"), None);
        assert_eq!(parse_capacity(br#"{"Table":{}}"#), None);
    }
}
