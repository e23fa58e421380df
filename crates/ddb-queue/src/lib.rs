//! Rate-limited, priority-preserving request scheduler for DynamoDB.
//!
//! The queue models available throughput as a token bucket whose
//! consumption is *measured* from `ConsumedCapacity` fields in responses,
//! retries throttle/5xx/connection failures indefinitely with TCP-style
//! exponential backoff, and only surfaces terminal responses upstream.

mod credentials;
mod http;
mod queue;
mod sign;
pub mod testing;

pub use credentials::AwsCredentials;
pub use http::{AwsHttpClient, HttpClient, HttpResponse, ResponseBody};
pub use queue::RequestQueue;
