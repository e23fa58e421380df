use crate::AwsCredentials;
use aws_lc_rs::{digest, hmac};
use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "dynamodb";

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(digest::digest(&digest::SHA256, data).as_ref())
}

fn signing_key(secret: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Compute the full header set for a signed DynamoDB request: Host,
/// X-Amz-Date, X-Amz-Content-SHA256, X-Amz-Target, Authorization and
/// Content-Type. The request is always `POST /` with no query string.
pub(crate) fn dynamodb_headers(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    op: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(body);
    let target = format!("DynamoDB_20120810.{op}");
    let content_type = "application/x-amz-json-1.0";

    // Canonical headers, lowercase and sorted.
    let canonical_headers = format!(
        "content-type:{content_type}\n\
         host:{host}\n\
         x-amz-content-sha256:{payload_hash}\n\
         x-amz-date:{amz_date}\n\
         x-amz-target:{target}\n"
    );
    let signed_headers = "content-type;host;x-amz-content-sha256;x-amz-date;x-amz-target";

    let canonical_request =
        format!("POST\n/\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");

    let scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(&creds.key_secret, &date_stamp, region);
    let signature = HEXLOWER.encode(&hmac_sha256(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, \
         Signature={signature}",
        creds.key_id
    );

    vec![
        ("Host", host.to_string()),
        ("X-Amz-Date", amz_date),
        ("X-Amz-Content-SHA256", payload_hash),
        ("X-Amz-Target", target),
        ("Authorization", authorization),
        ("Content-Type", content_type.to_string()),
    ]
}
