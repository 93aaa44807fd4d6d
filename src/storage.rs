//!
//! src/storage.rs
//!
//! S3 upload and presigned GET url, signed with AWS Signature V4
//! (virtual-hosted addressing: https://{bucket}.s3.{region}.amazonaws.com)
//!

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::AwsCredentials;
use crate::errors::StoryError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, StoryError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StoryError::Storage(format!("hmac key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) ->
    Result<Vec<u8>, StoryError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date)?;
    let k_region = hmac_sha256(&k_date, region)?;
    let k_service = hmac_sha256(&k_region, service)?;
    hmac_sha256(&k_service, "aws4_request")
}

/// RFC 3986 encoding; unreserved characters pass through
fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' =>
                out.push(b as char),
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{b:02X}"))
        }
    }
    out
}

fn guess_content_type(path: &Path) -> &'static str {
    match path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg"
    }
}

/// Bucket/key location plus the keys that sign requests against it
#[derive(Debug, Clone)]
pub struct S3Target {
    pub host: String,
    pub region: String,
    pub key: String,
    access_key_id: String,
    secret_access_key: String
}

impl S3Target {
    pub fn new(host: &str, region: &str, key: &str, access_key_id: &str, secret: &str) -> Self {
        Self {
            host: host.to_string(),
            region: region.to_string(),
            key: key.trim_start_matches('/').to_string(),
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret.to_string()
        }
    }

    pub fn from_credentials(aws: &AwsCredentials) -> Self {
        let host = format!("{}.s3.{}.amazonaws.com", aws.bucket, aws.region);
        Self::new(&host, &aws.region, &aws.key, &aws.access_key_id, &aws.secret_access_key)
    }

    fn canonical_uri(&self) -> String {
        format!("/{}", uri_encode(&self.key, false))
    }

    fn scope(&self, date: &str) -> String {
        format!("{date}/{}/{SERVICE}/aws4_request", self.region)
    }

    fn signature(&self, now: DateTime<Utc>, canonical_request: &str) ->
        Result<String, StoryError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{}\n{}",
            self.scope(&date),
            sha256_hex(canonical_request.as_bytes())
        );
        let key = signing_key(&self.secret_access_key, &date, &self.region, SERVICE)?;
        Ok(hex::encode(hmac_sha256(&key, &string_to_sign)?))
    }

    ///
    /// Authorization header value for a header-signed request. `headers`
    /// must include host and x-amz-date; every header given is signed.
    ///
    pub fn authorization(
        &self,
        method: &str,
        headers: &[(&str, &str)],
        payload_hash: &str,
        now: DateTime<Utc>
    ) -> Result<String, StoryError> {
        let mut canonical: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        canonical.sort();

        let canonical_headers: String = canonical
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = canonical
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{method}\n{}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            self.canonical_uri()
        );
        let signature = self.signature(now, &canonical_request)?;
        let date = now.format("%Y%m%d").to_string();
        Ok(format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id,
            self.scope(&date)
        ))
    }

    /// Query-signed GET url valid for `expires` from `now`
    pub fn presign_get(&self, now: DateTime<Utc>, expires: Duration) ->
        Result<String, StoryError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let credential = format!("{}/{}", self.access_key_id, self.scope(&date));

        // already in canonical (sorted) order
        let query = [
            ("X-Amz-Algorithm", ALGORITHM.to_string()),
            ("X-Amz-Credential", credential),
            ("X-Amz-Date", amz_date),
            ("X-Amz-Expires", expires.as_secs().to_string()),
            ("X-Amz-SignedHeaders", "host".to_string()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&");

        let canonical_request = format!(
            "GET\n{}\n{query}\nhost:{}\n\nhost\n{UNSIGNED_PAYLOAD}",
            self.canonical_uri(),
            self.host
        );
        let signature = self.signature(now, &canonical_request)?;
        Ok(format!(
            "https://{}{}?{query}&X-Amz-Signature={signature}",
            self.host,
            self.canonical_uri()
        ))
    }
}

pub struct ObjectStore {
    http: Client,
    target: S3Target
}

impl ObjectStore {
    pub fn new(http: Client, target: S3Target) -> Self {
        Self { http, target }
    }

    /// PUT the file at the configured key
    pub async fn upload(&self, path: &Path) -> Result<(), StoryError> {
        let body = tokio::fs::read(path).await?;
        let content_type = guess_content_type(path);
        let payload_hash = sha256_hex(&body);
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let authorization = self.target.authorization(
            "PUT",
            &[
                ("content-type", content_type),
                ("host", self.target.host.as_str()),
                ("x-amz-content-sha256", payload_hash.as_str()),
                ("x-amz-date", amz_date.as_str()),
            ],
            &payload_hash,
            now
        )?;

        info!(
            path = %path.display(),
            host = %self.target.host,
            key = %self.target.key,
            content_type,
            "storage.upload"
        );
        let url = format!("https://{}{}", self.target.host, self.target.canonical_uri());
        let resp = self.http
            .put(url)
            .header("content-type", content_type)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| StoryError::Storage(format!("upload failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoryError::Storage(format!("upload returned {status}: {body}")));
        }
        Ok(())
    }

    pub fn presign_get(&self, expires: Duration) -> Result<String, StoryError> {
        let url = self.target.presign_get(Utc::now(), expires)?;
        info!(expires_secs = expires.as_secs(), "storage.presigned");
        Ok(url)
    }
}
