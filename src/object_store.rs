//! Durable object storage for collection state.
//!
//! The object store is the long-lived owner of every collection across
//! process restarts: the in-memory index in [`crate::engine`] is a
//! read-optimized projection hydrated from here at startup and flushed
//! back on mutation.
//!
//! Two implementations of [`ObjectStore`]:
//! - **[`S3ObjectStore`]** — talks to S3 (or an S3-compatible endpoint such
//!   as MinIO/LocalStack) using the REST API with AWS Signature V4
//!   authentication. Pure-Rust signing (`hmac` + `sha2`), no C library
//!   dependencies.
//! - **[`MemoryObjectStore`]** — in-process map for tests and ephemeral
//!   local runs.
//!
//! # Environment Variables
//!
//! S3 credentials are read from the environment:
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::config::StoreConfig;

type HmacSha256 = Hmac<Sha256>;

/// Durable key/bytes storage. Keys are flat strings; the engine namespaces
/// them as `<prefix><collection>/<doc_id>.json`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List all object keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetch one object's bytes.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Write one object. Overwrites silently.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Delete one object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Create the configured [`ObjectStore`].
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.provider.as_str() {
        "s3" => Ok(Arc::new(S3ObjectStore::new(config)?)),
        "memory" => Ok(Arc::new(MemoryObjectStore::new())),
        other => bail!("Unknown store provider: {}", other),
    }
}

// ============ In-memory store ============

/// Process-local object store. State is lost on restart, which makes it
/// unsuitable for production but exactly right for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().expect("object store lock poisoned");
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let objects = self.objects.lock().expect("object store lock poisoned");
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No such object: {}", key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut objects = self.objects.lock().expect("object store lock poisoned");
        objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.lock().expect("object store lock poisoned");
        objects.remove(key);
        Ok(())
    }
}

// ============ S3 store ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Object store backed by an S3 bucket, signed with SigV4.
pub struct S3ObjectStore {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    /// Create the store. Missing credentials are fatal: the durable store
    /// owns collection state and cannot be silently absent.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        Ok(Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds,
            client: reqwest::Client::new(),
        })
    }

    /// Hostname for the bucket: a custom endpoint when configured
    /// (MinIO, LocalStack), the standard virtual-hosted S3 name otherwise.
    fn host(&self) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
        }
    }

    /// Sign and send one S3 request, returning the successful response.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        canonical_uri: &str,
        query_params: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let payload_hash = hex_sha256(&body);

        // Canonical query string must be sorted.
        let mut sorted_params = query_params.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let scheme = match self.endpoint_url {
            Some(ref e) if e.starts_with("http://") => "http",
            _ => "https",
        };
        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url = format!("{}?{}", url, canonical_querystring);
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("S3 request to s3://{} failed", self.bucket))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 request failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        Ok(resp)
    }

    fn encode_key(key: &str) -> String {
        key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query_params.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .signed_request(reqwest::Method::GET, "/", &query_params, Vec::new())
                .await?;
            let xml = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml)?;
            keys.extend(batch);

            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let uri = format!("/{}", Self::encode_key(key));
        let resp = self
            .signed_request(reqwest::Method::GET, &uri, &[], Vec::new())
            .await
            .with_context(|| format!("S3 GetObject failed for key '{}'", key))?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let uri = format!("/{}", Self::encode_key(key));
        self.signed_request(reqwest::Method::PUT, &uri, &[], bytes)
            .await
            .with_context(|| format!("S3 PutObject failed for key '{}'", key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let uri = format!("/{}", Self::encode_key(key));
        self.signed_request(reqwest::Method::DELETE, &uri, &[], Vec::new())
            .await
            .with_context(|| format!("S3 DeleteObject failed for key '{}'", key))?;
        Ok(())
    }
}

// ============ AWS SigV4 helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML parsing (minimal, no extra deps) ============

/// Parse a `ListObjectsV2` XML response into object keys plus pagination
/// state (is-truncated flag and continuation token).
fn parse_list_objects_response(xml: &str) -> Result<(Vec<String>, bool, Option<String>)> {
    let mut keys = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        if let Some(end) = remaining[block_start..].find("</Contents>") {
            let block = &remaining[block_start..block_start + end];
            let key = extract_xml_value(block, "Key").unwrap_or_default();
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
            remaining = &remaining[block_start + end + "</Contents>".len()..];
        } else {
            break;
        }
    }

    Ok((keys, is_truncated, next_token))
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    if let Some(start) = xml.find(&open) {
        let value_start = start + open.len();
        if let Some(end) = xml[value_start..].find(&close) {
            return Some(xml[value_start..value_start + end].to_string());
        }
    }
    None
}
