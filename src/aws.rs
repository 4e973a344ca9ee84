//! AWS request plumbing shared by the SQS, SageMaker, OpenSearch and S3
//! clients.
//!
//! Requests are signed with
//! [AWS Signature Version 4](https://docs.aws.amazon.com/IAM/latest/UserGuide/reference_sigv.html)
//! using only pure-Rust dependencies (`hmac`, `sha2`), so there is no
//! dependency on the AWS SDK or `aws-lc-sys`.
//!
//! # Environment Variables
//!
//! Credentials are read from environment variables:
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! # Client recycling
//!
//! Long-running workers hold their HTTP client for hours. [`RecyclingClient`]
//! rebuilds the underlying `reqwest::Client` once it is older than
//! [`DEFAULT_CLIENT_MAX_AGE`], which drops stale pooled connections.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, Url};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type HmacSha256 = Hmac<Sha256>;

/// Clients older than this are rebuilt on next use.
pub const DEFAULT_CLIENT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

// ============ AWS Credentials ============

/// AWS credentials loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
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

// ============ SigV4 Signer ============

/// Signs requests for one AWS service in one region.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(credentials: AwsCredentials, region: &str, service: &str) -> Self {
        Self {
            credentials,
            region: region.to_string(),
            service: service.to_string(),
        }
    }

    /// Compute the headers to attach to a request.
    ///
    /// `headers` are the caller's own headers that should be covered by the
    /// signature (lowercase names). The returned list contains those plus
    /// `x-amz-date`, the session token if any, `x-amz-content-sha256` for S3,
    /// and finally `authorization`.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        canonical_uri: &str,
        canonical_query: &str,
        headers: &[(String, String)],
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut signed: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        if !signed.iter().any(|(k, _)| k == "host") {
            signed.push(("host".to_string(), host.to_string()));
        }
        signed.push(("x-amz-date".to_string(), amz_date.clone()));
        if self.service == "s3" {
            signed.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
        }
        if let Some(ref token) = self.credentials.session_token {
            signed.push(("x-amz-security-token".to_string(), token.clone()));
        }
        signed.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = signed
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = signed
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.credentials.secret_access_key,
            &date_stamp,
            &self.region,
            &self.service,
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        // host is set by reqwest from the URL
        signed.retain(|(k, _)| k != "host");
        signed.push(("authorization".to_string(), authorization));
        signed
    }

    /// Canonical URI for an already percent-encoded `path`. Every service
    /// except S3 encodes each segment a second time.
    pub fn canonical_uri(&self, path: &str) -> String {
        if path.is_empty() {
            return "/".to_string();
        }
        if self.service == "s3" {
            return path.to_string();
        }
        path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
    }

    /// Sign and send a request. `headers` are included in the signature.
    pub async fn send(
        &self,
        client: &reqwest::Client,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
        let host = host_header(&parsed)?;
        let canonical_uri = self.canonical_uri(parsed.path());
        let query: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        let canonical_query = canonical_query_string(&query);

        let all_headers = self.sign(
            method.as_str(),
            &host,
            &canonical_uri,
            &canonical_query,
            headers,
            &body,
            Utc::now(),
        );

        let mut req = client.request(method, parsed);
        for (k, v) in &all_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.body(body).send().await?;
        Ok(resp)
    }
}

/// `host[:port]` as it appears in the `Host` header.
fn host_header(url: &Url) -> Result<String> {
    let Some(host) = url.host_str() else {
        bail!("URL has no host: {}", url);
    };
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Build a SigV4 canonical query string: pairs URI-encoded and sorted.
pub fn canonical_query_string(pairs: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

// ============ Recycling HTTP client ============

/// A `reqwest::Client` that is rebuilt after a maximum age.
pub struct RecyclingClient {
    inner: Mutex<Option<(reqwest::Client, Instant)>>,
    max_age: Duration,
    timeout: Duration,
}

impl RecyclingClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_max_age(timeout, DEFAULT_CLIENT_MAX_AGE)
    }

    pub fn with_max_age(timeout: Duration, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(None),
            max_age,
            timeout,
        }
    }

    /// Current client, creating or recycling it as needed.
    pub fn get(&self) -> Result<reqwest::Client> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((client, created)) = guard.as_ref() {
            if created.elapsed() < self.max_age {
                return Ok(client.clone());
            }
            tracing::debug!("recycling HTTP client");
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        *guard = Some((client.clone(), Instant::now()));
        Ok(client)
    }

    /// Drop the current client; the next [`get`](Self::get) builds a new one.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

// ============ S3 ============

/// Download an object from S3 using a signed GET request.
///
/// `endpoint_url` overrides the virtual-hosted endpoint for S3-compatible
/// services (MinIO, LocalStack); path-style addressing is used then.
pub async fn download_object(
    client: &reqwest::Client,
    credentials: &AwsCredentials,
    region: &str,
    bucket: &str,
    key: &str,
    endpoint_url: Option<&str>,
) -> Result<Vec<u8>> {
    let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
    let url = match endpoint_url {
        Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, encoded_key),
        None => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, region, encoded_key),
    };

    let signer = SigV4Signer::new(credentials.clone(), region, "s3");
    let resp = signer
        .send(client, Method::GET, &url, &[], Vec::new())
        .await
        .with_context(|| format!("Failed to get s3://{}/{}", bucket, key))?;

    if !resp.status().is_success() {
        let status = resp.status();
        bail!("S3 GetObject failed (HTTP {}) for s3://{}/{}", status, bucket, key);
    }

    Ok(resp.bytes().await?.to_vec())
}

/// Split `s3://bucket/key` into its parts.
pub fn parse_s3_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

// ============ AWS SigV4 Helpers ============

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

/// URI-encode a string per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~`.
pub fn uri_encode(s: &str) -> String {
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
