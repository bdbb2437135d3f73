// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! S3-compatible object storage driver (AWS, MinIO, Ceph RGW...).
//!
//! Requests are signed with AWS Signature Version 4 over a plain `reqwest`
//! client. Credentials resolve in order:
//!
//! ```text
//! static keys in the unit config
//!   → named profile in ~/.aws/credentials
//!   → AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY / AWS_SESSION_TOKEN
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::traits::{ObjectStore, StorageError};
use crate::config::S3Config;

type HmacSha256 = Hmac<Sha256>;

const EMPTY_PAYLOAD_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

struct Credentials {
    access_key_id: String,
    secret_access_key: Zeroizing<String>,
    session_token: Option<String>,
}

pub struct S3Store {
    client: reqwest::Client,
    bucket: String,
    region: String,
    prefix: String,
    /// Scheme + authority without bucket, e.g. `https://s3.eu-west-1.amazonaws.com`
    endpoint: Url,
    path_style: bool,
    credentials: Credentials,
}

fn http_err(e: reqwest::Error) -> StorageError {
    StorageError::Backend(format!("s3: {}", e))
}

impl S3Store {
    /// Build the client and check the bucket is reachable with these credentials.
    pub async fn init(config: &S3Config) -> Result<Self, StorageError> {
        let store = Self::new(config)?;
        let url = store.bucket_url()?;
        let response = store.send(Method::HEAD, url, Bytes::new()).await?;
        match response.status() {
            s if s.is_success() => {
                debug!(bucket = %store.bucket, region = %store.region, "S3 bucket reachable");
                Ok(store)
            }
            StatusCode::NOT_FOUND => Err(StorageError::Backend(format!("s3: bucket '{}' does not exist", store.bucket))),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                Err(StorageError::Forbidden(format!("s3: access to bucket '{}' denied", store.bucket)))
            }
            s => Err(StorageError::Backend(format!("s3: bucket check returned {}", s))),
        }
    }

    /// Build without contacting the backend.
    pub fn new(config: &S3Config) -> Result<Self, StorageError> {
        if config.bucket.is_empty() {
            return Err(StorageError::InvalidData("s3 unit requires a bucket".into()));
        }
        let endpoint = match &config.endpoint {
            Some(e) => e.clone(),
            None => format!("https://s3.{}.amazonaws.com", config.region),
        };
        let endpoint = Url::parse(&endpoint).map_err(|e| StorageError::InvalidData(format!("s3 endpoint: {}", e)))?;
        if endpoint.host_str().is_none() {
            return Err(StorageError::InvalidData("s3 endpoint has no host".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(http_err)?;

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            endpoint,
            path_style: config.force_path_style,
            credentials: resolve_credentials(config)?,
        })
    }

    fn authority(url: &Url) -> String {
        match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            _ => String::new(),
        }
    }

    fn object_path(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// URL and canonical URI for a bucket-relative path.
    fn url_for(&self, path: &str) -> Result<(Url, String), StorageError> {
        let encoded = uri_encode(path, false);
        let (base, canonical) = if self.path_style {
            let canonical = if path.is_empty() {
                format!("/{}", uri_encode(&self.bucket, true))
            } else {
                format!("/{}/{}", uri_encode(&self.bucket, true), encoded)
            };
            (self.endpoint.clone(), canonical)
        } else {
            let mut base = self.endpoint.clone();
            let host = format!("{}.{}", self.bucket, self.endpoint.host_str().unwrap_or_default());
            base.set_host(Some(&host)).map_err(|e| StorageError::InvalidData(format!("s3 host: {}", e)))?;
            (base, format!("/{}", encoded))
        };
        let url = base
            .join(&canonical)
            .map_err(|e| StorageError::InvalidData(format!("s3 url: {}", e)))?;
        Ok((url, canonical))
    }

    fn bucket_url(&self) -> Result<(Url, String), StorageError> {
        self.url_for("")
    }

    async fn send(&self, method: Method, url: (Url, String), body: Bytes) -> Result<reqwest::Response, StorageError> {
        let (url, canonical_uri) = url;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let payload_hash = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            hex::encode(Sha256::digest(&body))
        };
        let headers = self.sign(method.as_str(), &Self::authority(&url), &canonical_uri, &payload_hash, now)?;

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }
        request.send().await.map_err(http_err)
    }

    /// SigV4 headers for a request without query string.
    fn sign(&self, method: &str, host: &str, canonical_uri: &str, payload_hash: &str, now_secs: u64) -> Result<Vec<(&'static str, String)>, StorageError> {
        let (date, timestamp) = amz_timestamps(now_secs);

        let mut canonical: Vec<(&str, String)> = vec![
            ("host", host.to_string()),
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("x-amz-date", timestamp.clone()),
        ];
        if let Some(token) = &self.credentials.session_token {
            canonical.push(("x-amz-security-token", token.clone()));
        }
        let signed_headers = canonical.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(";");
        let canonical_headers: String = canonical.iter().map(|(n, v)| format!("{}:{}\n", n, v.trim())).collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, canonical_uri, canonical_headers, signed_headers, payload_hash
        );
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let secret = Zeroizing::new(format!("AWS4{}", self.credentials.secret_access_key.as_str()));
        let date_key = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        let region_key = hmac_sha256(&date_key, self.region.as_bytes())?;
        let service_key = hmac_sha256(&region_key, b"s3")?;
        let signing_key = hmac_sha256(&service_key, b"aws4_request")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let mut headers = vec![
            (
                "authorization",
                format!(
                    "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                    self.credentials.access_key_id, scope, signed_headers, signature
                ),
            ),
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("x-amz-date", timestamp),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        Ok(headers)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn driver(&self) -> &'static str {
        "s3"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let url = self.url_for(&self.object_path(key))?;
        let response = self.send(Method::HEAD, url, Bytes::new()).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Backend(format!("s3: HEAD {} returned {}", key, s))),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let url = self.url_for(&self.object_path(key))?;
        let response = self.send(Method::PUT, url, data).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(key, %status, "S3 PUT failed");
            Err(StorageError::Backend(format!("s3: PUT {} returned {}: {}", key, status, body)))
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let url = self.url_for(&self.object_path(key))?;
        let response = self.send(Method::GET, url, Bytes::new()).await?;
        match response.status() {
            s if s.is_success() => response.bytes().await.map_err(http_err),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound),
            s => Err(StorageError::Backend(format!("s3: GET {} returned {}", key, s))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let url = self.url_for(&self.object_path(key))?;
        let response = self.send(Method::DELETE, url, Bytes::new()).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => Err(StorageError::Backend(format!("s3: DELETE {} returned {}", key, s))),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| StorageError::Crypto(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// RFC 3986 encoding as SigV4 wants it. `/` is kept unless `encode_slash`.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// (`YYYYMMDD`, `YYYYMMDDTHHMMSSZ`) for a unix timestamp.
fn amz_timestamps(secs: u64) -> (String, String) {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    let date = format!("{:04}{:02}{:02}", y, m, d);
    let timestamp = format!("{}T{:02}{:02}{:02}Z", date, rem / 3600, (rem % 3600) / 60, rem % 60);
    (date, timestamp)
}

/// Proleptic Gregorian date for days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

fn resolve_credentials(config: &S3Config) -> Result<Credentials, StorageError> {
    if let (Some(ak), Some(sk)) = (&config.access_key_id, &config.secret_access_key) {
        return Ok(Credentials {
            access_key_id: ak.clone(),
            secret_access_key: Zeroizing::new(sk.clone()),
            session_token: config.session_token.clone(),
        });
    }

    if let Some(profile) = &config.profile {
        let path = std::env::var("AWS_SHARED_CREDENTIALS_FILE").ok().or_else(|| {
            std::env::var("HOME").ok().map(|home| format!("{}/.aws/credentials", home))
        });
        if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| StorageError::InvalidData(format!("cannot read {}: {}", path, e)))?;
            return parse_credentials_file(&content, profile)
                .ok_or_else(|| StorageError::InvalidData(format!("profile '{}' not found in {}", profile, path)));
        }
    }

    match (std::env::var("AWS_ACCESS_KEY_ID"), std::env::var("AWS_SECRET_ACCESS_KEY")) {
        (Ok(ak), Ok(sk)) => Ok(Credentials {
            access_key_id: ak,
            secret_access_key: Zeroizing::new(sk),
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        }),
        _ => Err(StorageError::InvalidData("s3 unit has no credentials".into())),
    }
}

/// Read one `[profile]` section of an AWS shared-credentials file.
fn parse_credentials_file(content: &str, profile: &str) -> Option<Credentials> {
    let mut in_section = false;
    let mut ak = None;
    let mut sk = None;
    let mut token = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == profile;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().to_string();
            match k.trim() {
                "aws_access_key_id" => ak = Some(v),
                "aws_secret_access_key" => sk = Some(v),
                "aws_session_token" => token = Some(v),
                _ => {}
            }
        }
    }

    Some(Credentials {
        access_key_id: ak?,
        secret_access_key: Zeroizing::new(sk?),
        session_token: token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path_style: bool) -> S3Config {
        S3Config {
            bucket: "logs".into(),
            region: "eu-west-1".into(),
            prefix: "/cdn/".into(),
            endpoint: Some("http://minio:9000".into()),
            force_path_style: path_style,
            access_key_id: Some("AKID".into()),
            secret_access_key: Some("secret".into()),
            session_token: None,
            profile: None,
        }
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(amz_timestamps(0), ("19700101".to_string(), "19700101T000000Z".to_string()));
        assert_eq!(amz_timestamps(1_700_000_000).1, "20231114T221320Z");
        assert_eq!(amz_timestamps(951_782_400).0, "20000229");
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b/c~d", false), "a%20b/c~d");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
    }

    #[test]
    fn test_path_style_url() {
        let store = S3Store::new(&config(true)).unwrap();
        let (url, canonical) = store.url_for(&store.object_path("abc")).unwrap();
        assert_eq!(url.as_str(), "http://minio:9000/logs/cdn/abc");
        assert_eq!(canonical, "/logs/cdn/abc");
        assert_eq!(S3Store::authority(&url), "minio:9000");
    }

    #[test]
    fn test_virtual_host_url() {
        let store = S3Store::new(&config(false)).unwrap();
        let (url, canonical) = store.url_for(&store.object_path("abc")).unwrap();
        assert_eq!(url.as_str(), "http://logs.minio:9000/cdn/abc");
        assert_eq!(canonical, "/cdn/abc");
    }

    #[test]
    fn test_signature_is_deterministic_and_scoped() {
        let store = S3Store::new(&config(true)).unwrap();
        let a = store.sign("GET", "minio:9000", "/logs/x", EMPTY_PAYLOAD_SHA256, 1_700_000_000).unwrap();
        let b = store.sign("GET", "minio:9000", "/logs/x", EMPTY_PAYLOAD_SHA256, 1_700_000_000).unwrap();
        let c = store.sign("PUT", "minio:9000", "/logs/x", EMPTY_PAYLOAD_SHA256, 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert_ne!(a[0].1, c[0].1);
        assert!(a[0].1.starts_with("AWS4-HMAC-SHA256 Credential=AKID/20231114/eu-west-1/s3/aws4_request"));
        assert!(a[0].1.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date,"));
    }

    #[test]
    fn test_parse_credentials_profile() {
        let content = "[default]\naws_access_key_id = A\naws_secret_access_key = B\n\n[ci]\naws_access_key_id=C\naws_secret_access_key=D\naws_session_token=T\n";
        let creds = parse_credentials_file(content, "ci").unwrap();
        assert_eq!(creds.access_key_id, "C");
        assert_eq!(creds.secret_access_key.as_str(), "D");
        assert_eq!(creds.session_token.as_deref(), Some("T"));
        assert!(parse_credentials_file(content, "missing").is_none());
    }

    #[test]
    fn test_missing_bucket_rejected() {
        let mut c = config(true);
        c.bucket = String::new();
        assert!(S3Store::new(&c).is_err());
    }
}
