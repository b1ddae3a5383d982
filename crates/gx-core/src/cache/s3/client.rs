//! Minimal S3 client with SigV4 request signing.
//!
//! Implements just what the cache backend needs: bucket head/create, object
//! get/head/put/delete, and paginated list-type=2 listings. Canonical
//! request construction follows the AWS rules: path segments are escaped
//! individually, query parameters are sorted and AWS-encoded, and the
//! signed headers are `host` plus every `x-amz-*` header, lowercased with
//! collapsed whitespace.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use hmac::{Hmac, Mac};
use reqwest::blocking::{Body, Client, Response};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::config::S3CacheConfig;
use crate::errors::{Error, Result};

pub const EMPTY_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

type HmacSha256 = Hmac<Sha256>;

pub struct S3Client {
    cfg: S3CacheConfig,
    http: Client,
}

/// Payload for a PUT request.
pub enum PutBody {
    Empty,
    Bytes(Vec<u8>),
    File(PathBuf, u64),
}

impl S3Client {
    pub fn new(mut cfg: S3CacheConfig, http: Client) -> Result<Self> {
        if cfg.bucket.is_empty() {
            return Err(Error::S3EmptyCreds);
        }
        if cfg.region.is_empty() {
            cfg.region = "us-east-1".to_string();
        }
        let mut endpoint = if cfg.endpoint.is_empty() {
            format!("https://s3.{}.amazonaws.com", cfg.region)
        } else {
            cfg.endpoint.clone()
        };
        if !endpoint.contains("://") {
            endpoint = format!("https://{endpoint}");
        }
        let parsed = url::Url::parse(&endpoint)
            .map_err(|_| Error::S3InvalidEndpoint(endpoint.clone()))?;
        if parsed.host_str().unwrap_or("").is_empty() {
            return Err(Error::S3InvalidEndpoint(endpoint));
        }
        cfg.endpoint = endpoint.trim_end_matches('/').to_string();
        Ok(Self { cfg, http })
    }

    pub fn get_object(&self, key: &str) -> Result<Response> {
        let response = self.send(
            Method::GET,
            key,
            &[],
            PutBody::Empty,
            EMPTY_SHA256,
            &BTreeMap::new(),
            false,
            "",
            "",
        )?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::S3NotFound),
            StatusCode::OK => Ok(response),
            status => Err(Error::S3GetFailed(status.to_string())),
        }
    }

    pub fn head_object(&self, key: &str) -> Result<HeaderMap> {
        let response = self.send(
            Method::HEAD,
            key,
            &[],
            PutBody::Empty,
            EMPTY_SHA256,
            &BTreeMap::new(),
            false,
            "",
            "",
        )?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::S3NotFound),
            StatusCode::OK => Ok(response.headers().clone()),
            status => Err(Error::S3HeadFailed(status.to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn put_object(
        &self,
        key: &str,
        body: PutBody,
        content_type: &str,
        content_encoding: &str,
        meta: &BTreeMap<String, String>,
        if_none_match: bool,
        payload_hash: &str,
    ) -> Result<()> {
        let payload_hash = resolve_payload_hash(&body, payload_hash)?;
        let response = self.send(
            Method::PUT,
            key,
            &[],
            body,
            &payload_hash,
            meta,
            if_none_match,
            content_type,
            content_encoding,
        )?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(Error::S3PreconditionFailed),
            StatusCode::NOT_FOUND => Err(Error::S3BucketNotFound),
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::S3PutFailed(status.to_string())),
        }
    }

    pub fn delete_object(&self, key: &str) -> Result<()> {
        let response = self.send(
            Method::DELETE,
            key,
            &[],
            PutBody::Empty,
            EMPTY_SHA256,
            &BTreeMap::new(),
            false,
            "",
            "",
        )?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            status => Err(Error::S3DeleteFailed(status.to_string())),
        }
    }

    /// Returns every object key under the given prefix.
    pub fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token = String::new();
        loop {
            let mut query = vec![("list-type".to_string(), "2".to_string())];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if !token.is_empty() {
                query.push(("continuation-token".to_string(), token.clone()));
            }
            let response = self.send(
                Method::GET,
                "",
                &query,
                PutBody::Empty,
                EMPTY_SHA256,
                &BTreeMap::new(),
                false,
                "",
                "",
            )?;
            match response.status() {
                StatusCode::NOT_FOUND => return Err(Error::S3BucketNotFound),
                StatusCode::OK => {}
                status => return Err(Error::S3GetFailed(status.to_string())),
            }
            let body = response.text()?;
            keys.extend(extract_tag_values(&body, "Key"));
            let truncated = body.contains("<IsTruncated>true</IsTruncated>");
            token = extract_tag_values(&body, "NextContinuationToken")
                .into_iter()
                .next()
                .unwrap_or_default();
            if !truncated || token.is_empty() {
                return Ok(keys);
            }
        }
    }

    /// Creates the bucket when it does not exist yet.
    pub fn ensure_bucket(&self) -> Result<()> {
        match self.head_bucket() {
            Ok(()) => Ok(()),
            Err(Error::S3BucketNotFound) => self.create_bucket(),
            Err(err) => Err(err),
        }
    }

    fn head_bucket(&self) -> Result<()> {
        let response = self.send(
            Method::HEAD,
            "",
            &[],
            PutBody::Empty,
            EMPTY_SHA256,
            &BTreeMap::new(),
            false,
            "",
            "",
        )?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::S3BucketNotFound),
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::S3BucketHeadFailed(status.to_string())),
        }
    }

    fn create_bucket(&self) -> Result<()> {
        let (body, content_type, payload_hash) =
            if !self.cfg.region.is_empty() && self.cfg.region != "us-east-1" {
                let payload = format!(
                    "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                     <LocationConstraint>{}</LocationConstraint>\
                     </CreateBucketConfiguration>",
                    self.cfg.region
                );
                let hash = hex::encode(Sha256::digest(payload.as_bytes()));
                (
                    PutBody::Bytes(payload.into_bytes()),
                    "application/xml",
                    hash,
                )
            } else {
                (PutBody::Empty, "", EMPTY_SHA256.to_string())
            };
        let response = self.send(
            Method::PUT,
            "",
            &[],
            body,
            &payload_hash,
            &BTreeMap::new(),
            false,
            content_type,
            "",
        )?;
        match response.status() {
            StatusCode::CONFLICT | StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::S3CreateBucketFailed(status.to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        body: PutBody,
        payload_hash: &str,
        meta: &BTreeMap<String, String>,
        if_none_match: bool,
        content_type: &str,
        content_encoding: &str,
    ) -> Result<Response> {
        let (req_url, host, canonical_uri, canonical_query) = self.request_url(key, query);
        let amz_date = amz_date_now();

        let mut amz_headers: BTreeMap<String, String> = BTreeMap::new();
        amz_headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        amz_headers.insert("x-amz-date".to_string(), amz_date.clone());
        if !self.cfg.session_token.is_empty() {
            amz_headers.insert(
                "x-amz-security-token".to_string(),
                self.cfg.session_token.clone(),
            );
        }
        for (name, value) in meta {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                continue;
            }
            amz_headers.insert(
                format!("x-amz-meta-{}", name.trim().to_lowercase()),
                trimmed.to_string(),
            );
        }

        let (canonical_headers, signed_headers) = canonicalize_headers(&host, &amz_headers);
        let authorization = self.sign_request(
            method.as_str(),
            &canonical_uri,
            &canonical_query,
            &amz_date,
            payload_hash,
            &canonical_headers,
            &signed_headers,
        );

        let mut request = self.http.request(method, &req_url);
        for (name, value) in &amz_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if if_none_match {
            request = request.header("If-None-Match", "*");
        }
        if !content_type.is_empty() {
            request = request.header("Content-Type", content_type);
        }
        if !content_encoding.is_empty() {
            request = request.header("Content-Encoding", content_encoding);
        }
        request = request.header("Authorization", authorization);
        request = match body {
            PutBody::Empty => request,
            PutBody::Bytes(bytes) => request.body(bytes),
            PutBody::File(path, size) => request.body(Body::sized(File::open(path)?, size)),
        };
        Ok(request.send()?)
    }

    fn request_url(&self, key: &str, query: &[(String, String)]) -> (String, String, String, String) {
        let parsed = url::Url::parse(&self.cfg.endpoint).expect("endpoint validated in new");
        let mut host = parsed.host_str().unwrap_or("").to_string();
        if let Some(port) = parsed.port() {
            host = format!("{host}:{port}");
        }
        let key = key.trim_start_matches('/');

        let object_path = if self.cfg.path_style {
            if key.is_empty() {
                format!("/{}", self.cfg.bucket)
            } else {
                format!("/{}/{}", self.cfg.bucket, key)
            }
        } else {
            host = format!("{}.{}", self.cfg.bucket, host);
            format!("/{key}")
        };

        let canonical_uri = encode_path(&object_path);
        let canonical_query = canonicalize_query(query);
        let mut req_url = if self.cfg.path_style {
            format!("{}{}", self.cfg.endpoint, object_path)
        } else {
            format!("{}://{}{}", parsed.scheme(), host, object_path)
        };
        if !canonical_query.is_empty() {
            req_url = format!("{req_url}?{canonical_query}");
        }
        (req_url, host, canonical_uri, canonical_query)
    }

    #[allow(clippy::too_many_arguments)]
    fn sign_request(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        amz_date: &str,
        payload_hash: &str,
        canonical_headers: &str,
        signed_headers: &str,
    ) -> String {
        let date = &amz_date[..8];
        let scope = format!("{date}/{}/s3/aws4_request", self.cfg.region);
        let canonical_request = [
            method,
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash,
        ]
        .join("\n");
        let hashed_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = [
            "AWS4-HMAC-SHA256",
            amz_date,
            &scope,
            &hashed_request,
        ]
        .join("\n");

        let signing_key = derive_signing_key(&self.cfg.secret_key, date, &self.cfg.region);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.cfg.access_key
        )
    }
}

fn resolve_payload_hash(body: &PutBody, payload_hash: &str) -> Result<String> {
    if !payload_hash.is_empty() {
        return Ok(payload_hash.to_string());
    }
    match body {
        PutBody::Empty => Ok(EMPTY_SHA256.to_string()),
        PutBody::Bytes(bytes) => Ok(hex::encode(Sha256::digest(bytes))),
        PutBody::File(path, _) => Ok(gx_archive::file_hash_sha256(path)?),
    }
}

fn amz_date_now() -> String {
    let format = format_description!("[year][month][day]T[hour][minute][second]Z");
    OffsetDateTime::now_utc()
        .format(&format)
        .expect("amz date format is valid")
}

fn canonicalize_headers(host: &str, amz_headers: &BTreeMap<String, String>) -> (String, String) {
    let mut entries: BTreeMap<String, String> = BTreeMap::new();
    entries.insert("host".to_string(), collapse_whitespace(host));
    for (name, value) in amz_headers {
        entries.insert(name.to_lowercase(), collapse_whitespace(value));
    }
    let mut canonical = String::new();
    for (name, value) in &entries {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(value);
        canonical.push('\n');
    }
    let signed = entries.keys().cloned().collect::<Vec<_>>().join(";");
    (canonical, signed)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonicalize_query(values: &[(String, String)]) -> String {
    if values.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(String, String)> = values
        .iter()
        .map(|(key, value)| (aws_encode(key), aws_encode(value)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn aws_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn encode_path(value: &str) -> String {
    if value.is_empty() {
        return "/".to_string();
    }
    value
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Extracts user metadata from S3 response headers.
pub fn meta_from_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_lowercase();
        let Some(key) = lower.strip_prefix("x-amz-meta-") else {
            continue;
        };
        if let Ok(value) = value.to_str() {
            meta.insert(key.to_string(), value.trim().to_string());
        }
    }
    meta
}

fn extract_tag_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else {
            break;
        };
        out.push(xml_unescape(&rest[..end]));
        rest = &rest[end + close.len()..];
    }
    out
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
