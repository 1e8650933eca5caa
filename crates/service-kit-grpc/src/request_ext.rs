//! Request extension trait for easy metadata access.

use std::collections::HashMap;

use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Status};

use crate::error::GrpcError;

/// A type-safe header key.
///
/// Use predefined constants from the [`headers`] module for common headers,
/// or create custom keys with [`HeaderKey::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderKey(&'static str);

impl HeaderKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

/// Common header keys for gRPC requests.
pub mod headers {
    use super::HeaderKey;

    // Standard HTTP
    pub const AUTHORIZATION: HeaderKey = HeaderKey::new("authorization");
    pub const CONTENT_TYPE: HeaderKey = HeaderKey::new("content-type");
    pub const USER_AGENT: HeaderKey = HeaderKey::new("user-agent");
    pub const ACCEPT_LANGUAGE: HeaderKey = HeaderKey::new("accept-language");

    // gRPC-specific
    pub const GRPC_TIMEOUT: HeaderKey = HeaderKey::new("grpc-timeout");
    pub const GRPC_ENCODING: HeaderKey = HeaderKey::new("grpc-encoding");
    pub const GRPC_ACCEPT_ENCODING: HeaderKey = HeaderKey::new("grpc-accept-encoding");

    // Request Tracking
    pub const REQUEST_ID: HeaderKey = HeaderKey::new("x-request-id");
    pub const CORRELATION_ID: HeaderKey = HeaderKey::new("x-correlation-id");

    // W3C Trace Context
    pub const TRACEPARENT: HeaderKey = HeaderKey::new("traceparent");
    pub const TRACESTATE: HeaderKey = HeaderKey::new("tracestate");

    // B3 (Zipkin)
    pub const B3_TRACE_ID: HeaderKey = HeaderKey::new("x-b3-traceid");
    pub const B3_SPAN_ID: HeaderKey = HeaderKey::new("x-b3-spanid");
    pub const B3_PARENT_SPAN_ID: HeaderKey = HeaderKey::new("x-b3-parentspanid");
    pub const B3_SAMPLED: HeaderKey = HeaderKey::new("x-b3-sampled");
    pub const B3: HeaderKey = HeaderKey::new("b3");

    // Proxy
    pub const X_FORWARDED_FOR: HeaderKey = HeaderKey::new("x-forwarded-for");
    pub const X_FORWARDED_HOST: HeaderKey = HeaderKey::new("x-forwarded-host");
    pub const X_FORWARDED_PROTO: HeaderKey = HeaderKey::new("x-forwarded-proto");
    pub const X_REAL_IP: HeaderKey = HeaderKey::new("x-real-ip");

    // Authentication & Identity
    pub const API_KEY: HeaderKey = HeaderKey::new("x-api-key");
    pub const CLIENT_ID: HeaderKey = HeaderKey::new("x-client-id");
    pub const TENANT_ID: HeaderKey = HeaderKey::new("x-tenant-id");

    // Idempotency
    pub const IDEMPOTENCY_KEY: HeaderKey = HeaderKey::new("idempotency-key");
}

/// What went wrong reading a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderErrorKind {
    /// The header has no values.
    Missing,
    /// A value is not printable ASCII.
    Invalid,
}

/// A header that could not be read. Maps to `INVALID_ARGUMENT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderError {
    kind: HeaderErrorKind,
    key: String,
    message: String,
}

impl HeaderError {
    fn missing(key: &str) -> Self {
        Self {
            kind: HeaderErrorKind::Missing,
            key: key.to_string(),
            message: format!("no {key}"),
        }
    }

    fn invalid(key: &str) -> Self {
        Self {
            kind: HeaderErrorKind::Invalid,
            key: key.to_string(),
            message: format!("invalid value for {key}"),
        }
    }

    fn in_batch(self) -> Self {
        let message = format!("unable to retrieve header={}: {}", self.key, self.message);
        Self { message, ..self }
    }

    pub fn kind(&self) -> HeaderErrorKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HeaderError {}

impl GrpcError for HeaderError {
    fn code(&self) -> Code {
        Code::InvalidArgument
    }

    fn message(&self) -> &str {
        &self.message
    }
}

impl From<HeaderError> for Status {
    fn from(err: HeaderError) -> Self {
        err.into_status()
    }
}

/// Every value of `key`, in the order they were stored.
///
/// A header sent with an empty value is present; only a header with no
/// values at all is [`HeaderErrorKind::Missing`]. Values of binary (`-bin`)
/// headers are returned base64-encoded, as they travel on the wire.
pub fn get_header(metadata: &MetadataMap, key: &str) -> Result<Vec<String>, HeaderError> {
    let values = if key.ends_with("-bin") {
        metadata
            .get_all_bin(key)
            .iter()
            .map(|value| {
                value.to_bytes().map_err(|_| HeaderError::invalid(key))?;
                String::from_utf8(value.as_encoded_bytes().to_vec())
                    .map_err(|_| HeaderError::invalid(key))
            })
            .collect::<Result<Vec<_>, _>>()?
    } else {
        metadata
            .get_all(key)
            .iter()
            .map(|value| {
                value
                    .to_str()
                    .map(str::to_string)
                    .map_err(|_| HeaderError::invalid(key))
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    if values.is_empty() {
        return Err(HeaderError::missing(key));
    }
    Ok(values)
}

/// Values of every header in `keys`, or the error for the first one that
/// cannot be read.
pub fn get_headers<'k>(
    metadata: &MetadataMap,
    keys: impl IntoIterator<Item = &'k str>,
) -> Result<HashMap<String, Vec<String>>, HeaderError> {
    keys.into_iter()
        .map(|key| {
            get_header(metadata, key)
                .map(|values| (key.to_string(), values))
                .map_err(HeaderError::in_batch)
        })
        .collect()
}

/// Extension trait for `tonic::Request<T>`.
///
/// Provides type-safe header access using [`HeaderKey`] constants.
pub trait RequestExt<T> {
    /// Get a header value using a type-safe [`HeaderKey`].
    fn header(&self, key: HeaderKey) -> Option<&str>;

    /// See [`get_header`].
    fn get_header(&self, key: &str) -> Result<Vec<String>, HeaderError>;

    /// See [`get_headers`].
    fn get_headers<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Result<HashMap<String, Vec<String>>, HeaderError>;
}

impl<T> RequestExt<T> for Request<T> {
    fn header(&self, key: HeaderKey) -> Option<&str> {
        self.metadata()
            .get(key.as_str())
            .and_then(|v| v.to_str().ok())
    }

    fn get_header(&self, key: &str) -> Result<Vec<String>, HeaderError> {
        get_header(self.metadata(), key)
    }

    fn get_headers<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Result<HashMap<String, Vec<String>>, HeaderError> {
        get_headers(self.metadata(), keys)
    }
}
