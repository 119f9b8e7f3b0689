//! Envelope transports
//!
//! A [`Transport`] ships one serialized envelope and reports the response
//! status and headers. Rate limiting and retries are handled by the caller.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

use super::envelope::Envelope;

/// Protocol version sent with every request
pub const SENTRY_VERSION: &str = "7";

/// Transport-level failures; these are worth retrying
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Response status and headers (names lowercased)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
}

impl TransportResponse {
    pub fn with_status(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<TransportResponse, TransportError>;
}

/// Parsed DSN: `{scheme}://{public_key}@{host}[:port]/{path/}{project_id}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    host: String,
    port: Option<u16>,
    path: String,
    project_id: String,
    raw: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DsnError {
    #[error("Invalid DSN: {0}")]
    Invalid(String),

    #[error("Invalid DSN: missing {0}")]
    Missing(&'static str),
}

impl Dsn {
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Endpoint for envelope submissions, with auth query parameters
    pub fn envelope_url(&self) -> String {
        let port = self.port.map(|p| format!(":{p}")).unwrap_or_default();
        format!(
            "{}://{}{}{}/api/{}/envelope/?sentry_key={}&sentry_version={}",
            self.scheme, self.host, port, self.path, self.project_id, self.public_key, SENTRY_VERSION
        )
    }
}

impl FromStr for Dsn {
    type Err = DsnError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(raw).map_err(|e| DsnError::Invalid(e.to_string()))?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(DsnError::Invalid(format!("unsupported scheme {scheme}")));
        }
        if url.username().is_empty() {
            return Err(DsnError::Missing("public key"));
        }
        let host = url.host_str().ok_or(DsnError::Missing("host"))?;

        let trimmed = url.path().trim_end_matches('/');
        let (path, project_id) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        if project_id.is_empty() {
            return Err(DsnError::Missing("project id"));
        }
        if !project_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(DsnError::Invalid(format!("project id {project_id} is not numeric")));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            public_key: url.username().to_string(),
            host: host.to_string(),
            port: url.port(),
            path: path.to_string(),
            project_id: project_id.to_string(),
            raw: raw.to_string(),
        })
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// POSTs envelopes over HTTP
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new(dsn: &Dsn) -> Self {
        Self::with_url(dsn.envelope_url())
    }

    /// Send everything to a tunnel endpoint instead of the DSN host
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: Envelope) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-sentry-envelope")
            .body(envelope.serialize())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    TransportError::Http(e.to_string())
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Ok(TransportResponse {
            status_code: Some(response.status().as_u16()),
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dsn() {
        let dsn: Dsn = "https://abc123@o1.ingest.example.com/42".parse().unwrap();
        assert_eq!(dsn.public_key(), "abc123");
        assert_eq!(dsn.project_id(), "42");
        assert_eq!(
            dsn.envelope_url(),
            "https://o1.ingest.example.com/api/42/envelope/?sentry_key=abc123&sentry_version=7"
        );
    }

    #[test]
    fn test_parse_dsn_with_port_and_path() {
        let dsn: Dsn = "http://key@localhost:9000/sub/path/7".parse().unwrap();
        assert_eq!(
            dsn.envelope_url(),
            "http://localhost:9000/sub/path/api/7/envelope/?sentry_key=key&sentry_version=7"
        );
        assert_eq!(dsn.to_string(), "http://key@localhost:9000/sub/path/7");
    }

    #[test]
    fn test_invalid_dsns() {
        assert_eq!(
            "https://host/42".parse::<Dsn>(),
            Err(DsnError::Missing("public key"))
        );
        assert_eq!(
            "https://key@host/".parse::<Dsn>(),
            Err(DsnError::Missing("project id"))
        );
        assert!("ftp://key@host/1".parse::<Dsn>().is_err());
        assert!("not a dsn".parse::<Dsn>().is_err());
    }

    #[test]
    fn test_response_headers_are_lowercased() {
        let response = TransportResponse::with_status(200).with_header("Retry-After", "10");
        assert_eq!(response.header("retry-after"), Some("10"));
    }
}
