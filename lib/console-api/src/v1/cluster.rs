use chrono::{DateTime, Utc};
use http::Uri;
use rustls_pemfile::{certs, private_key};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufReader;
use thiserror::Error;

use super::MAX_CLUSTER_NAME_LEN;

/// Reasons a set of connection parameters or an admin request is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cluster name must not be empty")]
    EmptyName,

    #[error("cluster name exceeds {MAX_CLUSTER_NAME_LEN} characters: {0}")]
    NameTooLong(String),

    #[error("cluster name must not contain '/', whitespace or control characters: {0:?}")]
    InvalidName(String),

    #[error("host must be an http(s) url: {0}")]
    InvalidHost(String),

    #[error("either a bearer token or a client certificate and key is required")]
    MissingCredentials,

    #[error("client certificate and client key must be provided together")]
    IncompleteClientIdentity,

    #[error("CA certificate is required unless insecure is enabled")]
    MissingCertificateAuthority,

    #[error("{field} is not valid PEM: {reason}")]
    InvalidPem { field: &'static str, reason: String },
}

/// Parameters needed to reach one Kubernetes API server
///
/// PEM material is kept as text, exactly as it is persisted. Secrets are
/// redacted from the `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParameters {
    /// API server URL, e.g. `https://10.0.0.1:6443`
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    /// Skip server certificate verification
    #[serde(default)]
    pub tls_insecure: bool,

    /// PEM-encoded client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_data: Option<String>,

    /// PEM-encoded client private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_data: Option<String>,

    /// PEM-encoded CA bundle used to verify the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_data: Option<String>,
}

impl ConnectionParameters {
    /// Parameters for a host with no credentials attached yet
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_client_identity(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.cert_data = Some(cert.into());
        self.key_data = Some(key.into());
        self
    }

    pub fn with_ca(mut self, ca: impl Into<String>) -> Self {
        self.ca_data = Some(ca.into());
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.tls_insecure = insecure;
        self
    }

    /// Whether a client certificate and key are both present
    pub fn has_client_identity(&self) -> bool {
        self.cert_data.is_some() && self.key_data.is_some()
    }

    /// Check the credential and TLS invariants and the PEM payloads
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_host(&self.host)?;

        if self.cert_data.is_some() != self.key_data.is_some() {
            return Err(ValidationError::IncompleteClientIdentity);
        }
        if self.bearer_token.is_none() && !self.has_client_identity() && !self.tls_insecure {
            return Err(ValidationError::MissingCredentials);
        }
        if self.ca_data.is_none() && !self.tls_insecure {
            return Err(ValidationError::MissingCertificateAuthority);
        }

        if let Some(cert) = &self.cert_data {
            validate_certificates("certData", cert)?;
        }
        if let Some(key) = &self.key_data {
            validate_private_key("keyData", key)?;
        }
        if let Some(ca) = &self.ca_data {
            validate_certificates("caData", ca)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host", &self.host)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("tls_insecure", &self.tls_insecure)
            .field("cert_data", &self.cert_data.is_some())
            .field("key_data", &self.key_data.as_ref().map(|_| "<redacted>"))
            .field("ca_data", &self.ca_data.is_some())
            .finish()
    }
}

fn validate_host(host: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidHost(host.to_string());
    let uri: Uri = host.parse().map_err(|_| invalid())?;

    match uri.scheme_str() {
        Some("https") | Some("http") => {}
        _ => return Err(invalid()),
    }
    match uri.host() {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

fn validate_certificates(field: &'static str, pem: &str) -> Result<(), ValidationError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let parsed = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ValidationError::InvalidPem {
            field,
            reason: e.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(ValidationError::InvalidPem {
            field,
            reason: "no certificate found".to_string(),
        });
    }
    Ok(())
}

fn validate_private_key(field: &'static str, pem: &str) -> Result<(), ValidationError> {
    let mut reader = BufReader::new(pem.as_bytes());
    match private_key(&mut reader) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(ValidationError::InvalidPem {
            field,
            reason: "no private key found".to_string(),
        }),
        Err(e) => Err(ValidationError::InvalidPem {
            field,
            reason: e.to_string(),
        }),
    }
}

/// Check that a dynamic cluster name is usable as a registry key
///
/// Names travel as a single URL path segment, so separators, whitespace and
/// control characters are refused.
pub fn validate_cluster_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.chars().count() > MAX_CLUSTER_NAME_LEN {
        return Err(ValidationError::NameTooLong(name.to_string()));
    }
    if name
        .chars()
        .any(|c| c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// TLS section of an admin request body
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsClientConfig {
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub cert_data: String,
    #[serde(default)]
    pub key_data: String,
    #[serde(default)]
    pub ca_data: String,
}

/// Admin request body for adding or updating a dynamic cluster
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCreate {
    pub cluster_name: String,
    pub host: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default)]
    pub tls_client_config: TlsClientConfig,
}

impl ClusterCreate {
    /// Split the request into its cluster name and validated connection parameters.
    ///
    /// Empty strings are treated as absent values.
    pub fn into_parts(self) -> Result<(String, ConnectionParameters), ValidationError> {
        let name = self.cluster_name.trim().to_string();
        validate_cluster_name(&name)?;

        let params = ConnectionParameters {
            host: self.host.trim().to_string(),
            bearer_token: non_empty(self.bearer_token),
            tls_insecure: self.tls_client_config.insecure,
            cert_data: non_empty(self.tls_client_config.cert_data),
            key_data: non_empty(self.tls_client_config.key_data),
            ca_data: non_empty(self.tls_client_config.ca_data),
        };
        params.validate()?;
        Ok((name, params))
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Read model for one registered cluster
///
/// Credentials are never part of this view.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub host: String,
    pub insecure: bool,
    /// Sourced from local configuration and immutable through the admin API
    #[serde(rename = "static")]
    pub is_static: bool,
    pub version: String,
    pub status: String,
    pub node_count: u32,
    /// When the cluster entered the registry
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<DateTime<Utc>>,
}
