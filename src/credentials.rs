//! Credential store
//!
//! Connection parameters per source, loaded once at startup and shared
//! read-only between pipelines. Secrets never appear in `Debug` output
//! and are never serialized.

use crate::error::{BeatError, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A secret string that redacts itself from debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value (only for building requests)
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(d).map(Secret)
    }
}

/// TLS settings for the upstream connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    /// Skip certificate verification (test systems with self-signed certs)
    pub accept_invalid_certs: bool,

    /// Additional PEM-encoded CA bundle
    pub ca_cert_path: Option<PathBuf>,
}

/// Connection parameters for one SAP system/client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Audit endpoint URL on the SAP host (may already carry query parameters)
    pub url: String,

    /// SAP client number (sent as `sap-client`)
    #[serde(default)]
    pub client: Option<String>,

    /// Technical user
    pub username: String,

    /// Password for basic authentication
    pub secret: Secret,

    /// HTTP(S) proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub tls: TlsSettings,
}

impl Credentials {
    /// Check that the mandatory fields are present
    pub fn validate(&self, source_id: &str) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(BeatError::Config(format!(
                "Source '{}': credentials.url is empty",
                source_id
            )));
        }
        if self.username.trim().is_empty() {
            return Err(BeatError::Config(format!(
                "Source '{}': credentials.username is empty",
                source_id
            )));
        }
        Ok(())
    }
}

/// Read-only credentials keyed by source id
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: HashMap<String, Arc<Credentials>>,
}

impl CredentialStore {
    /// Build a store from (source id, credentials) pairs
    pub fn new(entries: impl IntoIterator<Item = (String, Credentials)>) -> Result<Self> {
        let mut map = HashMap::new();
        for (source_id, credentials) in entries {
            credentials.validate(&source_id)?;
            if map.insert(source_id.clone(), Arc::new(credentials)).is_some() {
                return Err(BeatError::Config(format!(
                    "Duplicate credentials for source '{}'",
                    source_id
                )));
            }
        }
        tracing::debug!(sources = map.len(), "Credentials loaded");
        Ok(Self { entries: map })
    }

    /// Credentials for a source
    pub fn get(&self, source_id: &str) -> Result<Arc<Credentials>> {
        self.entries
            .get(source_id)
            .cloned()
            .ok_or_else(|| BeatError::NotFound(format!("Credentials for source '{}'", source_id)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credentials {
        Credentials {
            url: "https://sap.example.com/sap/bc/audit?format=json".to_string(),
            client: Some("100".to_string()),
            username: "AUDITREADER".to_string(),
            secret: Secret::new("hunter2"),
            proxy: None,
            tls: TlsSettings::default(),
        }
    }

    #[test]
    fn test_secret_redacted_in_debug() {
        let creds = sample();
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("Secret(***)"));
        assert_eq!(creds.secret.expose(), "hunter2");
    }

    #[test]
    fn test_credentials_deserialize() {
        let json = r#"{
            "url": "https://sap.example.com/audit",
            "username": "AUDITREADER",
            "secret": "s3cret",
            "tls": {"acceptInvalidCerts": true}
        }"#;
        let creds: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.username, "AUDITREADER");
        assert_eq!(creds.secret.expose(), "s3cret");
        assert!(creds.client.is_none());
        assert!(creds.tls.accept_invalid_certs);
        assert!(creds.tls.ca_cert_path.is_none());
    }

    #[test]
    fn test_store_get() {
        let store = CredentialStore::new(vec![("PRD-100".to_string(), sample())]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("PRD-100").unwrap().username, "AUDITREADER");
        assert!(matches!(store.get("QAS-200"), Err(BeatError::NotFound(_))));
    }

    #[test]
    fn test_store_rejects_duplicates() {
        let result = CredentialStore::new(vec![
            ("PRD-100".to_string(), sample()),
            ("PRD-100".to_string(), sample()),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_store_rejects_empty_username() {
        let mut creds = sample();
        creds.username = " ".to_string();
        let result = CredentialStore::new(vec![("PRD-100".to_string(), creds)]);
        assert!(matches!(result, Err(BeatError::Config(_))));
    }
}
