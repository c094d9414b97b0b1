//! mlab-ns server directory client.
//!
//! mlab-ns returns nearby NDT servers by policy. The directory is a trait
//! so tests (and embedders with their own fleet) can inject a fixed list.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ErrKind, Error, Result};

/// Server-selection policy understood by mlab-ns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MlabnsPolicy {
    /// The single geographically closest server.
    Closest,
    /// A single random server.
    Random,
    /// A list of nearby servers; the most robust to individual server
    /// failure, and the default.
    #[default]
    GeoOptions,
}

impl MlabnsPolicy {
    /// The query-string value for this policy.
    pub fn as_str(self) -> &'static str {
        match self {
            MlabnsPolicy::Closest => "closest",
            MlabnsPolicy::Random => "random",
            MlabnsPolicy::GeoOptions => "geo_options",
        }
    }
}

/// Source of candidate NDT server hostnames.
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// Return candidate hostnames, most preferred first.
    async fn nearby(&self, policy: MlabnsPolicy) -> Result<Vec<String>>;
}

/// A single server entry in a mlab-ns response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct MlabnsEntry {
    fqdn: String,
}

/// mlab-ns answers with a bare object for `closest`/`random` and with an
/// array for `geo_options`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MlabnsResponse {
    Many(Vec<MlabnsEntry>),
    One(MlabnsEntry),
}

impl MlabnsResponse {
    fn into_fqdns(self) -> Vec<String> {
        match self {
            MlabnsResponse::Many(entries) => entries.into_iter().map(|e| e.fqdn).collect(),
            MlabnsResponse::One(entry) => vec![entry.fqdn],
        }
    }
}

/// The production [`ServerDirectory`]: HTTPS queries against mlab-ns.
pub struct MlabNs {
    base_url: String,
    timeout: Duration,
}

impl MlabNs {
    /// Create a directory client. `base_url` must not end with a slash.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        MlabNs {
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ServerDirectory for MlabNs {
    async fn nearby(&self, policy: MlabnsPolicy) -> Result<Vec<String>> {
        let url = format!("{}/ndt?policy={}", self.base_url, policy.as_str());
        let client = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::with_cause(ErrKind::IoError, format!("mlabns: {e}")))?;
        let response = client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::with_cause(ErrKind::IoError, format!("mlabns: {e}")))?;
        let body: MlabnsResponse = response
            .json()
            .await
            .map_err(|e| Error::with_cause(ErrKind::InvalidArgument, format!("mlabns: {e}")))?;
        Ok(body.into_fqdns())
    }
}
