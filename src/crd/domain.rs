//! Domain Custom Resource Definition
//!
//! A `Domain` reserves a hostname for one namespace. Routing for a host is
//! only allowed once its domain reaches the `OK` phase, which is how
//! multi-namespace clusters keep hostnames from being hijacked.

use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a claimed hostname.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kolihub.io",
    version = "v1",
    kind = "Domain",
    plural = "domains",
    shortname = "dom",
    status = "DomainStatus",
    namespaced,
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.domain"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// The hostname being claimed (may carry a leading `*.` label)
    pub domain: String,

    /// Primary or wildcard, derived from the leading label
    #[serde(rename = "type")]
    pub domain_type: DomainType,
}

/// Discriminates plain hostnames from wildcard claims.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DomainType {
    /// A single hostname (`api.example.com`)
    Primary,
    /// A wildcard claim (`*.example.com`)
    Wildcard,
}

/// Claim lifecycle phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DomainPhase {
    /// Claim submitted, not yet admitted
    #[default]
    New,
    /// Claim admitted; the host may be routed
    OK,
    /// Claim rejected (invalid or already taken)
    Failed,
}

/// Observed claim state.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    /// Current phase
    #[serde(default)]
    pub phase: DomainPhase,

    /// Human-readable detail for `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 timestamp of the last phase change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl DomainStatus {
    /// Status for a freshly admitted claim.
    pub fn ok() -> Self {
        Self {
            phase: DomainPhase::OK,
            message: None,
            last_update_time: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Status for a rejected claim.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: DomainPhase::Failed,
            message: Some(message.into()),
            last_update_time: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Status for a claim sent back for re-admission.
    pub fn new_phase() -> Self {
        Self {
            phase: DomainPhase::New,
            message: None,
            last_update_time: Some(Utc::now().to_rfc3339()),
        }
    }
}

impl Domain {
    /// Build the claim object for a hostname in the given namespace.
    pub fn from_host(namespace: &str, host: &str) -> Self {
        let mut domain = Self::new(
            &resource_name(host),
            DomainSpec {
                domain: host.to_string(),
                domain_type: domain_type(host),
            },
        );
        domain.metadata.namespace = Some(namespace.to_string());
        domain
    }

    /// True once the claim has been admitted.
    pub fn is_claimed(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == DomainPhase::OK)
            .unwrap_or(false)
    }

    /// The hostname this claim covers.
    pub fn domain(&self) -> &str {
        &self.spec.domain
    }
}

/// Type discriminator for a hostname: wildcard iff the leading label is `*`.
pub fn domain_type(host: &str) -> DomainType {
    if host.starts_with("*.") {
        DomainType::Wildcard
    } else {
        DomainType::Primary
    }
}

/// Object name for a claim. Hostnames are valid DNS-1123 subdomains except
/// for the wildcard label, which is spelled out.
pub fn resource_name(host: &str) -> String {
    match host.strip_prefix("*.") {
        Some(rest) => format!("wildcard.{rest}"),
        None => host.to_string(),
    }
}

/// Validate a claimable hostname: DNS-1123 labels, at least two of them,
/// with `*` allowed only as the entire leading label.
pub fn is_valid_domain(host: &str) -> bool {
    let rest = host.strip_prefix("*.").unwrap_or(host);
    let labels: Vec<&str> = rest.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}
