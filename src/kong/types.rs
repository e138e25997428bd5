//! Wire types for the Kong admin API.
//!
//! Field sets follow the admin API's JSON: record identity is `id`, lists
//! come wrapped in `{ "data": [...], "total": n }`. Optional fields are
//! omitted on the wire when unset so creates and updates stay minimal.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A routing record on the gateway: `(hosts, uris) -> upstream_url`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KongApi {
    /// Stable name derived from `(host, namespace, path)`
    pub name: String,

    /// Opaque UID assigned by the gateway; present on records read back
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "id")]
    pub uid: Option<String>,

    /// Creation timestamp assigned by the gateway (epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,

    /// Scheme-qualified address the gateway forwards to
    pub upstream_url: String,

    /// Hostnames routed to this record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// URI prefixes routed to this record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,

    /// Strip the matched URI prefix before proxying
    pub strip_uri: bool,

    /// Forward the original Host header instead of the upstream's
    pub preserve_host: bool,
}

/// Paged list of [`KongApi`] records.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KongApiList {
    /// Records in this page
    #[serde(default)]
    pub data: Vec<KongApi>,
    /// Total record count across pages
    #[serde(default)]
    pub total: Option<u64>,
}

/// A plugin instance attached to a gateway API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plugin {
    /// Gateway-assigned UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Plugin name (`key-auth`, `cors`, `jwt`, `rate-limiting`)
    pub name: String,
    /// Plugin-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Paged list of [`Plugin`]s.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PluginList {
    /// Plugins in this page
    #[serde(default)]
    pub data: Vec<Plugin>,
    /// Total plugin count
    #[serde(default)]
    pub total: Option<u64>,
}

/// A TLS certificate with the SNI hostnames it serves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    /// PEM certificate chain
    pub cert: String,
    /// PEM private key
    pub key: String,
    /// SNI hostnames
    pub snis: Vec<String>,
}

/// A gateway consumer; the username is the identity-provider host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    /// Gateway-assigned UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unique username
    pub username: String,
}

/// A JWT credential attached to a consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JwtCredential {
    /// Gateway-assigned UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Signing algorithm (`RS256` for identity-provider bootstrap)
    pub algorithm: String,
    /// PEM public key used to verify signatures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_public_key: Option<String>,
    /// Issuer key matched against the token's `iss` claim
    pub key: String,
}

/// Paged list of [`JwtCredential`]s.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JwtCredentialList {
    /// Credentials in this page
    #[serde(default)]
    pub data: Vec<JwtCredential>,
    /// Total credential count
    #[serde(default)]
    pub total: u64,
}

/// `key-auth` plugin configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyAuthConfig {
    /// Parameter names inspected for the API key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_names: Vec<String>,
    /// Hide the credential from the upstream request
    #[serde(default)]
    pub hide_credentials: bool,
    /// Consumer UID used for anonymous access when auth fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<String>,
}

/// `cors` plugin configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<String>,
    /// Allowed methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Allowed request headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
    /// Headers exposed to the browser
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exposed_headers: Vec<String>,
    /// Allow credentialed requests
    #[serde(default)]
    pub credentials: bool,
    /// Preflight cache lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    /// Proxy OPTIONS requests to the upstream instead of answering them
    #[serde(default)]
    pub preflight_continue: bool,
}

/// `jwt` plugin configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Query/form parameter names inspected for the token
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uri_param_names: Vec<String>,
    /// Claim used to look up the credential (`iss` by convention)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_claim_name: Option<String>,
    /// Registered claims the gateway verifies (`exp`, `nbf`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims_to_verify: Vec<String>,
    /// Decode the credential secret as base64
    #[serde(default)]
    pub secret_is_base64: bool,
    /// Consumer UID used for anonymous access when auth fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<String>,
}

/// `rate-limiting` plugin configuration. At least one window should be set;
/// the gateway enforces that.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<u64>,
    /// Requests allowed per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u64>,
    /// Requests allowed per hour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u64>,
    /// Requests allowed per day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u64>,
    /// Requests allowed per month
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u64>,
    /// Requests allowed per year
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u64>,
    /// Aggregation entity (`consumer`, `credential`, `ip`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_by: Option<String>,
    /// Counter storage policy (`local`, `cluster`, `redis`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    /// Keep proxying when the counter store is unreachable
    #[serde(default)]
    pub fault_tolerant: bool,
}

/// Decoded configuration for one recognized plugin.
///
/// The set of arms is closed on purpose: plugin annotations are free-form
/// strings and an unrecognized name must fail the sync instead of being
/// forwarded to the gateway untyped.
#[derive(Clone, Debug, PartialEq)]
pub enum PluginConfig {
    /// `key-auth`
    KeyAuth(KeyAuthConfig),
    /// `cors`
    Cors(CorsConfig),
    /// `jwt`
    Jwt(JwtConfig),
    /// `rate-limiting`
    RateLimiting(RateLimitingConfig),
}

impl PluginConfig {
    /// Decode the JSON value of a `kolihub.io/plugin-{name}` annotation.
    pub fn decode(name: &str, raw: &str) -> Result<Self> {
        let parse_err =
            |e: serde_json::Error| Error::serialization(format!("plugin '{name}' config: {e}"));
        match name {
            "key-auth" => Ok(Self::KeyAuth(serde_json::from_str(raw).map_err(parse_err)?)),
            "cors" => Ok(Self::Cors(serde_json::from_str(raw).map_err(parse_err)?)),
            "jwt" => Ok(Self::Jwt(serde_json::from_str(raw).map_err(parse_err)?)),
            "rate-limiting" => Ok(Self::RateLimiting(
                serde_json::from_str(raw).map_err(parse_err)?,
            )),
            other => Err(Error::validation(format!("unknown plugin '{other}'"))),
        }
    }

    /// The gateway-facing plugin name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeyAuth(_) => "key-auth",
            Self::Cors(_) => "cors",
            Self::Jwt(_) => "jwt",
            Self::RateLimiting(_) => "rate-limiting",
        }
    }

    /// Render as the wire [`Plugin`] for a create call.
    pub fn to_plugin(&self) -> Result<Plugin> {
        let config = match self {
            Self::KeyAuth(c) => serde_json::to_value(c),
            Self::Cors(c) => serde_json::to_value(c),
            Self::Jwt(c) => serde_json::to_value(c),
            Self::RateLimiting(c) => serde_json::to_value(c),
        }
        .map_err(|e| Error::serialization(e.to_string()))?;
        Ok(Plugin {
            id: None,
            name: self.name().to_string(),
            config: Some(config),
        })
    }
}
