//! Error types for the kong-ingress controller

use reqwest::StatusCode;
use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Gateway admin API error, with the HTTP status when one was received
    #[error("gateway error{}: {message}", fmt_status(.status))]
    Gateway {
        /// HTTP status returned by the gateway, if the request got that far
        status: Option<StatusCode>,
        /// What failed
        message: String,
    },

    /// Validation error (bad annotation, unknown plugin, wrong secret type, ...)
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Identity-provider bootstrap error
    #[error("identity provider error: {0}")]
    IdentityProvider(String),

    /// Informer failed to start or sync
    #[error("informer error: {0}")]
    Informer(String),
}

fn fmt_status(status: &Option<StatusCode>) -> String {
    match status {
        Some(s) => format!(" ({})", s),
        None => String::new(),
    }
}

impl Error {
    /// Create a gateway error without an HTTP status (transport failure)
    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::Gateway {
            status: None,
            message: msg.into(),
        }
    }

    /// Create a gateway error carrying an HTTP status
    pub fn gateway_status(status: StatusCode, msg: impl Into<String>) -> Self {
        Self::Gateway {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an identity-provider error with the given message
    pub fn identity_provider(msg: impl Into<String>) -> Self {
        Self::IdentityProvider(msg.into())
    }

    /// Create an informer error with the given message
    pub fn informer(msg: impl Into<String>) -> Self {
        Self::Informer(msg.into())
    }

    /// True when the error is a 404 from either control plane.
    ///
    /// Lookups tolerate this (the record does not exist yet) and deletes
    /// treat it as success (already gone).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            Self::Gateway { status, .. } => *status == Some(StatusCode::NOT_FOUND),
            _ => false,
        }
    }

    /// True when the error is a 409; upserts tolerate this (another worker
    /// reconciled the same record first).
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            Self::Gateway { status, .. } => *status == Some(StatusCode::CONFLICT),
            _ => false,
        }
    }
}
