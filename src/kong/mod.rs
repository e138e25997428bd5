//! Gateway-facing pieces: wire types, admin REST client, and the
//! deterministic naming scheme for gateway records.

pub mod client;
pub mod naming;
pub mod types;

pub use client::{KongAdmin, RestKongAdmin};
pub use types::{
    Certificate, Consumer, JwtCredential, KongApi, Plugin, PluginConfig,
};

/// Finalizer the controller sets on services referenced by an ingress; it
/// blocks service deletion until the gateway records are garbage collected.
pub const FINALIZER: &str = "kolihub.io/kong";
