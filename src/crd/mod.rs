//! Custom Resource Definitions owned by this controller.

mod domain;

pub use domain::{
    domain_type, is_valid_domain, resource_name, Domain, DomainPhase, DomainSpec, DomainStatus,
    DomainType,
};
