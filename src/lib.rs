//! Obtains and maintains the TLS certificate of a remote hostname through ACME DNS-01 challenges.
//!
//! [`CertificateManager`] is the entry point. The DNS record is published through a cloud API
//! ([`dns::RemoteDnsPublisher`]), everything else is plain RFC 8555.

pub mod acme;
pub mod cert;
pub mod challenge;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod executor;
pub mod lock;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod store;
pub mod util;

pub use config::Configuration;
pub use error::{CertificateError, ManagerResult};
pub use manager::{CertificateManager, CertificateManagerBuilder};

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
