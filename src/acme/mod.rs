//! RFC 8555 wire client.
//!
//! Everything in here speaks ACME and nothing else: directory discovery, nonces, signed requests and the
//! protocol objects. Key storage, challenge publication and the certificate lifecycle live elsewhere and only
//! reach this module through [`crate::protocol`].

pub mod client;
pub mod error;
pub mod http;
pub mod object;
