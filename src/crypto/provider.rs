use crate::acme::object::Identifier;
use crate::cert::{ParsedX509Certificate, create_and_sign_csr, load_certificates_from_memory};
use crate::crypto::asymmetric::KeyPair;
use anyhow::{Context, bail};
use aws_lc_rs::rsa::KeySize;
use std::fmt::Debug;

/// Modulus size of both the account key and the certificate key
pub const RSA_KEY_BITS: usize = 2048;

/// A signed CSR for exactly one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub identifier: Identifier,
    pub der: Vec<u8>,
}

/// Key generation, CSR encoding and certificate parsing.
///
/// All operations are CPU bound and synchronous. Callers on the async side run them through
/// [`crate::executor::BlockingExecutor`].
pub trait CryptoProvider: Debug + Send + Sync {
    fn generate_rsa_key(&self, bits: usize) -> anyhow::Result<KeyPair>;

    fn make_csr(&self, private_key_pem: &str, domain: &str) -> anyhow::Result<CertificateRequest>;

    /// Parses a PEM chain, leaf first.
    fn load_certificate_chain(&self, pem: &[u8]) -> anyhow::Result<Vec<ParsedX509Certificate>>;

    fn parse_certificate(&self, pem: &[u8]) -> anyhow::Result<ParsedX509Certificate> {
        self.load_certificate_chain(pem)?
            .into_iter()
            .next()
            .context("PEM data contains no certificate")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AwsLcCryptoProvider;

impl CryptoProvider for AwsLcCryptoProvider {
    fn generate_rsa_key(&self, bits: usize) -> anyhow::Result<KeyPair> {
        let size = match bits {
            2048 => KeySize::Rsa2048,
            3072 => KeySize::Rsa3072,
            4096 => KeySize::Rsa4096,
            8192 => KeySize::Rsa8192,
            other => bail!("unsupported RSA key size {other}"),
        };
        KeyPair::generate(size)
    }

    fn make_csr(&self, private_key_pem: &str, domain: &str) -> anyhow::Result<CertificateRequest> {
        let key = KeyPair::from_pem(private_key_pem).context("loading certificate key failed")?;
        let csr = create_and_sign_csr(&key, domain)?;
        Ok(CertificateRequest {
            identifier: Identifier::dns(domain),
            der: csr.der().to_vec(),
        })
    }

    fn load_certificate_chain(&self, pem: &[u8]) -> anyhow::Result<Vec<ParsedX509Certificate>> {
        load_certificates_from_memory(pem)
    }
}
