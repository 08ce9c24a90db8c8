use crate::acme::object::Identifier;
use crate::crypto::asymmetric::KeyPair;
use anyhow::{Context, Error, bail};
use rcgen::{CertificateSigningRequest, DnType};
use std::io::Cursor;
use std::net::IpAddr;
use tracing::warn;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

/// Upper bound on PEM blocks read from one chain file
const MAX_CERTIFICATE_CHAIN_LENGTH: usize = 10;

/// Builds a CSR for a single domain. The domain is both the subject CN and the only SAN.
pub fn create_and_sign_csr(cert_key: &KeyPair, domain: &str) -> Result<CertificateSigningRequest, Error> {
    let rcgen_keypair = cert_key.to_rcgen_keypair()?;
    let mut cert_params =
        rcgen::CertificateParams::new(vec![domain.to_string()]).context("CSR generation failed")?;
    cert_params.distinguished_name = rcgen::DistinguishedName::new();
    cert_params.distinguished_name.push(DnType::CommonName, domain);
    let csr = cert_params
        .serialize_request(&rcgen_keypair)
        .context("Signing CSR failed")?;
    Ok(csr)
}

/// Parses every certificate of a PEM chain, leaf first.
pub fn load_certificates_from_memory<B: AsRef<[u8]>>(pem_bytes: B) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let reader = Cursor::new(pem_bytes);
    let mut certificates = Vec::new();
    for pem in Pem::iter_from_reader(reader).take(MAX_CERTIFICATE_CHAIN_LENGTH) {
        let pem = pem.context("Reading PEM block failed")?;
        certificates.push(ParsedX509Certificate::try_from(pem.contents)?);
    }
    if certificates.is_empty() {
        bail!("No certificate found in PEM data");
    }
    Ok(certificates)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedX509Certificate {
    pub serial: BigUint,
    pub subject: String,
    pub issuer: String,
    pub common_name: Option<String>,
    pub validity: Validity,
    pub subject_alternative_names: Vec<Identifier>,
    pub raw_bytes: Vec<u8>,
}

impl TryFrom<Vec<u8>> for ParsedX509Certificate {
    type Error = Error;

    fn try_from(der_bytes: Vec<u8>) -> anyhow::Result<ParsedX509Certificate> {
        let (_extra_bytes, cert) = x509_parser::certificate::X509Certificate::from_der(&der_bytes)
            .context("Reading X.509 structure: Decoding DER failed")?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(ToString::to_string);
        let mut subject_alternative_names = Vec::new();
        for extension in cert.extensions() {
            let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() else {
                continue;
            };
            for general_name in &san.general_names {
                match general_name {
                    GeneralName::DNSName(dns_name) => {
                        subject_alternative_names.push(Identifier::dns(dns_name));
                    }
                    GeneralName::IPAddress(raw) => match parse_ip(raw) {
                        Some(ip_addr) => subject_alternative_names.push(ip_addr.into()),
                        None => warn!("Certificate contains invalid IP address {raw:?}"),
                    },
                    unsupported => warn!("Found unsupported general name {unsupported} in certificate"),
                }
            }
        }
        Ok(Self {
            serial: cert.serial.clone(),
            subject: cert.subject.to_string(),
            issuer: cert.issuer.to_string(),
            common_name,
            validity: (&cert.validity).into(),
            subject_alternative_names,
            raw_bytes: der_bytes,
        })
    }
}

fn parse_ip(raw: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(raw) {
        return Some(IpAddr::from(v4));
    }
    <[u8; 16]>::try_from(raw).ok().map(IpAddr::from)
}

impl ParsedX509Certificate {
    pub fn as_der_bytes(&self) -> &[u8] {
        &self.raw_bytes
    }

    pub fn is_valid_at(&self, at: time::OffsetDateTime) -> bool {
        at < self.validity.not_after
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

impl Validity {
    pub fn time_to_expiration(&self) -> time::Duration {
        self.not_after - time::OffsetDateTime::now_utc()
    }
}

impl From<&x509_parser::certificate::Validity> for Validity {
    fn from(value: &x509_parser::certificate::Validity) -> Self {
        Self {
            not_before: value.not_before.to_datetime(),
            not_after: value.not_after.to_datetime(),
        }
    }
}
