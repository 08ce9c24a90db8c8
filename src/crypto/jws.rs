use crate::acme::object::Nonce;
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::{SignatureError, sha256};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    #[serde(rename = "alg")]
    algorithm: Algorithm,
    pub nonce: Nonce,
    #[serde(rename = "url")]
    target_url: Url,
    #[serde(flatten)]
    key: KeyParameters,
}

impl ProtectedHeader {
    pub fn new(algorithm: Algorithm, nonce: Nonce, target_url: Url, key: KeyParameters) -> Self {
        Self {
            algorithm,
            nonce,
            target_url,
            key,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    #[serde(rename = "RS256")]
    RsaPkcs1Sha256,
}

/// Either the full public key (account creation) or the account URL (everything else).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum KeyParameters {
    #[serde(rename = "jwk")]
    FullKey(JsonWebKeyRsa),
    #[serde(rename = "kid")]
    AccountUrl(Url),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JsonWebKeyRsa {
    #[serde(rename = "kty")]
    key_type: &'static str,
    #[serde(rename = "n")]
    modulus: String,
    #[serde(rename = "e")]
    exponent: String,
}

impl JsonWebKeyRsa {
    pub fn new(modulus: String, exponent: String) -> Self {
        Self {
            key_type: "RSA",
            modulus,
            exponent,
        }
    }

    /// RFC 7638 thumbprint. Members must appear in lexicographic order without whitespace.
    fn thumbprint(&self) -> String {
        let e = &self.exponent;
        let kty = self.key_type;
        let n = &self.modulus;
        let canonical = format!(r#"{{"e":"{e}","kty":"{kty}","n":"{n}"}}"#);
        BASE64_URL_SAFE_NO_PAD.encode(sha256(canonical.as_bytes()))
    }
}

pub const EMPTY_PAYLOAD: Option<&()> = None;

/// The ACME account key together with the way it identifies itself in JWS headers.
#[derive(Debug)]
pub struct JsonWebKey {
    keypair: KeyPair,
    parameters: KeyParameters,
    thumbprint: String,
}

impl JsonWebKey {
    pub fn new(keypair: KeyPair) -> Self {
        let jwk = keypair.to_jwk_parameters();
        let thumbprint = jwk.thumbprint();
        Self {
            keypair,
            parameters: KeyParameters::FullKey(jwk),
            thumbprint,
        }
    }

    pub fn new_existing(keypair: KeyPair, account_url: Url) -> Self {
        let thumbprint = keypair.to_jwk_parameters().thumbprint();
        Self {
            keypair,
            parameters: KeyParameters::AccountUrl(account_url),
            thumbprint,
        }
    }

    #[must_use]
    pub fn into_existing(self, account_url: Url) -> Self {
        Self::new_existing(self.keypair, account_url)
    }

    pub fn get_algorithm(&self) -> Algorithm {
        Algorithm::RsaPkcs1Sha256
    }

    pub fn get_parameters(&self) -> &KeyParameters {
        &self.parameters
    }

    pub fn account_url(&self) -> Option<&Url> {
        match &self.parameters {
            KeyParameters::AccountUrl(url) => Some(url),
            KeyParameters::FullKey(_) => None,
        }
    }

    pub fn sign<T: Serialize>(
        &self,
        header: &ProtectedHeader,
        payload: Option<&T>,
    ) -> Result<FlatJsonWebSignature, SignatureError> {
        let header = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(header)?);
        // POST-as-GET carries an empty payload, not an empty JSON object
        let payload = match payload {
            None => String::new(),
            Some(payload) => BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(payload)?),
        };
        let signature = self.keypair.sign(format!("{header}.{payload}").as_bytes())?;
        Ok(FlatJsonWebSignature {
            header,
            payload,
            signature: BASE64_URL_SAFE_NO_PAD.encode(signature),
        })
    }

    pub fn get_acme_thumbprint(&self) -> &str {
        &self.thumbprint
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatJsonWebSignature {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

impl FlatJsonWebSignature {
    fn parse_base64_json(value: &str) -> anyhow::Result<serde_json::Value> {
        let raw_json = BASE64_URL_SAFE_NO_PAD.decode(value)?;
        Ok(serde_json::from_slice(&raw_json)?)
    }

    pub fn header_json(&self) -> anyhow::Result<serde_json::Value> {
        Self::parse_base64_json(&self.header)
    }

    pub fn payload_json(&self) -> anyhow::Result<serde_json::Value> {
        Self::parse_base64_json(&self.payload)
    }
}
