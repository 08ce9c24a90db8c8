#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType};
use remote_acme::acme::error::{ACME_ALREADY_REVOKED, Error, Problem, ProtocolResult};
use remote_acme::acme::object::{
    Account, AccountStatus, Authorization, AuthorizationStatus, Challenge, ChallengeStatus, DnsChallenge,
    Directory, Identifier, InnerChallenge, Order, OrderStatus, RevocationReason,
};
use remote_acme::config::{Configuration, RemoteApiConfiguration};
use remote_acme::crypto::asymmetric::KeyPair;
use remote_acme::crypto::jws::JsonWebKey;
use remote_acme::crypto::provider::CertificateRequest;
use remote_acme::dns::DnsPublisher;
use remote_acme::protocol::{
    AcmeConnector, AcmeProtocolClient, AuthorizationResource, FinalizedOrder, OrderResource, RegistrationInfo,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use url::Url;

pub const DOMAIN: &str = "abcdef.ui.nabu.casa";
pub const DIRECTORY_URL: &str = "https://acme.example/directory";

pub fn test_configuration(storage: &Path, acme_url: &str) -> Configuration {
    let mut config = Configuration::new(
        Url::parse(acme_url).unwrap(),
        DOMAIN.to_string(),
        "owner@example.org".to_string(),
        storage.to_path_buf(),
        RemoteApiConfiguration {
            base_url: Url::parse("https://remote.example/instance/").unwrap(),
            access_token: None,
        },
    );
    config.timing.propagation_delay_secs = 0;
    config.timing.dns_api_timeout_secs = 5;
    config
}

/// Self-signed certificate for `domain` that expires at `not_after`.
pub fn certificate_pem(domain: &str, not_after: OffsetDateTime) -> anyhow::Result<String> {
    let key = rcgen::KeyPair::generate()?;
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = not_after;
    Ok(params.self_signed(&key)?.pem())
}

/// What the fake CA has seen, plus switches to make it misbehave.
#[derive(Debug, Default)]
pub struct FakeCaState {
    pub connects: Mutex<Vec<Url>>,
    pub registrations: Mutex<Vec<Url>>,
    pub orders: Mutex<Vec<Identifier>>,
    pub key_authorizations: Mutex<Vec<String>>,
    pub revocations: Mutex<Vec<(Vec<u8>, RevocationReason)>>,
    pub deactivations: Mutex<Vec<Url>>,
    in_flight: Mutex<usize>,
    pub max_in_flight: Mutex<usize>,
    pub fail_registration: Mutex<bool>,
    pub fail_finalize: Mutex<bool>,
    pub already_revoked: Mutex<bool>,
    pub without_dns_challenge: Mutex<bool>,
}

fn problem(typ: &str, detail: &str, status: u16) -> Error {
    Error::AcmeProblem(Problem {
        typ: typ.to_string(),
        detail: Some(detail.to_string()),
        status: Some(status),
        subproblems: vec![],
    })
}

/// In-memory ACME server. Every directory URL gets its own client, all sharing one [`FakeCaState`].
#[derive(Debug, Default, Clone)]
pub struct FakeConnector {
    pub state: Arc<FakeCaState>,
}

#[async_trait]
impl AcmeConnector for FakeConnector {
    async fn connect(&self, directory_url: &Url) -> ProtocolResult<Box<dyn AcmeProtocolClient>> {
        self.state.connects.lock().push(directory_url.clone());
        let base = directory_url.join("/").map_err(|_| Error::ProtocolViolation("bad directory URL"))?;
        let directory: Directory = serde_json::from_value(json!({
            "newNonce": base.join("new-nonce").unwrap(),
            "newAccount": base.join("new-acct").unwrap(),
            "newOrder": base.join("new-order").unwrap(),
            "revokeCert": base.join("revoke-cert").unwrap(),
            "keyChange": base.join("key-change").unwrap(),
            "meta": {"termsOfService": base.join("terms").unwrap()}
        }))
        .map_err(|_| Error::ProtocolViolation("bad directory"))?;
        Ok(Box::new(FakeClient {
            state: self.state.clone(),
            base,
            directory,
        }))
    }
}

#[derive(Debug)]
struct FakeClient {
    state: Arc<FakeCaState>,
    base: Url,
    directory: Directory,
}

impl FakeClient {
    fn url(&self, path: &str) -> Url {
        self.base.join(path).unwrap()
    }
}

#[async_trait]
impl AcmeProtocolClient for FakeClient {
    fn directory(&self) -> &Directory {
        &self.directory
    }

    async fn register_account(&self, key: KeyPair, contact: Vec<Url>) -> ProtocolResult<(JsonWebKey, RegistrationInfo)> {
        if *self.state.fail_registration.lock() {
            return Err(problem("urn:ietf:params:acme:error:invalidContact", "contact refused", 400));
        }
        let mut registrations = self.state.registrations.lock();
        let uri = self.url(&format!("acme/acct/{}", registrations.len() + 1));
        registrations.push(uri.clone());
        let registration = RegistrationInfo {
            uri: uri.clone(),
            terms_of_service: self.directory.terms_of_service().cloned(),
            body: Some(Account {
                status: AccountStatus::Valid,
                contact,
                orders: None,
            }),
        };
        Ok((JsonWebKey::new_existing(key, uri), registration))
    }

    async fn new_order(&self, _account_key: &JsonWebKey, request: &CertificateRequest) -> ProtocolResult<OrderResource> {
        {
            let mut in_flight = self.state.in_flight.lock();
            *in_flight += 1;
            let mut max = self.state.max_in_flight.lock();
            *max = (*max).max(*in_flight);
        }
        let number = {
            let mut orders = self.state.orders.lock();
            orders.push(request.identifier.clone());
            orders.len()
        };
        let inner_challenge = if *self.state.without_dns_challenge.lock() {
            InnerChallenge::Unknown
        } else {
            InnerChallenge::Dns(DnsChallenge {
                token: format!("token-{number}").parse()?,
            })
        };
        let authorization_url = self.url(&format!("acme/authz/{number}"));
        Ok(OrderResource {
            url: self.url(&format!("acme/order/{number}")),
            body: Order {
                status: OrderStatus::Pending,
                expires: None,
                identifiers: vec![request.identifier.clone()],
                error: None,
                authorizations: vec![authorization_url.clone()],
                finalize: self.url(&format!("acme/order/{number}/finalize")),
                certificate: None,
            },
            authorizations: vec![AuthorizationResource {
                url: authorization_url,
                body: Authorization {
                    identifier: request.identifier.clone(),
                    status: AuthorizationStatus::Pending,
                    expires: None,
                    challenges: vec![Challenge {
                        url: self.url(&format!("acme/chall/{number}")),
                        status: ChallengeStatus::Pending,
                        validated: None,
                        error: None,
                        inner_challenge,
                    }],
                    wildcard: false,
                },
            }],
            csr_der: request.der.clone(),
        })
    }

    async fn answer_challenge(
        &self,
        _account_key: &JsonWebKey,
        _challenge: &Challenge,
        key_authorization: &str,
    ) -> ProtocolResult<()> {
        self.state.key_authorizations.lock().push(key_authorization.to_string());
        Ok(())
    }

    async fn poll_and_finalize(&self, _account_key: &JsonWebKey, order: &OrderResource) -> ProtocolResult<FinalizedOrder> {
        // Leave room for a second issuance to overlap if the caller does not serialize
        tokio::time::sleep(Duration::from_millis(20)).await;
        *self.state.in_flight.lock() -= 1;
        if *self.state.fail_finalize.lock() {
            return Err(problem("urn:ietf:params:acme:error:unauthorized", "TXT record not found", 403));
        }
        let Some(Identifier::Dns { value }) = order.body.identifiers.first() else {
            return Err(Error::ProtocolViolation("order without DNS identifier"));
        };
        let pem = certificate_pem(value, OffsetDateTime::now_utc() + time::Duration::days(90))
            .map_err(|_| Error::ProtocolViolation("fake CA failed to sign"))?;
        Ok(FinalizedOrder {
            fullchain_pem: pem.into_bytes(),
        })
    }

    async fn revoke(&self, _account_key: &JsonWebKey, certificate_der: &[u8], reason: RevocationReason) -> ProtocolResult<()> {
        if *self.state.already_revoked.lock() {
            return Err(problem(ACME_ALREADY_REVOKED, "Certificate already revoked", 400));
        }
        self.state.revocations.lock().push((certificate_der.to_vec(), reason));
        Ok(())
    }

    async fn deactivate_registration(&self, _account_key: &JsonWebKey, registration: &RegistrationInfo) -> ProtocolResult<()> {
        self.state.deactivations.lock().push(registration.uri.clone());
        Ok(())
    }
}

/// Keeps published TXT values in memory.
#[derive(Debug, Default)]
pub struct RecordingDnsPublisher {
    /// Every value a publish was tried with, including failed attempts
    pub attempted: Mutex<Vec<String>>,
    pub published: Mutex<Vec<String>>,
    pub cleared: Mutex<Vec<String>>,
    pub fail_publish: Mutex<bool>,
}

#[async_trait]
impl DnsPublisher for RecordingDnsPublisher {
    async fn publish_txt_challenge(&self, validation: &str) -> anyhow::Result<()> {
        self.attempted.lock().push(validation.to_string());
        if *self.fail_publish.lock() {
            bail!("remote API unavailable");
        }
        self.published.lock().push(validation.to_string());
        Ok(())
    }

    async fn clear_txt_challenge(&self, validation: &str) -> anyhow::Result<()> {
        self.cleared.lock().push(validation.to_string());
        Ok(())
    }
}
