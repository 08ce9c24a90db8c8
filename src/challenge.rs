use crate::acme::object::{Challenge, InnerChallenge, Token};
use crate::crypto::jws::JsonWebKey;
use crate::crypto::provider::{CertificateRequest, CryptoProvider};
use crate::crypto::sha256;
use crate::error::{AcmeErrorContext, ManagerResult};
use crate::executor::BlockingExecutor;
use crate::protocol::OrderResource;
use crate::session::AcmeSession;
use crate::store::KeyStore;
use anyhow::{Context, anyhow};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Idle,
    OrderCreated,
    ChallengeFound,
    DnsPublished,
    Validating,
    Finalized,
    Failed,
}

impl Display for ChallengeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            ChallengeState::Idle => "idle",
            ChallengeState::OrderCreated => "order created",
            ChallengeState::ChallengeFound => "challenge found",
            ChallengeState::DnsPublished => "DNS published",
            ChallengeState::Validating => "validating",
            ChallengeState::Finalized => "finalized",
            ChallengeState::Failed => "failed",
        };
        write!(f, "{state}")
    }
}

/// RFC 8555 8.1: `token.thumbprint`
pub fn key_authorization(account_key: &JsonWebKey, token: &Token) -> String {
    let thumbprint = account_key.get_acme_thumbprint();
    format!("{token}.{thumbprint}")
}

/// RFC 8555 8.4: the TXT record value for a key authorization
pub fn dns_validation(key_authorization: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(sha256(key_authorization.as_bytes()))
}

/// One in-flight DNS-01 challenge. Lives in memory only.
#[derive(Debug)]
pub struct ChallengeSession {
    state: ChallengeState,
    order: OrderResource,
    challenge: Challenge,
    key_authorization: String,
    validation: String,
}

impl ChallengeSession {
    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn order(&self) -> &OrderResource {
        &self.order
    }

    pub fn challenge(&self) -> &Challenge {
        &self.challenge
    }

    /// The response the server will check, `token.thumbprint`.
    pub fn key_authorization(&self) -> &str {
        &self.key_authorization
    }

    /// The value to publish in the `_acme-challenge` TXT record.
    pub fn validation(&self) -> &str {
        &self.validation
    }

    /// Records that the caller has published [`Self::validation`].
    pub fn mark_dns_published(&mut self) {
        self.transition(ChallengeState::DnsPublished);
    }

    fn transition(&mut self, next: ChallengeState) {
        debug!("DNS challenge {} -> {next}", self.state);
        self.state = next;
    }
}

/// Picks the dns-01 challenge to answer. When several authorizations offer one, the last wins.
fn select_dns_challenge(order: &OrderResource) -> Option<(&Challenge, &Token)> {
    let mut selected = None;
    for authorization in &order.authorizations {
        for challenge in &authorization.body.challenges {
            if let InnerChallenge::Dns(dns) = &challenge.inner_challenge {
                selected = Some((challenge, &dns.token));
            }
        }
    }
    selected
}

/// Drives a single DNS-01 challenge from order creation to the stored certificate.
///
/// Publishing the TXT record is the caller's job, between [`Self::start_challenge`] and
/// [`Self::finish_challenge`].
#[derive(Debug)]
pub struct ChallengeOrchestrator<'a> {
    session: &'a AcmeSession,
    store: KeyStore,
    crypto: Arc<dyn CryptoProvider>,
    executor: BlockingExecutor,
}

impl<'a> ChallengeOrchestrator<'a> {
    pub fn new(
        session: &'a AcmeSession,
        store: KeyStore,
        crypto: Arc<dyn CryptoProvider>,
        executor: BlockingExecutor,
    ) -> Self {
        Self {
            session,
            store,
            crypto,
            executor,
        }
    }

    pub async fn start_challenge(&self, csr: &CertificateRequest) -> ManagerResult<ChallengeSession> {
        debug!("DNS challenge {} -> {}", ChallengeState::Idle, ChallengeState::OrderCreated);
        let order = self
            .session
            .client()
            .new_order(self.session.account_key(), csr)
            .await
            .context(format!("Creating order for {}", csr.identifier))
            .challenge_failure()?;

        let (challenge, token) = select_dns_challenge(&order)
            .ok_or_else(|| anyhow!("Server offered no dns-01 challenge for {}", csr.identifier))
            .challenge_failure()?;
        let key_authorization = key_authorization(self.session.account_key(), token);
        let validation = dns_validation(&key_authorization);
        let challenge = challenge.clone();

        let mut session = ChallengeSession {
            state: ChallengeState::OrderCreated,
            order,
            challenge,
            key_authorization,
            validation,
        };
        session.transition(ChallengeState::ChallengeFound);
        Ok(session)
    }

    /// Answers the challenge, waits for issuance and replaces the stored chain.
    ///
    /// On failure the session ends up `Failed` and the stored chain is untouched.
    pub async fn finish_challenge(&self, challenge: &mut ChallengeSession) -> ManagerResult<()> {
        let result = self.validate_and_store(challenge).await;
        if result.is_err() {
            challenge.transition(ChallengeState::Failed);
        }
        result
    }

    async fn validate_and_store(&self, challenge: &mut ChallengeSession) -> ManagerResult<()> {
        let client = self.session.client();
        let account_key = self.session.account_key();
        client
            .answer_challenge(account_key, &challenge.challenge, &challenge.key_authorization)
            .await
            .context("Answering DNS challenge")
            .challenge_failure()?;
        challenge.transition(ChallengeState::Validating);

        let finalized = client
            .poll_and_finalize(account_key, &challenge.order)
            .await
            .context("Finalizing order")
            .challenge_failure()?;

        let crypto = self.crypto.clone();
        let fullchain = finalized.fullchain_pem;
        let (fullchain, leaf) = self
            .executor
            .run(move || {
                let leaf = crypto.parse_certificate(&fullchain)?;
                Ok((fullchain, leaf))
            })
            .await
            .context("Server sent an unusable certificate chain")
            .challenge_failure()?;
        debug!(
            "Issued certificate {} valid until {} ({} days)",
            leaf.subject,
            leaf.validity.not_after,
            leaf.validity.time_to_expiration().whole_days()
        );

        let store = self.store.clone();
        self.executor
            .run(move || store.write_certificate(&fullchain))
            .await
            .client_failure()?;
        challenge.transition(ChallengeState::Finalized);
        Ok(())
    }
}
