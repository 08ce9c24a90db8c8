//! The seam between the certificate lifecycle and the ACME wire protocol.
//!
//! [`AcmeConnector`] performs directory discovery and hands out an [`AcmeProtocolClient`] bound to that
//! directory. The lifecycle code only ever talks to these traits, so hosts and tests can swap out the
//! HTTP implementation.

use crate::acme::client::{AccountRegisterOptions, AcmeClient, AcmeClientBuilder};
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::http::HttpClient;
use crate::acme::object::{Account, Authorization, Challenge, Directory, NewOrderRequest, Order, RevocationReason};
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::JsonWebKey;
use crate::crypto::provider::CertificateRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::debug;
use url::Url;

/// The account record the server assigned at registration, as persisted in `acme_reg.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub uri: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Account>,
}

impl RegistrationInfo {
    /// True if this registration was made with the server behind `directory_url`.
    pub fn same_origin(&self, directory_url: &Url) -> bool {
        self.uri.origin() == directory_url.origin()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResource {
    pub url: Url,
    pub body: Authorization,
}

/// A freshly created order together with its authorizations and the CSR it will be finalized with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderResource {
    pub url: Url,
    pub body: Order,
    pub authorizations: Vec<AuthorizationResource>,
    pub csr_der: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedOrder {
    pub fullchain_pem: Vec<u8>,
}

#[async_trait]
pub trait AcmeConnector: Debug + Send + Sync {
    /// Fetches the directory and returns a client bound to it.
    async fn connect(&self, directory_url: &Url) -> ProtocolResult<Box<dyn AcmeProtocolClient>>;
}

#[async_trait]
pub trait AcmeProtocolClient: Debug + Send + Sync {
    fn directory(&self) -> &Directory;

    /// Registers the account, agreeing to the terms of service.
    async fn register_account(&self, key: KeyPair, contact: Vec<Url>) -> ProtocolResult<(JsonWebKey, RegistrationInfo)>;

    async fn new_order(&self, account_key: &JsonWebKey, request: &CertificateRequest) -> ProtocolResult<OrderResource>;

    /// Signals the server that `challenge` can be validated. `key_authorization` is what the server will find.
    async fn answer_challenge(
        &self,
        account_key: &JsonWebKey,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> ProtocolResult<()>;

    /// Waits for validation, finalizes the order with its CSR and downloads the chain.
    async fn poll_and_finalize(&self, account_key: &JsonWebKey, order: &OrderResource) -> ProtocolResult<FinalizedOrder>;

    /// Fails with an error for which [`Error::is_conflict`] holds if the certificate is already revoked.
    async fn revoke(&self, account_key: &JsonWebKey, certificate_der: &[u8], reason: RevocationReason) -> ProtocolResult<()>;

    async fn deactivate_registration(&self, account_key: &JsonWebKey, registration: &RegistrationInfo) -> ProtocolResult<()>;
}

/// Connects to real ACME servers over HTTPS.
#[derive(Debug, Clone, Default)]
pub struct HttpAcmeConnector {
    http_client: Option<HttpClient>,
}

impl HttpAcmeConnector {
    pub fn new(http_client: HttpClient) -> Self {
        Self {
            http_client: Some(http_client),
        }
    }
}

#[async_trait]
impl AcmeConnector for HttpAcmeConnector {
    async fn connect(&self, directory_url: &Url) -> ProtocolResult<Box<dyn AcmeProtocolClient>> {
        let mut builder = AcmeClientBuilder::new(directory_url.clone());
        if let Some(http_client) = &self.http_client {
            builder = builder.with_http_client(http_client.clone());
        }
        let client = builder.try_build().await?;
        Ok(Box::new(client))
    }
}

#[async_trait]
impl AcmeProtocolClient for AcmeClient {
    fn directory(&self) -> &Directory {
        self.get_directory()
    }

    async fn register_account(&self, key: KeyPair, contact: Vec<Url>) -> ProtocolResult<(JsonWebKey, RegistrationInfo)> {
        let terms_of_service = self.get_directory().terms_of_service().cloned();
        let options = AccountRegisterOptions {
            key,
            contact,
            terms_of_service_agreed: Some(true),
        };
        let (jwk, uri, account) = AcmeClient::register_account(self, options).await?;
        let registration = RegistrationInfo {
            uri,
            terms_of_service,
            body: Some(account),
        };
        Ok((jwk, registration))
    }

    async fn new_order(&self, account_key: &JsonWebKey, request: &CertificateRequest) -> ProtocolResult<OrderResource> {
        let order_request = NewOrderRequest {
            identifiers: vec![request.identifier.clone()],
        };
        let (url, body) = AcmeClient::new_order(self, account_key, &order_request).await?;
        debug!("Order URL: {url}");
        let mut authorizations = Vec::with_capacity(body.authorizations.len());
        for authz_url in &body.authorizations {
            let authorization = self.get_authorization(account_key, authz_url).await?;
            authorizations.push(AuthorizationResource {
                url: authz_url.clone(),
                body: authorization,
            });
        }
        Ok(OrderResource {
            url,
            body,
            authorizations,
            csr_der: request.der.clone(),
        })
    }

    async fn answer_challenge(
        &self,
        account_key: &JsonWebKey,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> ProtocolResult<()> {
        // RFC 8555 7.5.1: the key authorization itself is not sent, the server computes it
        debug!("Answering challenge {} (key authorization {key_authorization})", challenge.url);
        self.respond_to_challenge(account_key, &challenge.url).await?;
        Ok(())
    }

    async fn poll_and_finalize(&self, account_key: &JsonWebKey, order: &OrderResource) -> ProtocolResult<FinalizedOrder> {
        for authorization in &order.authorizations {
            self.poll_authorization(account_key, &authorization.url).await?;
        }
        let ready = self.poll_order_ready(account_key, &order.url).await?;
        let finalized = self.finalize_order(account_key, &order.url, &ready, &order.csr_der).await?;
        let certificate_url = finalized.certificate.ok_or(Error::ProtocolViolation(
            "Order is valid, but CA did not provide a certificate URL",
        ))?;
        debug!("Certificate URL: {certificate_url}");
        let pem = self.download_certificate(account_key, &certificate_url).await?;
        Ok(FinalizedOrder {
            fullchain_pem: pem.into_inner(),
        })
    }

    async fn revoke(&self, account_key: &JsonWebKey, certificate_der: &[u8], reason: RevocationReason) -> ProtocolResult<()> {
        self.revoke_certificate(account_key, certificate_der, reason).await
    }

    async fn deactivate_registration(&self, account_key: &JsonWebKey, registration: &RegistrationInfo) -> ProtocolResult<()> {
        let account = self.deactivate_account(account_key, &registration.uri).await?;
        debug!("Account {} is now {}", registration.uri, account.status);
        Ok(())
    }
}
