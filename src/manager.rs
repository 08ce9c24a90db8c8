//! The certificate lifecycle of the remote hostname.

use crate::acme::object::RevocationReason;
use crate::cert::ParsedX509Certificate;
use crate::challenge::ChallengeOrchestrator;
use crate::config::Configuration;
use crate::crypto::provider::{AwsLcCryptoProvider, CertificateRequest, CryptoProvider};
use crate::dns::{ChallengeRecord, DnsPublisher, RemoteDnsPublisher};
use crate::error::{AcmeErrorContext, ManagerResult};
use crate::executor::BlockingExecutor;
use crate::lock::RenewalLock;
use crate::protocol::{AcmeConnector, HttpAcmeConnector};
use crate::session::AcmeSession;
use crate::store::KeyStore;
use anyhow::Context;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct CertificateManagerBuilder {
    config: Configuration,
    connector: Option<Arc<dyn AcmeConnector>>,
    dns_publisher: Option<Arc<dyn DnsPublisher>>,
    crypto: Option<Arc<dyn CryptoProvider>>,
}

impl CertificateManagerBuilder {
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn AcmeConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn with_dns_publisher(mut self, dns_publisher: Arc<dyn DnsPublisher>) -> Self {
        self.dns_publisher = Some(dns_publisher);
        self
    }

    #[must_use]
    pub fn with_crypto_provider(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn build(self) -> anyhow::Result<CertificateManager> {
        let dns_publisher: Arc<dyn DnsPublisher> = match self.dns_publisher {
            Some(dns_publisher) => dns_publisher,
            None => Arc::new(RemoteDnsPublisher::from_config(&self.config.remote_api)?),
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(HttpAcmeConnector::default()));
        let crypto = self.crypto.unwrap_or_else(|| Arc::new(AwsLcCryptoProvider));
        let store = KeyStore::new(self.config.storage.clone(), crypto.clone());
        let executor = BlockingExecutor::new(self.config.max_blocking_tasks);
        Ok(CertificateManager {
            config: self.config,
            store,
            executor,
            connector,
            dns_publisher,
            crypto,
            session: Mutex::new(None),
        })
    }
}

/// Issues, renews and revokes the certificate of one domain.
///
/// `issue_or_renew` and `remove` are serialized: concurrent calls on the same manager queue up, and the storage
/// lock keeps other processes sharing the storage directory out as well.
#[derive(Debug)]
pub struct CertificateManager {
    config: Configuration,
    store: KeyStore,
    executor: BlockingExecutor,
    connector: Arc<dyn AcmeConnector>,
    dns_publisher: Arc<dyn DnsPublisher>,
    crypto: Arc<dyn CryptoProvider>,
    session: Mutex<Option<AcmeSession>>,
}

impl CertificateManager {
    pub fn builder(config: Configuration) -> CertificateManagerBuilder {
        CertificateManagerBuilder {
            config,
            connector: None,
            dns_publisher: None,
            crypto: None,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    async fn lock_storage(&self) -> ManagerResult<RenewalLock> {
        RenewalLock::exclusive_lock(&self.config.storage)
            .await
            .context("Locking certificate storage")
            .client_failure()
    }

    async fn ensure_session<'a>(&self, slot: &'a mut Option<AcmeSession>) -> ManagerResult<&'a AcmeSession> {
        let session = match slot.take() {
            Some(session) => session,
            None => {
                AcmeSession::bootstrap(
                    &self.config.acme_url,
                    &self.config.email,
                    self.connector.as_ref(),
                    &self.store,
                    &self.executor,
                )
                .await?
            }
        };
        Ok(slot.insert(session))
    }

    async fn create_csr(&self) -> ManagerResult<CertificateRequest> {
        let store = self.store.clone();
        let crypto = self.crypto.clone();
        let domain = self.config.domain.clone();
        self.executor
            .run(move || {
                let private_key_pem = store.load_or_create_private_key_pem()?;
                crypto.make_csr(&private_key_pem, &domain)
            })
            .await
            .context("Creating certificate signing request")
            .client_failure()
    }

    /// Orders a fresh certificate and stores it, replacing the current one.
    pub async fn issue_or_renew(&self) -> ManagerResult<()> {
        let mut slot = self.session.lock().await;
        let _lock = self.lock_storage().await?;
        let session = self.ensure_session(&mut slot).await?;

        let csr = self.create_csr().await?;
        let orchestrator =
            ChallengeOrchestrator::new(session, self.store.clone(), self.crypto.clone(), self.executor.clone());
        let mut challenge = orchestrator.start_challenge(&csr).await?;

        let timing = &self.config.timing;
        let record = ChallengeRecord::arm(
            self.dns_publisher.clone(),
            challenge.validation().to_string(),
            timing.dns_api_timeout(),
        );
        if let Err(e) = record.publish().await {
            release(record).await;
            return Err(e)
                .context(format!("Publishing DNS challenge for {}", self.config.domain))
                .remote_api_failure();
        }
        challenge.mark_dns_published();

        info!(
            "Waiting {}s for the DNS challenge of {} to propagate",
            timing.propagation_delay().as_secs(),
            self.config.domain
        );
        tokio::time::sleep(timing.propagation_delay()).await;

        let result = orchestrator.finish_challenge(&mut challenge).await;
        release(record).await;
        result?;
        info!("Successfully issued a certificate for {}!", self.config.domain);
        Ok(())
    }

    /// Revokes the certificate, deletes all key material and deactivates the account.
    pub async fn remove(&self) -> ManagerResult<()> {
        let mut slot = self.session.lock().await;
        let _lock = self.lock_storage().await?;
        let inspector = self.store.clone();
        let has_state = self
            .executor
            .run(move || Ok(inspector.has_registration() || inspector.has_certificate()))
            .await
            .client_failure()?;
        if slot.is_none() && !has_state {
            debug!("No ACME account and no certificate, nothing to remove");
            return Ok(());
        }
        let session = self.ensure_session(&mut slot).await?;

        let reader = self.store.clone();
        let certificate = self
            .executor
            .run(move || reader.read_certificate())
            .await
            .client_failure()?;
        match certificate {
            None => warn!("No certificate to revoke for {}", self.config.domain),
            Some(certificate) => {
                let revoked = session
                    .client()
                    .revoke(session.account_key(), certificate.as_der_bytes(), RevocationReason::Unspecified)
                    .await;
                match revoked {
                    Ok(()) => info!("Revoked certificate {}", certificate.serial),
                    Err(e) if e.is_conflict() => info!("Certificate {} was already revoked", certificate.serial),
                    Err(e) => return Err(e).context("Revoking certificate").client_failure(),
                }
            }
        }

        let cleaner = self.store.clone();
        self.executor
            .run(move || {
                cleaner.delete_private_key()?;
                cleaner.delete_certificate()
            })
            .await
            .client_failure()?;

        session.deactivate().await?;
        let cleaner = self.store.clone();
        self.executor
            .run(move || cleaner.delete_account_artifacts())
            .await
            .client_failure()?;
        *slot = None;
        Ok(())
    }

    /// True if a certificate is stored and has not expired yet.
    pub async fn is_valid(&self) -> ManagerResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .read_certificate()
            .await?
            .is_some_and(|certificate| certificate.is_valid_at(now)))
    }

    pub async fn expiry(&self) -> ManagerResult<Option<OffsetDateTime>> {
        Ok(self
            .read_certificate()
            .await?
            .map(|certificate| certificate.validity.not_after))
    }

    pub async fn common_name(&self) -> ManagerResult<Option<String>> {
        Ok(self
            .read_certificate()
            .await?
            .and_then(|certificate| certificate.common_name))
    }

    async fn read_certificate(&self) -> ManagerResult<Option<ParsedX509Certificate>> {
        let store = self.store.clone();
        self.executor
            .run(move || store.read_certificate())
            .await
            .client_failure()
    }
}

async fn release(record: ChallengeRecord) {
    let validation = record.validation().to_string();
    if let Err(e) = record.release().await {
        warn!("Failed to clean up DNS challenge {validation}: {e:#}");
    }
}
