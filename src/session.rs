use crate::crypto::jws::JsonWebKey;
use crate::error::{AcmeErrorContext, ManagerResult};
use crate::executor::BlockingExecutor;
use crate::protocol::{AcmeConnector, AcmeProtocolClient, RegistrationInfo};
use crate::store::KeyStore;
use anyhow::Context;
use tracing::{debug, info, warn};
use url::Url;

/// A connection to the ACME server, bound to a registered account.
#[derive(Debug)]
pub struct AcmeSession {
    client: Box<dyn AcmeProtocolClient>,
    account_key: JsonWebKey,
    registration: RegistrationInfo,
}

impl AcmeSession {
    /// Connects to `directory_url` and makes sure an account exists there.
    ///
    /// A stored registration made with a different server is discarded together with its account key. Without a
    /// usable registration a new account is registered and persisted once the server has accepted it.
    pub async fn bootstrap(
        directory_url: &Url,
        email: &str,
        connector: &dyn AcmeConnector,
        store: &KeyStore,
        executor: &BlockingExecutor,
    ) -> ManagerResult<Self> {
        let reader = store.clone();
        let (mut registration, has_account_key) = executor
            .run(move || Ok((reader.read_registration()?, reader.has_account_key())))
            .await
            .client_failure()?;
        if let Some(existing) = &registration {
            if !existing.same_origin(directory_url) {
                info!(
                    "Stored ACME registration {} belongs to another server, registering at {directory_url} instead",
                    existing.uri
                );
                registration = None;
                let cleaner = store.clone();
                executor
                    .run(move || cleaner.delete_account_artifacts())
                    .await
                    .client_failure()?;
            } else if !has_account_key {
                warn!("ACME account key is missing, discarding registration {}", existing.uri);
                registration = None;
                let cleaner = store.clone();
                executor
                    .run(move || cleaner.delete_account_artifacts())
                    .await
                    .client_failure()?;
            }
        }

        let key_loader = store.clone();
        let account_key = executor
            .run(move || key_loader.load_or_create_account_key())
            .await
            .client_failure()?;

        let client = connector
            .connect(directory_url)
            .await
            .context(format!("Connecting to ACME directory {directory_url}"))
            .client_failure()?;

        let (account_key, registration) = match registration {
            Some(registration) => {
                debug!("Using existing ACME account {}", registration.uri);
                (JsonWebKey::new_existing(account_key, registration.uri.clone()), registration)
            }
            None => {
                if let Some(terms_of_service) = client.directory().terms_of_service() {
                    info!("Agreeing to the terms of service at {terms_of_service}");
                }
                let contact = contact_urls(email).client_failure()?;
                let (account_key, registration) = client
                    .register_account(account_key, contact)
                    .await
                    .context("Registering ACME account")
                    .client_failure()?;
                let writer = store.clone();
                let persisted = registration.clone();
                executor
                    .run(move || writer.write_registration(&persisted))
                    .await
                    .client_failure()?;
                info!("Registered ACME account {}", registration.uri);
                (account_key, registration)
            }
        };

        Ok(Self {
            client,
            account_key,
            registration,
        })
    }

    pub fn client(&self) -> &dyn AcmeProtocolClient {
        self.client.as_ref()
    }

    pub fn account_key(&self) -> &JsonWebKey {
        &self.account_key
    }

    pub fn registration(&self) -> &RegistrationInfo {
        &self.registration
    }

    /// Deactivates the account at the server. The session is useless afterwards.
    pub async fn deactivate(&self) -> ManagerResult<()> {
        self.client
            .deactivate_registration(&self.account_key, &self.registration)
            .await
            .context(format!("Deactivating ACME account {}", self.registration.uri))
            .client_failure()?;
        info!("Deactivated ACME account {}", self.registration.uri);
        Ok(())
    }
}

fn contact_urls(email: &str) -> anyhow::Result<Vec<Url>> {
    let email = email.trim();
    if email.is_empty() {
        return Ok(Vec::new());
    }
    let contact = Url::parse(&format!("mailto:{email}")).context(format!("Invalid contact email {email}"))?;
    Ok(vec![contact])
}
