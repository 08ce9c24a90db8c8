use crate::acme::http::USER_AGENT;
use crate::config::RemoteApiConfiguration;
use anyhow::{Context, Error, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const PUBLISH_ENDPOINT: &str = "challenge_txt";
const CLEANUP_ENDPOINT: &str = "challenge_cleanup";

/// Publishes and removes the `_acme-challenge` TXT record of the managed domain.
#[async_trait]
pub trait DnsPublisher: Debug + Send + Sync {
    async fn publish_txt_challenge(&self, validation: &str) -> Result<(), Error>;

    async fn clear_txt_challenge(&self, validation: &str) -> Result<(), Error>;
}

/// Client for the cloud API that owns the DNS zone of the remote hostname.
#[derive(Debug, Clone)]
pub struct RemoteDnsPublisher {
    base_url: Url,
    access_token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct TxtBody<'a> {
    txt: &'a str,
}

impl RemoteDnsPublisher {
    pub fn new(base_url: Url, access_token: Option<String>, client: reqwest::Client) -> Self {
        Self {
            base_url,
            access_token,
            client,
        }
    }

    pub fn from_config(config: &RemoteApiConfiguration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Building HTTP client for remote DNS API")?;
        Ok(Self::new(config.base_url.clone(), config.access_token.clone(), client))
    }

    fn endpoint(&self, name: &str) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("{} cannot be used as API base URL", self.base_url))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

    async fn post_txt(&self, endpoint: &str, validation: &str) -> Result<(), Error> {
        let url = self.endpoint(endpoint)?;
        let mut request = self.client.post(url.clone()).json(&TxtBody { txt: validation });
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .context(format!("Sending request to remote DNS API {url}"))?
            .error_for_status()
            .context(format!("Remote DNS API {url} rejected the request"))?;
        Ok(())
    }
}

#[async_trait]
impl DnsPublisher for RemoteDnsPublisher {
    async fn publish_txt_challenge(&self, validation: &str) -> Result<(), Error> {
        self.post_txt(PUBLISH_ENDPOINT, validation).await
    }

    async fn clear_txt_challenge(&self, validation: &str) -> Result<(), Error> {
        self.post_txt(CLEANUP_ENDPOINT, validation).await
    }
}

/// A TXT record that may have been published and must be cleared again.
///
/// Armed before publication. [`ChallengeRecord::release`] clears the record with the same bounded timeout.
/// If the record is dropped while still armed, the clear is spawned onto the current runtime instead.
#[derive(Debug)]
#[must_use]
pub struct ChallengeRecord {
    publisher: Arc<dyn DnsPublisher>,
    validation: String,
    timeout: Duration,
    armed: bool,
}

impl ChallengeRecord {
    pub fn arm(publisher: Arc<dyn DnsPublisher>, validation: String, timeout: Duration) -> Self {
        Self {
            publisher,
            validation,
            timeout,
            armed: true,
        }
    }

    pub fn validation(&self) -> &str {
        &self.validation
    }

    pub async fn publish(&self) -> Result<(), Error> {
        debug!("Publishing DNS challenge {}", self.validation);
        tokio::time::timeout(self.timeout, self.publisher.publish_txt_challenge(&self.validation))
            .await
            .map_err(|_| anyhow!("Publishing DNS challenge timed out after {:?}", self.timeout))?
    }

    /// Clears the record. Errors are returned for logging only, they never change the issuance outcome.
    pub async fn release(mut self) -> Result<(), Error> {
        self.armed = false;
        clear(self.publisher.clone(), self.validation.clone(), self.timeout).await
    }
}

async fn clear(publisher: Arc<dyn DnsPublisher>, validation: String, timeout: Duration) -> Result<(), Error> {
    debug!("Clearing DNS challenge {validation}");
    tokio::time::timeout(timeout, publisher.clear_txt_challenge(&validation))
        .await
        .map_err(|_| anyhow!("Clearing DNS challenge timed out after {timeout:?}"))?
}

impl Drop for ChallengeRecord {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let publisher = self.publisher.clone();
        let validation = std::mem::take(&mut self.validation);
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = clear(publisher, validation, timeout).await {
                        warn!("Failed to clean up DNS challenge: {e:#}");
                    }
                });
            }
            Err(_) => warn!("DNS challenge {validation} left behind: no runtime to clear it"),
        }
    }
}
