use crate::acme::error::ProtocolResult;
use crate::acme::error::Error;
use crate::acme::http::HttpClient;
use crate::acme::object::{
    Account, AccountRequest, Authorization, AuthorizationStatus, Challenge, Deactivation, Directory, EmptyObject,
    FinalizeRequest, NewOrderRequest, Nonce, Order, OrderStatus, Revocation, RevocationReason,
};
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::{EMPTY_PAYLOAD, JsonWebKey, ProtectedHeader};
use crate::util::serde_helper::PassthroughBytes;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::de::value::BytesDeserializer;
use std::any::TypeId;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// The maximum number of retries we do, per request
const MAX_RETRIES: usize = 3;
/// The default time we wait between retries, if a retry is needed
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);
/// The maximum amount of time we're willing to wait in between retries
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2 * 60);
/// Maximum time we wait for the server to progress in the state machine
const MAX_POLL_DURATION: Duration = Duration::from_secs(5 * 60);

pub struct AcmeClientBuilder {
    server_url: Url,
    http_client: Option<HttpClient>,
}

impl AcmeClientBuilder {
    pub fn new(acme_server_url: Url) -> AcmeClientBuilder {
        Self {
            server_url: acme_server_url,
            http_client: None,
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, http_client: HttpClient) -> Self {
        self.http_client = Some(http_client);
        self
    }

    pub async fn try_build(self) -> ProtocolResult<AcmeClient> {
        AcmeClient::try_new(self).await
    }
}

#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct AcmeClient {
    http_client: HttpClient,
    directory: Directory,
    nonce_pool: Mutex<VecDeque<Nonce>>,
}

impl AcmeClient {
    async fn try_new(builder: AcmeClientBuilder) -> ProtocolResult<Self> {
        let http_client = match builder.http_client {
            Some(http_client) => http_client,
            None => HttpClient::try_new()?,
        };
        let directory_response = http_client.get(builder.server_url).await?;
        let directory = match directory_response.status() {
            StatusCode::OK => directory_response.json().await?,
            _ => return Err(Error::get_error_from_http(directory_response).await),
        };
        Ok(Self {
            http_client,
            directory,
            nonce_pool: Mutex::new(VecDeque::default()),
        })
    }

    pub async fn get_nonce(&self) -> ProtocolResult<Nonce> {
        let mut last_error;
        let mut retry = 0;
        loop {
            let pooled_nonce = self.nonce_pool.lock().pop_front();
            if let Some(pooled_nonce) = pooled_nonce {
                return Ok(pooled_nonce);
            }

            let response = self.http_client.head(self.directory.new_nonce.clone()).await?;
            if let Some(nonce) = HttpClient::extract_nonce(&response) {
                return Ok(nonce);
            }

            let retry_after = HttpClient::extract_backoff(&response);
            last_error = Error::get_error_from_http(response).await;
            retry += 1;
            if retry > MAX_RETRIES {
                break;
            }
            let backoff = backoff_from_retry_after(retry_after);
            tokio::time::sleep(backoff).await;
        }
        Err(last_error)
    }

    fn try_store_nonce(&self, maybe_nonce: Option<Nonce>) {
        if let Some(nonce) = maybe_nonce {
            self.nonce_pool.lock().push_back(nonce);
        }
    }

    async fn post_with_retry<T: Serialize, R: DeserializeOwned + 'static>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
    ) -> ProtocolResult<AcmeResponse<R>> {
        let mut last_error;
        let mut retry = 0;
        let mut header = ProtectedHeader::new(
            key.get_algorithm(),
            self.get_nonce().await?,
            target_url.clone(),
            key.get_parameters().clone(),
        );
        loop {
            let signed = key.sign(&header, payload)?;
            let response = self.http_client.post(target_url.clone(), &signed).await?;
            let retry_after = HttpClient::extract_backoff(&response);
            let new_nonce = HttpClient::extract_nonce(&response);
            let location = HttpClient::extract_location(&response);
            let status = response.status();
            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    self.try_store_nonce(new_nonce);
                    // The certificate download and the revocation reply are the only
                    // non-JSON bodies. Callers ask for those as PassthroughBytes.
                    let body: R = if TypeId::of::<R>() == TypeId::of::<PassthroughBytes>() {
                        let bytes = response.bytes().await?;
                        let deserializer = BytesDeserializer::<'_, serde::de::value::Error>::new(&bytes);
                        R::deserialize(deserializer)?
                    } else {
                        response.json().await?
                    };
                    return Ok(AcmeResponse {
                        status,
                        location,
                        retry_after,
                        body,
                    });
                }
                _ => {
                    last_error = Error::get_error_from_http(response).await;
                    if matches!(&last_error, Error::AcmeProblem(problem) if problem.is_bad_nonce()) {
                        header.nonce = new_nonce.ok_or(Error::ProtocolViolation(
                            "Server did not provide a (valid) Replay-Nonce on a badNonce error",
                        ))?;
                        retry += 1;
                        if retry > MAX_RETRIES {
                            break;
                        }
                        // Immediate retry with the fresh nonce
                        continue;
                    }
                    self.try_store_nonce(new_nonce);
                    if matches!(last_error, Error::RateLimited(_)) {
                        return Err(last_error);
                    }
                }
            }
            retry += 1;
            // Client errors won't get better by asking again
            if status.is_client_error() || retry > MAX_RETRIES {
                break;
            }
            let backoff = backoff_from_retry_after(retry_after);
            tokio::time::sleep(backoff).await;
            header.nonce = self.get_nonce().await?;
        }
        Err(last_error)
    }

    pub fn get_directory(&self) -> &Directory {
        &self.directory
    }

    /// Creates the account, or finds the existing one bound to the same key.
    pub async fn register_account(
        &self,
        options: AccountRegisterOptions,
    ) -> ProtocolResult<(JsonWebKey, Url, Account)> {
        let jwk = JsonWebKey::new(options.key);
        let target_url = &self.get_directory().new_account;
        let payload = AccountRequest {
            contact: options.contact,
            terms_of_service_agreed: options.terms_of_service_agreed,
            only_return_existing: None,
        };
        let response = self.post_with_retry(target_url, &jwk, Some(&payload)).await?;
        let account_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an account URL for created account",
        ))?;
        if response.status == StatusCode::OK {
            debug!("ACME server returned existing account {account_url}");
        }
        let account_key = jwk.into_existing(account_url.clone());
        Ok((account_key, account_url, response.body))
    }

    pub async fn new_order(&self, account_key: &JsonWebKey, request: &NewOrderRequest) -> ProtocolResult<(Url, Order)> {
        let target_url = &self.get_directory().new_order;
        let response = self.post_with_retry(target_url, account_key, Some(request)).await?;
        let order_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an order URL for created order",
        ))?;
        Ok((order_url, response.body))
    }

    pub async fn get_order(&self, account_key: &JsonWebKey, order_url: &Url) -> ProtocolResult<Order> {
        let response = self.post_with_retry(order_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    pub async fn get_authorization(&self, account_key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        let response = self.post_with_retry(authz_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    /// Tells the server the challenge is ready to be validated. Does not wait for the result.
    pub async fn respond_to_challenge(
        &self,
        account_key: &JsonWebKey,
        challenge_url: &Url,
    ) -> ProtocolResult<Challenge> {
        let response = self
            .post_with_retry(challenge_url, account_key, Some(&EmptyObject {}))
            .await?;
        Ok(response.body)
    }

    /// Polls an authorization until the server has decided on it.
    pub async fn poll_authorization(&self, account_key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        let deadline = Instant::now() + MAX_POLL_DURATION;
        let mut retry_after = None;
        while Instant::now() < deadline {
            let response: AcmeResponse<Authorization> =
                self.post_with_retry(authz_url, account_key, EMPTY_PAYLOAD).await?;
            let authorization = response.body;
            match authorization.status {
                AuthorizationStatus::Pending => {
                    retry_after = response.retry_after.or(retry_after);
                }
                AuthorizationStatus::Valid => return Ok(authorization),
                _ => {
                    // The failed challenge carries the reason
                    let problem = authorization
                        .challenges
                        .into_iter()
                        .find_map(|challenge| challenge.error);
                    return match problem {
                        Some(problem) => Err(problem.into()),
                        None => Err(Error::ProtocolViolation(
                            "Authorization failed, but CA did not provide an error message",
                        )),
                    };
                }
            }
            tokio::time::sleep(backoff_from_retry_after(retry_after)).await;
        }
        Err(Error::TimedOut("Timed out waiting for authorization"))
    }

    /// Waits for an order whose authorizations are done to become ready for finalization.
    pub async fn poll_order_ready(&self, account_key: &JsonWebKey, order_url: &Url) -> ProtocolResult<Order> {
        let deadline = Instant::now() + MAX_POLL_DURATION;
        while Instant::now() < deadline {
            let order = self.get_order(account_key, order_url).await?;
            match order.status {
                OrderStatus::Pending => tokio::time::sleep(DEFAULT_RETRY_BACKOFF).await,
                OrderStatus::Invalid => {
                    return match order.error {
                        Some(err) => Err(err.into()),
                        None => Err(Error::ProtocolViolation(
                            "Order is invalid, but CA did not provide an error message",
                        )),
                    };
                }
                OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid => return Ok(order),
            }
        }
        Err(Error::TimedOut("Timed out waiting for order to become ready"))
    }

    /// Finalizes `order`, found at `order_url`, and waits until the CA has issued the certificate.
    pub async fn finalize_order(
        &self,
        account_key: &JsonWebKey,
        order_url: &Url,
        order: &Order,
        csr_der: &[u8],
    ) -> ProtocolResult<Order> {
        let request = FinalizeRequest {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        };
        let response = self
            .post_with_retry(&order.finalize, account_key, Some(&request))
            .await?;
        // RFC 8555 7.4 does not require a Location header on finalize
        let order_url = response.location.unwrap_or_else(|| order_url.clone());
        let finalized: Order = response.body;
        if finalized.status == OrderStatus::Valid {
            return Ok(finalized);
        }
        tokio::time::sleep(backoff_from_retry_after(response.retry_after)).await;
        self.poll_order(account_key, finalized, &order_url).await
    }

    pub async fn poll_order(&self, account_key: &JsonWebKey, mut order: Order, order_url: &Url) -> ProtocolResult<Order> {
        let deadline = Instant::now() + MAX_POLL_DURATION;
        while Instant::now() < deadline {
            match order.status {
                OrderStatus::Pending => {
                    return Err(Error::ProtocolViolation(
                        "Requested finalized order polling but CA reported order is still pending",
                    ));
                }
                OrderStatus::Ready => {
                    return Err(Error::ProtocolViolation(
                        "Requested finalized order polling but CA reported order has not been finalized yet",
                    ));
                }
                OrderStatus::Processing => {
                    tokio::time::sleep(DEFAULT_RETRY_BACKOFF).await;
                    order = self.get_order(account_key, order_url).await?;
                }
                OrderStatus::Valid => {
                    return Ok(order);
                }
                OrderStatus::Invalid => {
                    return if let Some(err) = order.error {
                        Err(err.into())
                    } else {
                        Err(Error::ProtocolViolation(
                            "Order is invalid, but CA did not provide an error message",
                        ))
                    };
                }
            }
        }
        Err(Error::TimedOut("Timed out waiting for order finalization"))
    }

    pub async fn download_certificate(
        &self,
        account_key: &JsonWebKey,
        certificate_url: &Url,
    ) -> ProtocolResult<PassthroughBytes> {
        let response = self
            .post_with_retry(certificate_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    /// Revokes a certificate, authorized by the account that ordered it.
    pub async fn revoke_certificate(
        &self,
        account_key: &JsonWebKey,
        certificate_der: &[u8],
        reason: RevocationReason,
    ) -> ProtocolResult<()> {
        let target_url = &self.get_directory().revoke_cert;
        let request = Revocation {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(certificate_der),
            reason: Some(reason),
        };
        // RFC 8555 7.6: the success response has no body
        let _response: AcmeResponse<PassthroughBytes> =
            self.post_with_retry(target_url, account_key, Some(&request)).await?;
        Ok(())
    }

    pub async fn deactivate_account(&self, account_key: &JsonWebKey, account_url: &Url) -> ProtocolResult<Account> {
        let response = self
            .post_with_retry(account_url, account_key, Some(&Deactivation::new()))
            .await?;
        Ok(response.body)
    }
}

#[derive(Debug)]
pub struct AcmeResponse<T: DeserializeOwned> {
    pub status: StatusCode,
    pub location: Option<Url>,
    pub retry_after: Option<SystemTime>,
    pub body: T,
}

#[derive(Debug)]
pub struct AccountRegisterOptions {
    pub key: KeyPair,
    pub contact: Vec<Url>,
    pub terms_of_service_agreed: Option<bool>,
}

fn backoff_from_retry_after(retry_after: Option<SystemTime>) -> Duration {
    retry_after
        .and_then(|date| date.duration_since(SystemTime::now()).ok())
        .map_or(DEFAULT_RETRY_BACKOFF, |backoff| backoff.min(MAX_RETRY_BACKOFF))
}
