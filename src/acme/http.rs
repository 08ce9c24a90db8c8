use crate::acme::error::ProtocolResult;
use crate::acme::object::Nonce;
use reqwest::{ClientBuilder, Method, Request, Response};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use url::Url;

// RFC8555 Section 6.1: identify both the client and the HTTP library in use.
pub(crate) const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest/",
    env!("REQWEST_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

const REPLAY_NONCE: &str = "Replay-Nonce";

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn try_new() -> ProtocolResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        // RFC8555 Section 6.1, "clients SHOULD send an Accept-Language header field"
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en"),
        );
        let client = ClientBuilder::new()
            // RFC8555 Section 6: ACME runs over HTTPS. Unit tests talk to a local plain-HTTP mock.
            .https_only(!cfg!(test))
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }

    pub fn extract_nonce(res: &Response) -> Option<Nonce> {
        res.headers()
            .get(REPLAY_NONCE)
            .and_then(|header| header.to_str().ok())
            .and_then(|nonce_value| Nonce::try_from(nonce_value.to_string()).ok())
    }

    pub fn extract_backoff(res: &Response) -> Option<SystemTime> {
        res.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|header| header.to_str().ok())
            .and_then(parse_retry_after)
    }

    pub fn extract_location(res: &Response) -> Option<Url> {
        res.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|header| header.to_str().ok())
            // Location may be relative to the request URL
            .and_then(|location| res.url().join(location).ok())
    }

    async fn execute(&self, req: Request) -> ProtocolResult<Response> {
        Ok(self.client.execute(req).await?)
    }

    pub async fn get(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::GET, url)).await
    }

    pub async fn head(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::HEAD, url)).await
    }

    pub async fn post<T: Serialize>(&self, url: Url, body: &T) -> ProtocolResult<Response> {
        // RFC8555 Section 6.2: all POST bodies are flattened JWS objects
        let request = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                reqwest::header::HeaderValue::from_static("application/jose+json"),
            )
            .json(body)
            .build()?;
        self.execute(request).await
    }
}

fn parse_retry_after(retry_after: &str) -> Option<SystemTime> {
    // RFC9110: either delay-seconds or an HTTP-date
    if let Ok(seconds) = retry_after.parse::<u64>() {
        SystemTime::now().checked_add(Duration::from_secs(seconds))
    } else {
        httpdate::parse_http_date(retry_after).ok()
    }
}
