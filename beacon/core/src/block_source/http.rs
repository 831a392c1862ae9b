use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use log::{debug, warn};
use reqwest::{Client, ClientBuilder, Response};
use serde_json::Value;
use url::Url;

use crate::{
    block_source::BlockSource,
    errors::Error,
    types::{Fetched, SequenceUnit},
    utils::{retry_with_backoff, RetryPolicy},
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_VALIDATORS_PER_PAGE: u32 = 100;

#[derive(Debug, Clone)]
pub struct HttpBlockSourceConfig {
    /// Ordered RPC endpoints. The first one is preferred; the others are fallbacks.
    pub endpoints: Vec<Url>,
    pub request_timeout: Duration,
    pub validators_per_page: u32,
    pub retry: RetryPolicy,
}

impl HttpBlockSourceConfig {
    pub fn new(endpoints: Vec<Url>) -> Self {
        Self {
            endpoints,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            validators_per_page: DEFAULT_VALIDATORS_PER_PAGE,
            retry: RetryPolicy::default(),
        }
    }
}

/// A [`BlockSource`] backed by the CometBFT JSON-over-HTTP RPC.
///
/// Every request is retried against the current endpoint according to the retry policy. Once the
/// retries are exhausted the next endpoint is tried, and the last endpoint that answered becomes
/// the preferred one for subsequent requests.
#[derive(Debug)]
pub struct HttpBlockSource {
    http_client: Client,
    endpoints: Vec<Url>,
    active: AtomicUsize,
    validators_per_page: u32,
    retry: RetryPolicy,
}

impl HttpBlockSource {
    pub fn new(config: HttpBlockSourceConfig) -> anyhow::Result<Self> {
        if config.endpoints.is_empty() {
            anyhow::bail!("at least one RPC endpoint is required");
        }
        for endpoint in &config.endpoints {
            if endpoint.cannot_be_a_base() {
                anyhow::bail!("invalid RPC endpoint: {}", endpoint);
            }
        }

        Ok(Self {
            http_client: ClientBuilder::new()
                .timeout(config.request_timeout)
                .build()?,
            endpoints: config.endpoints,
            active: AtomicUsize::new(0),
            validators_per_page: config.validators_per_page,
            retry: config.retry,
        })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Issues `GET <endpoint>/<method>?<params>` and unwraps the `result` envelope.
    async fn get_result(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<Fetched<Value>, Error> {
        let first = self.active.load(Ordering::Relaxed);
        let count = self.endpoints.len();

        for offset in 0..count {
            let index = (first + offset) % count;
            let url = Self::build_url(&self.endpoints[index], method, params)?;

            let result = retry_with_backoff(
                || self.get_json(&url),
                method,
                self.retry,
                Error::is_retryable,
            )
            .await;

            match result {
                Ok(mut body) => {
                    if index != first {
                        warn!("Switching to RPC endpoint {}", self.endpoints[index]);
                        self.active.store(index, Ordering::Relaxed);
                    }
                    return Ok(match body.get_mut("result").map(Value::take) {
                        Some(result) if !result.is_null() => Fetched::Produced(result),
                        _ => Fetched::Absent,
                    });
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        "RPC endpoint {} unavailable for {}: {}",
                        self.endpoints[index], method, err
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::AllEndpointsFailed(count))
    }

    async fn get_json(&self, url: &Url) -> Result<Value, Error> {
        debug!("GET {}", url);
        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| {
                Error::transport(url, err.status().map(|s| s.as_u16()), err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            // CometBFT answers requests it cannot serve, such as a height beyond the tip, with a
            // server error carrying a JSON-RPC `error` envelope and no `result`.
            if status.is_server_error() {
                if let Some(envelope) = Self::rpc_error_envelope(response).await {
                    debug!("RPC error from {}: {}", url, envelope["error"]);
                    return Ok(envelope);
                }
            }
            return Err(Error::transport(
                url,
                Some(status.as_u16()),
                format!("unsuccessful status code: {}", status),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| Error::transport(url, None, format!("invalid response body: {}", err)))
    }

    async fn rpc_error_envelope(response: Response) -> Option<Value> {
        let body = response.json::<Value>().await.ok()?;
        let is_rpc_error = body.get("error").is_some_and(Value::is_object);
        is_rpc_error.then_some(body)
    }

    fn build_url(endpoint: &Url, method: &str, params: &[(&str, String)]) -> Result<Url, Error> {
        let mut url = endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::transport(endpoint, None, "endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push(method);
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

impl BlockSource for HttpBlockSource {
    async fn latest_height(&self) -> Result<SequenceUnit, Error> {
        let result = match self.get_result("abci_info", &[]).await? {
            Fetched::Produced(result) => result,
            Fetched::Absent => {
                return Err(Error::transport(
                    "abci_info",
                    None,
                    "response is missing the `result` object",
                ))
            }
        };

        let height = result
            .pointer("/response/last_block_height")
            .and_then(|value| match value {
                Value::String(s) => s.parse::<u64>().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            });

        height.ok_or_else(|| {
            Error::transport("abci_info", None, "response is missing `last_block_height`")
        })
    }

    async fn fetch_block(&self, height: SequenceUnit) -> Result<Fetched<Value>, Error> {
        self.get_result("block", &[("height", height.to_string())]).await
    }

    async fn fetch_validators(&self, height: SequenceUnit) -> Result<Fetched<Value>, Error> {
        self.get_result(
            "validators",
            &[
                ("height", height.to_string()),
                ("per_page", self.validators_per_page.to_string()),
            ],
        )
        .await
    }
}
