use crate::config::TaapiSettings;
use crate::error::{Error, Result};
use crate::indicators::normalize::{extract_series, extract_value};
use crate::indicators::plan::HorizonPlan;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

const TAAPI_API_BASE: &str = "https://api.taapi.io/";
const TAAPI_BULK_URL: &str = "https://api.taapi.io/bulk";
const DEFAULT_EXCHANGE: &str = "binance";
const GET_TIMEOUT: Duration = Duration::from_secs(10);
const POST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 10;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);
const FREE_PLAN_CALCULATIONS: u32 = 20;

/// Fixed-backoff retry budget shared by GET and POST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            backoff: RETRY_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Single,
    Bulk,
}

impl RequestKind {
    fn service(self) -> &'static str {
        match self {
            RequestKind::Single => "TAAPI",
            RequestKind::Bulk => "TAAPI bulk",
        }
    }
}

/// Response from the /bulk endpoint
#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    data: Vec<BulkResult>,
}

#[derive(Debug, Deserialize)]
struct BulkResult {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    result: Value,
}

/// Client for the TAAPI technical-analysis API
///
/// Cloneable; clones share the underlying connection pool.
#[derive(Clone)]
pub struct TaapiClient {
    client: Client,
    api_key: String,
    base_url: String,
    bulk_url: String,
    exchange: String,
    retry: RetryPolicy,
    max_calculations: u32,
    get_timeout: Duration,
    post_timeout: Duration,
}

impl TaapiClient {
    /// Fails fast when no API key is configured
    pub fn new(api_key: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Configuration("TAAPI_API_KEY is not set".to_string()));
        }

        Ok(Self {
            client: Client::new(),
            api_key,
            base_url: TAAPI_API_BASE.to_string(),
            bulk_url: TAAPI_BULK_URL.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            retry: RetryPolicy::default(),
            max_calculations: FREE_PLAN_CALCULATIONS,
            get_timeout: GET_TIMEOUT,
            post_timeout: POST_TIMEOUT,
        })
    }

    pub fn from_settings(settings: &TaapiSettings) -> Result<Self> {
        Ok(Self::new(settings.api_key.clone())?
            .with_urls(&settings.base_url, &settings.bulk_url)
            .with_exchange(&settings.exchange)
            .with_max_calculations(settings.max_calculations)
            .with_retry_policy(RetryPolicy {
                max_attempts: settings.retry_attempts.max(1),
                backoff: settings.retry_backoff(),
            }))
    }

    /// Override the endpoints (self-hosted proxy, tests)
    pub fn with_urls(mut self, base_url: &str, bulk_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self.bulk_url = bulk_url.to_string();
        self
    }

    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-request deadlines, covering both the send and the body read
    pub fn with_timeouts(mut self, get: Duration, post: Duration) -> Self {
        self.get_timeout = get;
        self.post_timeout = post;
        self
    }

    pub fn with_max_calculations(mut self, max_calculations: u32) -> Self {
        self.max_calculations = max_calculations;
        self
    }

    async fn get_with_retry(&self, url: &str, params: &[(String, String)]) -> Result<Value> {
        self.send_with_retry(RequestKind::Single, || {
            self.client.get(url).query(params).timeout(self.get_timeout)
        })
        .await
    }

    async fn post_with_retry(&self, url: &str, payload: &Value) -> Result<Value> {
        self.send_with_retry(RequestKind::Bulk, || {
            self.client.post(url).json(payload).timeout(self.post_timeout)
        })
        .await
    }

    /// Retries 429, 5xx and timeouts with a fixed backoff; everything else surfaces at once
    async fn send_with_retry<F>(&self, kind: RequestKind, build: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            let reason = match build().send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        match response.text().await {
                            Ok(body) => return Ok(serde_json::from_str(&body)?),
                            Err(e) if e.is_timeout() => "timeout".to_string(),
                            Err(e) => return Err(e.into()),
                        }
                    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        status.to_string()
                    } else {
                        let body = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(Error::UpstreamRejected {
                            service: kind.service(),
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Err(e) if e.is_timeout() => "timeout".to_string(),
                Err(e) => return Err(e.into()),
            };

            if attempt < max_attempts {
                if reason.starts_with("429") {
                    tracing::warn!(
                        "{} rate limit (429) hit, retrying in {:.1}s (attempt {}/{})",
                        kind.service(),
                        self.retry.backoff.as_secs_f64(),
                        attempt,
                        max_attempts
                    );
                } else {
                    tracing::warn!(
                        "{} {}, retrying in {:.1}s (attempt {}/{})",
                        kind.service(),
                        reason,
                        self.retry.backoff.as_secs_f64(),
                        attempt,
                        max_attempts
                    );
                }
                sleep(self.retry.backoff).await;
            }

            last_reason = reason;
        }

        Err(Error::TransientUpstream {
            service: kind.service(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    /// Fetch every indicator of `plan` in one bulk request
    ///
    /// Returns raw results keyed by indicator id. Plans above the per-request
    /// calculation cap are rejected before any request is made.
    pub async fn fetch_bulk_indicators(
        &self,
        symbol: &str,
        plan: &HorizonPlan,
    ) -> Result<HashMap<String, Value>> {
        let units = plan.calculation_units();
        if units > self.max_calculations {
            return Err(Error::Configuration(format!(
                "bulk request for {} uses {} calculations (limit {})",
                plan.interval, units, self.max_calculations
            )));
        }

        let payload = json!({
            "secret": self.api_key,
            "construct": {
                "exchange": self.exchange,
                "symbol": symbol,
                "interval": plan.interval,
                "indicators": plan.indicators,
            }
        });

        let response = self.post_with_retry(&self.bulk_url, &payload).await?;
        let parsed: BulkResponse = serde_json::from_value(response)?;

        let results: HashMap<String, Value> = parsed
            .data
            .into_iter()
            .filter_map(|item| item.id.map(|id| (id, item.result)))
            .collect();

        tracing::debug!(
            symbol,
            interval = %plan.interval,
            ids = ?results.keys().collect::<Vec<_>>(),
            "Parsed bulk indicator response"
        );

        Ok(results)
    }

    /// Raw single-indicator request: GET `{base}{indicator}`
    pub async fn fetch_indicator(
        &self,
        indicator: &str,
        symbol: &str,
        interval: &str,
        extra: &[(&str, String)],
    ) -> Result<Value> {
        let mut params = vec![
            ("secret".to_string(), self.api_key.clone()),
            ("exchange".to_string(), self.exchange.clone()),
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
        ];
        params.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));

        let url = format!("{}{}", self.base_url, indicator);
        self.get_with_retry(&url, &params).await
    }

    /// Historical series for one indicator, rounded. Empty on any error.
    pub async fn fetch_series(
        &self,
        indicator: &str,
        symbol: &str,
        interval: &str,
        results: u32,
        extra: &[(&str, String)],
        value_key: &str,
    ) -> Vec<f64> {
        let mut params = vec![("results", results.to_string())];
        params.extend(extra.iter().cloned());

        match self.fetch_indicator(indicator, symbol, interval, &params).await {
            Ok(data) => {
                if let Some(error) = data.get("error") {
                    tracing::error!("TAAPI error for {} {} {}: {}", indicator, symbol, interval, error);
                    return Vec::new();
                }
                extract_series(Some(&data), value_key)
            }
            Err(e) => {
                tracing::error!("TAAPI series fetch failed for {}: {}", indicator, e);
                Vec::new()
            }
        }
    }

    /// Latest value for one indicator, rounded. `None` on any error.
    pub async fn fetch_value(
        &self,
        indicator: &str,
        symbol: &str,
        interval: &str,
        extra: &[(&str, String)],
        key: &str,
    ) -> Option<f64> {
        match self.fetch_indicator(indicator, symbol, interval, extra).await {
            Ok(data) => extract_value(Some(&data), key),
            Err(e) => {
                tracing::debug!("TAAPI value fetch failed for {}: {}", indicator, e);
                None
            }
        }
    }
}

/// TAAPI pair notation for a coin ticker
pub fn taapi_symbol(asset: &str) -> String {
    format!("{}/USDT", asset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::plan::IndicatorSpec;
    use mockito::Matcher;
    use std::io::Write;

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            backoff: Duration::from_millis(5),
        }
    }

    fn test_client(server: &mockito::ServerGuard) -> TaapiClient {
        TaapiClient::new("test_key".to_string())
            .unwrap()
            .with_urls(&format!("{}/", server.url()), &format!("{}/bulk", server.url()))
            .with_retry_policy(fast_retry(3))
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let result = TaapiClient::new("  ".to_string());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_taapi_symbol() {
        assert_eq!(taapi_symbol("BTC"), "BTC/USDT");
    }

    #[tokio::test]
    async fn test_bulk_request_shape_and_parsing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/bulk")
            .match_body(Matcher::PartialJson(json!({
                "secret": "test_key",
                "construct": {"exchange": "binance", "symbol": "BTC/USDT", "interval": "5m"}
            })))
            .with_status(200)
            .with_body(
                r#"{"data": [
                    {"id": "ema20", "result": {"value": [1.0, 2.0]}},
                    {"result": {"value": 9.0}},
                    {"id": "rsi7", "result": {"value": [55.5]}}
                ]}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let client = test_client(&server);
        let results = client
            .fetch_bulk_indicators("BTC/USDT", &HorizonPlan::short_term())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["ema20"], json!({"value": [1.0, 2.0]}));
    }

    #[tokio::test]
    async fn test_retries_429_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("POST", "/bulk")
            .with_status(429)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/bulk")
            .with_status(200)
            .with_body(r#"{"data": []}"#)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(&server);
        let results = client
            .fetch_bulk_indicators("BTC/USDT", &HorizonPlan::long_term())
            .await;

        tokio_test::assert_ok!(results);
        limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_slow_body_is_retried_as_timeout() {
        let mut server = mockito::Server::new_async().await;
        let stalled = server
            .mock("POST", "/bulk")
            .with_status(200)
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_millis(500));
                w.write_all(br#"{"data": []}"#)
            })
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/bulk")
            .with_status(200)
            .with_body(r#"{"data": [{"id": "rsi14", "result": {"value": [50.0]}}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(&server)
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(100));
        let results = client
            .fetch_bulk_indicators("BTC/USDT", &HorizonPlan::short_term())
            .await
            .unwrap();

        stalled.assert_async().await;
        ok.assert_async().await;
        assert_eq!(results["rsi14"], json!({"value": [50.0]}));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_budget() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rsi")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = test_client(&server);
        let result = client.fetch_indicator("rsi", "BTC/USDT", "1h", &[]).await;

        mock.assert_async().await;
        match result {
            Err(Error::TransientUpstream { service, attempts, .. }) => {
                assert_eq!(service, "TAAPI");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected transient error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ema")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("invalid secret")
            .expect(1)
            .create_async()
            .await;

        let client = test_client(&server);
        let result = client.fetch_indicator("ema", "BTC/USDT", "4h", &[]).await;

        mock.assert_async().await;
        assert!(matches!(
            result,
            Err(Error::UpstreamRejected { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_single_request_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ema")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("secret".into(), "test_key".into()),
                Matcher::UrlEncoded("exchange".into(), "binance".into()),
                Matcher::UrlEncoded("symbol".into(), "ETH/USDT".into()),
                Matcher::UrlEncoded("interval".into(), "4h".into()),
                Matcher::UrlEncoded("period".into(), "50".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"value": 3012.345678}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let value = client
            .fetch_value("ema", "ETH/USDT", "4h", &[("period", "50".to_string())], "value")
            .await;

        mock.assert_async().await;
        assert_eq!(value, Some(3012.3457));
    }

    #[tokio::test]
    async fn test_fetch_series_error_payload_is_empty() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/macd")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error": "unknown symbol"}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let series = client
            .fetch_series("macd", "XYZ/USDT", "5m", 5, &[], "valueMACD")
            .await;

        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn test_over_budget_plan_rejected_without_request() {
        let server = mockito::Server::new_async().await;
        let plan = HorizonPlan::new(
            "5m",
            vec![
                IndicatorSpec::series("ema20", "ema", "value").period(20).results(15),
                IndicatorSpec::series("rsi14", "rsi", "value").period(14).results(10),
            ],
        );

        let client = test_client(&server);
        let result = client.fetch_bulk_indicators("BTC/USDT", &plan).await;

        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
