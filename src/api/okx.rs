use crate::config::OkxSettings;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const OKX_API_BASE: &str = "https://www.okx.com";
const DEFAULT_REQUESTS_PER_SECOND: u32 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type OkxRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// API credentials for the OKX v5 REST API
#[derive(Clone)]
pub struct OkxCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl std::fmt::Debug for OkxCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxCredentials")
            .field("api_key", &mask(&self.api_key))
            .finish_non_exhaustive()
    }
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0 => "None".to_string(),
        n if n <= 12 => "*".repeat(n),
        n => format!(
            "{}...{}",
            chars[..8].iter().collect::<String>(),
            chars[n - 4..].iter().collect::<String>()
        ),
    }
}

/// Signed REST transport for OKX
///
/// Every request passes through a shared rate limiter. Requests are never
/// retried here: order writes must not be duplicated.
#[derive(Clone)]
pub struct OkxClient {
    client: Client,
    base_url: String,
    credentials: Arc<OkxCredentials>,
    demo: bool,
    rate_limiter: Arc<OkxRateLimiter>,
}

impl OkxClient {
    pub fn new(credentials: OkxCredentials, demo: bool) -> Result<Self> {
        if credentials.api_key.is_empty()
            || credentials.secret_key.is_empty()
            || credentials.passphrase.is_empty()
        {
            return Err(Error::Configuration(
                "Missing OKX credentials (OKX_API_KEY, OKX_SECRET_KEY, OKX_PASSPHRASE)".to_string(),
            ));
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        tracing::info!(
            demo,
            key = %mask(&credentials.api_key),
            "OKX client initialized"
        );

        Ok(Self {
            client,
            base_url: OKX_API_BASE.to_string(),
            credentials: Arc::new(credentials),
            demo,
            rate_limiter: Arc::new(build_rate_limiter(DEFAULT_REQUESTS_PER_SECOND)),
        })
    }

    pub fn from_settings(settings: &OkxSettings) -> Result<Self> {
        let credentials = OkxCredentials {
            api_key: settings.api_key.clone(),
            secret_key: settings.secret_key.clone(),
            passphrase: settings.passphrase.clone(),
        };

        Ok(Self::new(credentials, settings.is_demo())?
            .with_base_url(&settings.base_url)
            .with_requests_per_second(settings.requests_per_second))
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_requests_per_second(mut self, requests_per_second: u32) -> Self {
        self.rate_limiter = Arc::new(build_rate_limiter(requests_per_second));
        self
    }

    pub fn is_demo(&self) -> bool {
        self.demo
    }

    /// Signed GET; returns the full envelope once `code == "0"` has been checked
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(Method::GET, path, query, None).await
    }

    /// Signed POST with a JSON body
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    /// Signed GET decoded into the rows of `data`
    pub async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let envelope = self.get(path, query).await?;
        decode_rows(envelope)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| Error::Configuration(format!("invalid OKX url: {}", e)))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }

        let request_path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let body = match body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        let timestamp = timestamp();
        let signature = sign(
            &self.credentials.secret_key,
            &timestamp,
            method.as_str(),
            &request_path,
            &body,
        )?;

        self.rate_limiter.until_ready().await;

        tracing::debug!("OKX {} {}", method, request_path);

        let mut builder = self
            .client
            .request(method, url)
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("Content-Type", "application/json");
        if self.demo {
            builder = builder.header("x-simulated-trading", "1");
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) if !status.is_success() => {
                return Err(Error::UpstreamRejected {
                    service: "OKX",
                    status: status.as_u16(),
                    body: text,
                })
            }
            Err(e) => return Err(e.into()),
        };

        check_envelope(envelope)
    }
}

fn build_rate_limiter(requests_per_second: u32) -> OkxRateLimiter {
    let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(per_second))
}

/// ISO-8601 UTC with milliseconds, as required by OK-ACCESS-TIMESTAMP
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Base64 HMAC-SHA256 over `timestamp + METHOD + requestPath + body`
pub fn sign(
    secret: &str,
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Configuration(format!("failed to init signer: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.to_uppercase().as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Map a non-zero `code` to an exchange error, preferring the per-row `sCode`/`sMsg`
fn check_envelope(envelope: Value) -> Result<Value> {
    let code = match envelope.get("code") {
        Some(Value::String(code)) => code.clone(),
        Some(Value::Number(code)) => code.to_string(),
        _ => {
            return Err(Error::UnexpectedResponse(format!(
                "OKX response without code: {}",
                truncate(&envelope.to_string(), 300)
            )))
        }
    };

    if code == "0" {
        return Ok(envelope);
    }

    let row_error = envelope
        .get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find_map(|row| {
            let s_code = row.get("sCode")?.as_str()?;
            if s_code.is_empty() || s_code == "0" {
                return None;
            }
            let s_msg = row.get("sMsg").and_then(Value::as_str).unwrap_or_default();
            Some((s_code.to_string(), s_msg.to_string()))
        });

    let (code, msg) = row_error.unwrap_or_else(|| {
        let msg = envelope
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        (code, msg)
    });

    Err(Error::Exchange { code, msg })
}

fn decode_rows<T: DeserializeOwned>(envelope: Value) -> Result<Vec<T>> {
    match envelope {
        Value::Object(mut map) => match map.remove("data") {
            Some(data @ Value::Array(_)) => Ok(serde_json::from_value(data)?),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(Error::UnexpectedResponse(format!(
                "OKX data is not a list: {}",
                truncate(&other.to_string(), 300)
            ))),
        },
        other => Err(Error::UnexpectedResponse(format!(
            "OKX envelope is not an object: {}",
            truncate(&other.to_string(), 300)
        ))),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============== Response rows ==============
//
// OKX encodes numbers as strings, frequently empty.

fn lenient_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_f64(deserializer)?.unwrap_or(0.0))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRow {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_eq: f64,
    #[serde(default)]
    pub details: Vec<BalanceDetail>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDetail {
    pub ccy: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub avail_bal: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub eq: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRow {
    pub inst_id: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub pos: f64,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub mgn_mode: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub avg_px: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub mark_px: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub upl: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub lever: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub liq_px: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentRow {
    pub inst_id: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub ct_val: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfigRow {
    #[serde(default)]
    pub pos_mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerRow {
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub last: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrderRow {
    pub inst_id: String,
    pub ord_id: String,
    pub side: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub sz: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub px: Option<f64>,
    #[serde(default)]
    pub ord_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoOrderRow {
    pub inst_id: String,
    pub algo_id: String,
    pub side: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub sz: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub ord_px: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub tp_trigger_px: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub sl_trigger_px: Option<f64>,
    #[serde(default)]
    pub ord_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillRow {
    pub inst_id: String,
    pub side: String,
    #[serde(default, alias = "sz", deserialize_with = "lenient_f64")]
    pub fill_sz: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fill_px: f64,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub trade_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestRow {
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub oi_ccy: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRateRow {
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub funding_rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn credentials() -> OkxCredentials {
        OkxCredentials {
            api_key: "key-12345678".to_string(),
            secret_key: "secret".to_string(),
            passphrase: "pass".to_string(),
        }
    }

    #[test]
    fn test_sign_known_vectors() {
        let signature = sign(
            "22582BD0CFF14C41EDBF1AB98506286D",
            "2020-12-08T09:08:57.715Z",
            "GET",
            "/api/v5/account/balance?ccy=BTC",
            "",
        )
        .unwrap();
        assert_eq!(signature, "HiZhvSfMtWJA3uUIVXV3a/bSXNPCWvYFXoGCVS8V4zY=");

        let signature = sign(
            "secret",
            "2020-12-08T09:08:57.715Z",
            "post",
            "/api/v5/trade/order",
            r#"{"instId":"BTC-USDT-SWAP"}"#,
        )
        .unwrap();
        assert_eq!(signature, "+lubkBsMJFlcsjBHt5ECDl+DsTpUJ0/bxraCeks/Huo=");
    }

    #[test]
    fn test_missing_credentials() {
        let mut creds = credentials();
        creds.passphrase = String::new();
        assert!(matches!(
            OkxClient::new(creds, true),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_credentials_debug_is_masked() {
        let debug = format!("{:?}", credentials());
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("key-12345678"));
    }

    #[test]
    fn test_envelope_row_error_preferred() {
        let envelope = json!({
            "code": "1",
            "msg": "Operation failed",
            "data": [{"ordId": "", "sCode": "51400", "sMsg": "Order does not exist"}]
        });

        match check_envelope(envelope) {
            Err(Error::Exchange { code, msg }) => {
                assert_eq!(code, "51400");
                assert_eq!(msg, "Order does not exist");
            }
            other => panic!("expected exchange error, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_top_level_error() {
        let envelope = json!({"code": "50113", "msg": "Invalid Sign", "data": []});
        assert!(matches!(
            check_envelope(envelope),
            Err(Error::Exchange { ref code, .. }) if code == "50113"
        ));
    }

    #[test]
    fn test_lenient_rows() {
        let rows: Vec<PositionRow> = decode_rows(json!({
            "code": "0",
            "data": [{"instId": "BTC-USDT-SWAP", "pos": "-3", "posSide": "net",
                      "avgPx": "65000.5", "markPx": "", "upl": "1.2", "lever": "10", "liqPx": ""}]
        }))
        .unwrap();

        assert_eq!(rows[0].pos, -3.0);
        assert_eq!(rows[0].avg_px, 65000.5);
        assert_eq!(rows[0].mark_px, 0.0);
        assert_eq!(rows[0].lever, Some(10.0));
    }

    #[tokio::test]
    async fn test_signed_headers_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v5/account/config")
            .match_header("OK-ACCESS-KEY", "key-12345678")
            .match_header("OK-ACCESS-PASSPHRASE", "pass")
            .match_header("OK-ACCESS-SIGN", Matcher::Any)
            .match_header("OK-ACCESS-TIMESTAMP", Matcher::Regex(r"^\d{4}-\d{2}-\d{2}T".to_string()))
            .match_header("x-simulated-trading", "1")
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"posMode":"net_mode"}]}"#)
            .create_async()
            .await;

        let client = OkxClient::new(credentials(), true)
            .unwrap()
            .with_base_url(&server.url());
        let rows: Vec<AccountConfigRow> = client.get_data("/api/v5/account/config", &[]).await.unwrap();

        mock.assert_async().await;
        assert_eq!(rows[0].pos_mode, "net_mode");
    }

    #[tokio::test]
    async fn test_non_json_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _ticker = server
            .mock("GET", "/api/v5/market/ticker")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let client = OkxClient::new(credentials(), false)
            .unwrap()
            .with_base_url(&server.url());
        let result = client
            .get("/api/v5/market/ticker", &[("instId", "BTC-USDT-SWAP".to_string())])
            .await;

        assert!(matches!(
            result,
            Err(Error::UpstreamRejected { status: 502, .. })
        ));
    }
}
