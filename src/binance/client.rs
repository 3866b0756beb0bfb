// =============================================================================
// Binance USDⓈ-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance error code for cancelling an order that is no longer open.
pub const UNKNOWN_ORDER_CODE: i64 = -2011;

/// Binance error code for a `newClientOrderId` that is already in use.
pub const DUPLICATE_CLIENT_ORDER_ID_CODE: i64 = -4116;

/// Futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// * `api_key`  — sent as a header, never in query params.
    /// * `secret`   — used exclusively for HMAC signing.
    /// * `base_url` — e.g. `https://fapi.binance.com`.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        let val = HeaderValue::from_str(&api_key).context("API key is not a valid header value")?;
        default_headers.insert("X-MBX-APIKEY", val);

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceFuturesClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid HMAC key: {e}"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Append timestamp, recvWindow and signature to `params`.
    fn signed_query(&self, params: &str) -> Result<String> {
        let ts = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed). `params` is a pre-built query string
    /// without timestamp or signature. Returns `None` if Binance reports the
    /// `newClientOrderId` as already used.
    #[instrument(skip(self), name = "binance::place_order")]
    pub async fn place_order(&self, params: &str) -> Result<Option<serde_json::Value>> {
        let qs = self.signed_query(params)?;
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            if body["code"].as_i64() == Some(DUPLICATE_CLIENT_ORDER_ID_CODE) {
                debug!("client order id already used");
                return Ok(None);
            }
            anyhow::bail!("Binance POST /fapi/v1/order returned {}: {}", status, body);
        }

        debug!("futures order accepted");
        Ok(Some(body))
    }

    /// GET /fapi/v1/order (signed) by the client order id we assigned.
    #[instrument(skip(self), name = "binance::query_order")]
    pub async fn query_order(&self, symbol: &str, client_id: &str) -> Result<serde_json::Value> {
        let params = format!("symbol={symbol}&origClientOrderId={client_id}");
        let qs = self.signed_query(&params)?;
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order query response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/order returned {}: {}", status, body);
        }
        Ok(body)
    }

    /// DELETE /fapi/v1/order (signed). Returns `None` if Binance reports the
    /// order as unknown (already filled, cancelled or expired).
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params)?;
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /fapi/v1/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse cancel response")?;

        if !status.is_success() {
            if body["code"].as_i64() == Some(UNKNOWN_ORDER_CODE) {
                debug!(symbol, order_id, "order already gone");
                return Ok(None);
            }
            anyhow::bail!("Binance DELETE /fapi/v1/order returned {}: {}", status, body);
        }

        debug!(symbol, order_id, "order cancelled");
        Ok(Some(body))
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/premiumIndex — public, current mark price of `symbol`.
    #[instrument(skip(self), name = "binance::mark_price")]
    pub async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/premiumIndex request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse premiumIndex response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/premiumIndex returned {}: {}", status, body);
        }
        parse_str_f64(&body["markPrice"]).context("premiumIndex response missing 'markPrice'")
    }

    // -------------------------------------------------------------------------
    // User data stream
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/listenKey — API-key authenticated, not signed.
    #[instrument(skip(self), name = "binance::start_user_stream")]
    pub async fn start_user_stream(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/listenKey request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse listenKey response")?;

        if !status.is_success() {
            anyhow::bail!("Binance POST /fapi/v1/listenKey returned {}: {}", status, body);
        }

        let key = body["listenKey"]
            .as_str()
            .context("listenKey response missing 'listenKey'")?;
        Ok(key.to_string())
    }

    /// PUT /fapi/v1/listenKey — keeps the user data stream alive for 60 min.
    #[instrument(skip(self), name = "binance::keepalive_user_stream")]
    pub async fn keepalive_user_stream(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .context("PUT /fapi/v1/listenKey request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Binance PUT /fapi/v1/listenKey returned {}", resp.status());
        }
        Ok(())
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_binance_reference() {
        // Example from the Binance API documentation.
        let client = BinanceFuturesClient::new(
            "dbefbc809e3e83c283a984c3a1459732ea7db1360ca80c5c2c8867408d28cc83",
            "2b5eb11e18796d12d88f13dc27dbbd02c2cc51ff7059765ed9821957d82bb4d9",
            "https://fapi.binance.com",
        )
        .unwrap();
        let query = "symbol=BTCUSDT&side=BUY&type=LIMIT&quantity=1&price=9000&timeInForce=GTC&recvWindow=5000&timestamp=1591702613943";
        assert_eq!(
            client.sign(query).unwrap(),
            "3c661234138461fcc7a7d8746c6558c9842d4e10870d2ecbedf7777cad694af9"
        );
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = BinanceFuturesClient::new("key", "secret", "https://fapi.binance.com/").unwrap();
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("secret\""));
        assert!(dbg.contains("<redacted>"));
        assert!(dbg.contains("https://fapi.binance.com\""));
    }

    #[test]
    fn parses_string_and_numeric_prices() {
        assert_eq!(parse_str_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_str_f64(&serde_json::json!(2.0)).unwrap(), 2.0);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }
}
