use thiserror::Error;

/// Errors surfaced by the indicator pipeline and the exchange translator.
#[derive(Debug, Error)]
pub enum Error {
    /// 429 / 5xx / timeout that outlived the retry budget
    #[error("{service} unavailable after {attempts} attempts: {reason}")]
    TransientUpstream {
        service: &'static str,
        attempts: u32,
        reason: String,
    },

    /// Missing credentials or an invalid request plan. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The coin amount converts to zero contracts; nothing was sent.
    #[error("order size too small for {asset}: {coin_amount} coins at {contract_value} per contract")]
    SizeTooSmall {
        asset: String,
        coin_amount: f64,
        contract_value: f64,
    },

    /// A request that cannot be sent as given (e.g. a non-positive trigger price).
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Both indicator horizons came back empty.
    #[error("no usable indicators returned for {asset}")]
    NoUsableData { asset: String },

    /// Non-retryable HTTP status (4xx other than 429).
    #[error("{service} rejected request ({status}): {body}")]
    UpstreamRejected {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// OKX envelope with a non-zero code.
    #[error("exchange error {code}: {msg}")]
    Exchange { code: String, msg: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors the exchange itself returned (as opposed to transport failures).
    pub fn is_exchange_rejection(&self) -> bool {
        matches!(self, Error::Exchange { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_too_small_message() {
        let err = Error::SizeTooSmall {
            asset: "BTC".to_string(),
            coin_amount: 0.001,
            contract_value: 1.0,
        };
        assert!(err.to_string().contains("too small for BTC"));
        assert!(!err.is_exchange_rejection());
    }

    #[test]
    fn test_exchange_rejection() {
        let err = Error::Exchange {
            code: "51400".to_string(),
            msg: "Order does not exist".to_string(),
        };
        assert!(err.is_exchange_rejection());
        assert_eq!(err.to_string(), "exchange error 51400: Order does not exist");
    }
}
