use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{OnceCell, RwLock};

/// Account position mode as reported by `account/config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    Unknown,
    /// One net position per instrument; orders carry no `posSide`
    Net,
    /// Separate long and short positions; orders must carry `posSide`
    LongShort,
}

impl PositionMode {
    /// Maps `posMode`; anything unrecognized is treated as net
    pub fn from_okx(value: &str) -> Option<PositionMode> {
        match value {
            "net_mode" => Some(PositionMode::Net),
            "long_short_mode" => Some(PositionMode::LongShort),
            _ => None,
        }
    }

    pub fn requires_pos_side(&self) -> bool {
        matches!(self, PositionMode::LongShort)
    }
}

/// Per-session exchange state shared by every translator call
///
/// The position mode is resolved at most once; contract values are static
/// for the lifetime of a session.
#[derive(Debug, Default)]
pub struct ExchangeSession {
    position_mode: OnceCell<PositionMode>,
    contract_values: RwLock<HashMap<String, f64>>,
}

impl ExchangeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position_mode(&self) -> PositionMode {
        self.position_mode
            .get()
            .copied()
            .unwrap_or(PositionMode::Unknown)
    }

    /// Resolve the mode using `detect` on first use. Concurrent callers wait for
    /// the single in-flight detection. A detection error resolves to `Net`.
    pub async fn resolve_position_mode<F, Fut, E>(&self, detect: F) -> PositionMode
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<PositionMode>, E>>,
        E: std::fmt::Display,
    {
        *self
            .position_mode
            .get_or_init(|| async move {
                match detect().await {
                    Ok(Some(mode)) => {
                        tracing::info!("OKX position mode: {:?}", mode);
                        mode
                    }
                    Ok(None) => {
                        tracing::warn!("Unrecognized OKX position mode, using net mode");
                        PositionMode::Net
                    }
                    Err(e) => {
                        tracing::error!("Failed to detect OKX position mode, using net mode: {}", e);
                        PositionMode::Net
                    }
                }
            })
            .await
    }

    pub async fn contract_value(&self, inst_id: &str) -> Option<f64> {
        self.contract_values.read().await.get(inst_id).copied()
    }

    pub async fn store_contract_value(&self, inst_id: &str, value: f64) {
        self.contract_values
            .write()
            .await
            .insert(inst_id.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mode_detected_once() {
        let session = ExchangeSession::new();
        let calls = AtomicUsize::new(0);
        assert_eq!(session.position_mode(), PositionMode::Unknown);

        for _ in 0..3 {
            let mode = session
                .resolve_position_mode(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Some(PositionMode::LongShort))
                })
                .await;
            assert_eq!(mode, PositionMode::LongShort);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detection_failure_is_permanent_net() {
        let session = ExchangeSession::new();

        let mode = session
            .resolve_position_mode(|| async { Err::<Option<PositionMode>, _>("timeout") })
            .await;
        assert_eq!(mode, PositionMode::Net);

        // no re-detection once resolved
        let mode = session
            .resolve_position_mode(|| async { Ok::<_, String>(Some(PositionMode::LongShort)) })
            .await;
        assert_eq!(mode, PositionMode::Net);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_single_detection() {
        let session = Arc::new(ExchangeSession::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    session
                        .resolve_position_mode(|| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            Ok::<_, String>(PositionMode::from_okx("net_mode"))
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), PositionMode::Net);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_contract_values() {
        let session = ExchangeSession::new();
        assert!(session.contract_value("BTC-USDT-SWAP").await.is_none());

        session.store_contract_value("BTC-USDT-SWAP", 0.01).await;
        assert_eq!(session.contract_value("BTC-USDT-SWAP").await, Some(0.01));
    }
}
