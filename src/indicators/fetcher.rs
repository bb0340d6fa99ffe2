use super::cache::SharedIndicatorCache;
use super::normalize::normalize_bundle;
use super::pacer::Pacer;
use super::plan::HorizonPlan;
use super::{AssetIndicators, IndicatorBundle};
use crate::api::taapi::{taapi_symbol, TaapiClient};
use crate::config::TaapiSettings;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_HORIZON_DELAY: Duration = Duration::from_secs(30);

/// Two-horizon indicator pipeline: short bulk request, pacing delay, long bulk request
///
/// One call is strictly sequential. Calls for different assets may run concurrently;
/// each pays its own delay.
pub struct IndicatorFetcher {
    client: TaapiClient,
    cache: Option<SharedIndicatorCache>,
    pacer: Pacer,
    short_plan: HorizonPlan,
    long_plan: HorizonPlan,
}

impl IndicatorFetcher {
    pub fn new(client: TaapiClient, cache: Option<SharedIndicatorCache>) -> Self {
        Self {
            client,
            cache,
            pacer: Pacer::new(DEFAULT_HORIZON_DELAY),
            short_plan: HorizonPlan::short_term(),
            long_plan: HorizonPlan::long_term(),
        }
    }

    /// Builds the client from settings. The cache is owned by the caller and only used
    /// when `enable_cache` is set.
    pub fn from_settings(settings: &TaapiSettings, cache: SharedIndicatorCache) -> Result<Self> {
        let client = TaapiClient::from_settings(settings)?;
        let cache = settings.enable_cache.then_some(cache);
        Ok(Self::new(client, cache).with_horizon_delay(settings.horizon_delay()))
    }

    pub fn with_horizon_delay(mut self, delay: Duration) -> Self {
        self.pacer = Pacer::new(delay);
        self
    }

    pub fn with_plans(mut self, short_plan: HorizonPlan, long_plan: HorizonPlan) -> Self {
        self.short_plan = short_plan;
        self.long_plan = long_plan;
        self
    }

    /// Fetch the short and long horizon bundles for `asset`
    ///
    /// Served from the cache when both horizons are fresh. Fails with
    /// [`Error::NoUsableData`] only when both horizons are entirely empty.
    pub async fn fetch_asset_indicators(&self, asset: &str) -> Result<AssetIndicators> {
        if let Some(cached) = self.cached(asset).await {
            tracing::info!(
                "Using cached indicators for {} ({} + {})",
                asset,
                self.short_plan.interval,
                self.long_plan.interval
            );
            return Ok(cached);
        }

        let symbol = taapi_symbol(asset);

        let short = self.fetch_horizon(asset, &symbol, &self.short_plan).await?;
        let short_done = Instant::now();

        self.pacer.wait_for_slot(short_done).await;

        let long = self.fetch_horizon(asset, &symbol, &self.long_plan).await?;

        let short_empty = short.is_empty();
        let long_empty = long.is_empty();

        if short_empty || long_empty {
            tracing::warn!(
                asset,
                short_empty,
                long_empty,
                short_missing = ?short.missing_ids(),
                long_missing = ?long.missing_ids(),
                "Incomplete indicator data"
            );
        }

        if short_empty && long_empty {
            return Err(Error::NoUsableData {
                asset: asset.to_string(),
            });
        }

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().await;
            cache.set(asset, &self.short_plan.interval, short.clone());
            cache.set(asset, &self.long_plan.interval, long.clone());
            tracing::info!(
                "Cached indicators for {} ({} + {})",
                asset,
                self.short_plan.interval,
                self.long_plan.interval
            );
        }

        Ok(AssetIndicators { short, long })
    }

    async fn cached(&self, asset: &str) -> Option<AssetIndicators> {
        let mut cache = self.cache.as_ref()?.lock().await;
        let short = cache.get(asset, &self.short_plan.interval);
        let long = cache.get(asset, &self.long_plan.interval);
        Some(AssetIndicators {
            short: short?,
            long: long?,
        })
    }

    /// A horizon whose request failed transiently degrades to an empty bundle;
    /// rejections and configuration errors propagate.
    async fn fetch_horizon(
        &self,
        asset: &str,
        symbol: &str,
        plan: &HorizonPlan,
    ) -> Result<IndicatorBundle> {
        match self.client.fetch_bulk_indicators(symbol, plan).await {
            Ok(raw) => Ok(normalize_bundle(plan, &raw)),
            Err(e @ (Error::Configuration(_) | Error::UpstreamRejected { .. })) => Err(e),
            Err(e) => {
                tracing::error!(
                    "Bulk indicator fetch failed for {} {}: {}",
                    asset,
                    plan.interval,
                    e
                );
                Ok(normalize_bundle(plan, &Default::default()))
            }
        }
    }
}
