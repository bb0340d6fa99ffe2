// Indicator acquisition: plans, normalization, caching and the two-horizon fetch pipeline
pub mod cache;
pub mod fetcher;
pub mod normalize;
pub mod pacer;
pub mod plan;

pub use cache::{CacheStats, IndicatorCache, SharedIndicatorCache};
pub use fetcher::IndicatorFetcher;
pub use pacer::Pacer;
pub use plan::{HorizonPlan, IndicatorSpec, LONG_INTERVAL, SHORT_INTERVAL};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A normalized indicator result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    /// Most recent first
    Series(Vec<f64>),
    Scalar(Option<f64>),
}

impl IndicatorValue {
    pub fn is_empty(&self) -> bool {
        match self {
            IndicatorValue::Series(values) => values.is_empty(),
            IndicatorValue::Scalar(value) => value.is_none(),
        }
    }
}

/// Indicator id -> normalized value for one asset and horizon
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorBundle(BTreeMap<String, IndicatorValue>);

impl IndicatorBundle {
    pub fn insert(&mut self, id: String, value: IndicatorValue) {
        self.0.insert(id, value);
    }

    pub fn get(&self, id: &str) -> Option<&IndicatorValue> {
        self.0.get(id)
    }

    pub fn series(&self, id: &str) -> Option<&[f64]> {
        match self.0.get(id)? {
            IndicatorValue::Series(values) => Some(values),
            IndicatorValue::Scalar(_) => None,
        }
    }

    pub fn scalar(&self, id: &str) -> Option<f64> {
        match self.0.get(id)? {
            IndicatorValue::Scalar(value) => *value,
            IndicatorValue::Series(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no indicator carries any data
    pub fn is_empty(&self) -> bool {
        self.0.values().all(IndicatorValue::is_empty)
    }

    /// Ids that came back without data
    pub fn missing_ids(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndicatorValue)> {
        self.0.iter()
    }
}

/// Both horizons for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetIndicators {
    pub short: IndicatorBundle,
    pub long: IndicatorBundle,
}
