use super::plan::{Extraction, HorizonPlan};
use super::{IndicatorBundle, IndicatorValue};
use serde_json::Value;
use std::collections::HashMap;

/// Round to 4 decimal places
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Known shapes of a single indicator result
enum ResultShape<'a> {
    /// `{"value": ..., "valueMACD": ...}`
    Fields(&'a serde_json::Map<String, Value>),
    /// null, a bare number, a list, an error string...
    Unknown,
}

fn classify(data: Option<&Value>) -> ResultShape<'_> {
    match data {
        Some(Value::Object(map)) => ResultShape::Fields(map),
        _ => ResultShape::Unknown,
    }
}

/// Pull a list out of `data[key]`, rounding every number. Anything else yields an empty series.
pub fn extract_series(data: Option<&Value>, key: &str) -> Vec<f64> {
    match classify(data) {
        ResultShape::Fields(map) => match map.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_f64)
                .map(round4)
                .collect(),
            _ => Vec::new(),
        },
        ResultShape::Unknown => Vec::new(),
    }
}

/// Pull a single number out of `data[key]`, rounded.
pub fn extract_value(data: Option<&Value>, key: &str) -> Option<f64> {
    match classify(data) {
        ResultShape::Fields(map) => map.get(key).and_then(Value::as_f64).map(round4),
        ResultShape::Unknown => None,
    }
}

/// Build a bundle holding every indicator of `plan`, missing ones normalized to empty.
pub fn normalize_bundle(plan: &HorizonPlan, raw: &HashMap<String, Value>) -> IndicatorBundle {
    let mut bundle = IndicatorBundle::default();

    for spec in &plan.indicators {
        let data = raw.get(&spec.id);
        let value = match &spec.extraction {
            Extraction::Series(key) => IndicatorValue::Series(extract_series(data, key)),
            Extraction::Scalar(key) => IndicatorValue::Scalar(extract_value(data, key)),
        };
        bundle.insert(spec.id.clone(), value);
    }

    bundle
}
