use serde::Serialize;

/// Short analysis horizon (decision cadence)
pub const SHORT_INTERVAL: &str = "5m";
/// Long analysis horizon (structural context), independent of the trading loop interval
pub const LONG_INTERVAL: &str = "4h";

/// How a normalized value is pulled out of one indicator result
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// `result[key]` is a list, most recent first
    Series(String),
    /// `result[key]` is a single number
    Scalar(String),
}

/// One named indicator inside a bulk construct
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSpec {
    pub id: String,
    pub indicator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrack: Option<u32>,
    #[serde(skip)]
    pub extraction: Extraction,
}

impl IndicatorSpec {
    pub fn series(id: &str, indicator: &str, key: &str) -> Self {
        Self::with_extraction(id, indicator, Extraction::Series(key.to_string()))
    }

    pub fn scalar(id: &str, indicator: &str, key: &str) -> Self {
        Self::with_extraction(id, indicator, Extraction::Scalar(key.to_string()))
    }

    fn with_extraction(id: &str, indicator: &str, extraction: Extraction) -> Self {
        Self {
            id: id.to_string(),
            indicator: indicator.to_string(),
            period: None,
            results: None,
            backtrack: None,
            extraction,
        }
    }

    pub fn period(mut self, period: u32) -> Self {
        self.period = Some(period);
        self
    }

    pub fn results(mut self, results: u32) -> Self {
        self.results = Some(results);
        self
    }

    pub fn backtrack(mut self, backtrack: u32) -> Self {
        self.backtrack = Some(backtrack);
        self
    }

    /// Calculation units billed by the provider: one per returned result
    pub fn calculation_units(&self) -> u32 {
        self.results.unwrap_or(1).max(1)
    }
}

/// The indicators requested together for one horizon
#[derive(Debug, Clone)]
pub struct HorizonPlan {
    pub interval: String,
    pub indicators: Vec<IndicatorSpec>,
}

impl HorizonPlan {
    pub fn new(interval: &str, indicators: Vec<IndicatorSpec>) -> Self {
        Self {
            interval: interval.to_string(),
            indicators,
        }
    }

    /// Intraday momentum bundle: 4 indicators x 5 results = 20 units (free-plan cap)
    pub fn short_term() -> Self {
        Self::new(
            SHORT_INTERVAL,
            vec![
                IndicatorSpec::series("ema20", "ema", "value").period(20).results(5),
                IndicatorSpec::series("macd", "macd", "valueMACD").results(5),
                IndicatorSpec::series("rsi7", "rsi", "value").period(7).results(5),
                IndicatorSpec::series("rsi14", "rsi", "value").period(14).results(5),
            ],
        )
    }

    /// Structural bundle: 4 scalars + 2 series of 5 = 14 units
    pub fn long_term() -> Self {
        Self::new(
            LONG_INTERVAL,
            vec![
                IndicatorSpec::scalar("ema20", "ema", "value").period(20),
                IndicatorSpec::scalar("ema50", "ema", "value").period(50),
                IndicatorSpec::scalar("atr3", "atr", "value").period(3),
                IndicatorSpec::scalar("atr14", "atr", "value").period(14),
                IndicatorSpec::series("macd", "macd", "valueMACD").results(5),
                IndicatorSpec::series("rsi14", "rsi", "value").period(14).results(5),
            ],
        )
    }

    pub fn calculation_units(&self) -> u32 {
        self.indicators.iter().map(IndicatorSpec::calculation_units).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plans_fit_free_tier() {
        assert_eq!(HorizonPlan::short_term().calculation_units(), 20);
        assert_eq!(HorizonPlan::long_term().calculation_units(), 14);
        assert_eq!(HorizonPlan::short_term().interval, "5m");
        assert_eq!(HorizonPlan::long_term().interval, "4h");
    }

    #[test]
    fn test_spec_serializes_only_present_fields() {
        let spec = IndicatorSpec::scalar("atr3", "atr", "value").period(3);
        let json = serde_json::to_value(&spec).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"id": "atr3", "indicator": "atr", "period": 3})
        );
    }
}
