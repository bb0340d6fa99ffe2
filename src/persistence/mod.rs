use crate::error::Result;
use crate::models::{ExecutionReport, Side, TradeIntent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiaryAction {
    Buy,
    Sell,
    Hold,
    Close,
}

impl DiaryAction {
    pub fn parse(value: &str) -> Option<DiaryAction> {
        match value.to_ascii_lowercase().as_str() {
            "buy" => Some(DiaryAction::Buy),
            "sell" => Some(DiaryAction::Sell),
            "hold" => Some(DiaryAction::Hold),
            "close" => Some(DiaryAction::Close),
            _ => None,
        }
    }
}

impl From<Side> for DiaryAction {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => DiaryAction::Buy,
            Side::Sell => DiaryAction::Sell,
        }
    }
}

/// One line of the trade diary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiaryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    pub action: DiaryAction,
    pub coin_amount: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub order_ids: Vec<String>,
    #[serde(default)]
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

impl DiaryEntry {
    pub fn new(asset: &str, action: DiaryAction, coin_amount: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            asset: asset.to_string(),
            action,
            coin_amount,
            price: None,
            order_ids: Vec::new(),
            take_profit_price: None,
            stop_loss_price: None,
            note: None,
        }
    }

    /// Record of an executed intent
    pub fn from_execution(intent: &TradeIntent, report: &ExecutionReport, price: Option<f64>) -> Self {
        let mut entry = Self::new(&intent.asset, intent.side.into(), intent.coin_amount);
        entry.price = price.filter(|p| *p > 0.0);
        entry.order_ids = report.order_ids();
        entry.take_profit_price = report.take_profit.as_ref().and(intent.take_profit_price);
        entry.stop_loss_price = report.stop_loss.as_ref().and(intent.stop_loss_price);
        if !report.protective_errors.is_empty() {
            entry.note = Some(report.protective_errors.join("; "));
        }
        entry
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DiaryFilter {
    pub asset: Option<String>,
    pub action: Option<DiaryAction>,
    pub limit: usize,
}

impl Default for DiaryFilter {
    fn default() -> Self {
        Self {
            asset: None,
            action: None,
            limit: 100,
        }
    }
}

impl DiaryFilter {
    fn matches(&self, entry: &DiaryEntry) -> bool {
        self.asset.as_deref().map_or(true, |asset| entry.asset == asset)
            && self.action.map_or(true, |action| entry.action == action)
    }
}

/// Append-only JSONL trade diary
pub struct TradeDiary {
    path: PathBuf,
}

impl TradeDiary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &DiaryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(asset = %entry.asset, action = ?entry.action, "Diary entry appended");
        Ok(())
    }

    /// Last `filter.limit` matching entries, oldest first.
    /// A missing diary reads as empty; malformed lines are skipped.
    pub async fn read(&self, filter: &DiaryFilter) -> Result<Vec<DiaryEntry>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut skipped = 0usize;
        let mut entries: Vec<DiaryEntry> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match serde_json::from_str::<DiaryEntry>(line) {
                Ok(entry) => Some(entry),
                Err(_) => {
                    skipped += 1;
                    None
                }
            })
            .filter(|entry| filter.matches(entry))
            .collect();

        if skipped > 0 {
            tracing::warn!("Skipped {} malformed diary lines in {}", skipped, self.path.display());
        }

        let excess = entries.len().saturating_sub(filter.limit);
        entries.drain(..excess);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(asset: &str, action: DiaryAction, amount: f64) -> DiaryEntry {
        DiaryEntry::new(asset, action, amount)
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let diary = TradeDiary::new(dir.path().join("diary.jsonl"));

        let entries = diary.read(&DiaryFilter::default()).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_append_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let diary = TradeDiary::new(dir.path().join("data/nested/diary.jsonl"));

        diary.append(&entry("BTC", DiaryAction::Buy, 0.01)).await.unwrap();

        let entries = diary.read(&DiaryFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].asset, "BTC");
    }

    #[tokio::test]
    async fn test_filters_and_limit_keep_latest() {
        let dir = TempDir::new().unwrap();
        let diary = TradeDiary::new(dir.path().join("diary.jsonl"));

        for (asset, action, amount) in [
            ("BTC", DiaryAction::Buy, 1.0),
            ("ETH", DiaryAction::Buy, 2.0),
            ("BTC", DiaryAction::Hold, 0.0),
            ("BTC", DiaryAction::Buy, 3.0),
            ("BTC", DiaryAction::Buy, 4.0),
        ] {
            diary.append(&entry(asset, action, amount)).await.unwrap();
        }

        let filter = DiaryFilter {
            asset: Some("BTC".to_string()),
            action: Some(DiaryAction::Buy),
            limit: 2,
        };
        let entries = diary.read(&filter).await.unwrap();

        let amounts: Vec<f64> = entries.iter().map(|e| e.coin_amount).collect();
        assert_eq!(amounts, vec![3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diary.jsonl");
        let diary = TradeDiary::new(&path);

        diary.append(&entry("SOL", DiaryAction::Sell, 5.0)).await.unwrap();
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{not json\n\n");
        tokio::fs::write(&path, contents).await.unwrap();
        diary.append(&entry("SOL", DiaryAction::Close, 5.0)).await.unwrap();

        let entries = diary.read(&DiaryFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, DiaryAction::Close);
    }

    #[test]
    fn test_entry_from_execution() {
        use crate::models::{OrderHandle, PlacedOrder};

        let placed = |id: &str, is_algo| PlacedOrder {
            handles: vec![OrderHandle {
                order_id: id.to_string(),
                is_algo,
            }],
            raw: serde_json::Value::Null,
        };
        let intent = TradeIntent {
            asset: "ETH".to_string(),
            side: Side::Sell,
            coin_amount: 1.5,
            take_profit_price: Some(2800.0),
            stop_loss_price: Some(3300.0),
        };
        let report = ExecutionReport {
            entry: placed("e1", false),
            take_profit: Some(placed("tp1", true)),
            stop_loss: None,
            protective_errors: vec!["stop loss: exchange error 51277: rejected".to_string()],
        };

        let entry = DiaryEntry::from_execution(&intent, &report, Some(3000.0));

        assert_eq!(entry.action, DiaryAction::Sell);
        assert_eq!(entry.order_ids, vec!["e1", "tp1"]);
        assert_eq!(entry.take_profit_price, Some(2800.0));
        assert_eq!(entry.stop_loss_price, None);
        assert!(entry.note.unwrap().contains("51277"));
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(DiaryAction::parse("HOLD"), Some(DiaryAction::Hold));
        assert_eq!(DiaryAction::parse("short"), None);
        assert_eq!(DiaryAction::from(Side::Sell), DiaryAction::Sell);
    }
}
