use anyhow::Context;
use clap::{Parser, Subcommand};
use perpbot::api::taapi::{taapi_symbol, TaapiClient};
use perpbot::execution::OkxTranslator;
use perpbot::indicators::{
    IndicatorCache, IndicatorFetcher, IndicatorValue, LONG_INTERVAL, SHORT_INTERVAL,
};
use perpbot::persistence::{DiaryAction, DiaryFilter, TradeDiary};
use perpbot::Settings;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Indicator and OKX execution tooling", long_about = None)]
struct Cli {
    /// Settings file (defaults to perpbot.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch both indicator horizons for each asset
    Indicators {
        #[arg(required = true)]
        assets: Vec<String>,
    },
    /// Balance, equity and open positions
    Account,
    /// Price, funding rate and open interest (configured assets when none given)
    Market { assets: Vec<String> },
    /// Pending regular and algo orders
    Orders,
    /// Recent fills
    Fills {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Cancel every open order on an asset
    CancelAll { asset: String },
    /// Cancel orders and flatten the position on an asset
    Close { asset: String },
    /// Read the trade diary
    History {
        #[arg(long)]
        asset: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Check TAAPI and OKX connectivity
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Command::Indicators { assets } => show_indicators(&settings, &assets).await,
        Command::Account => show_account(&settings).await,
        Command::Market { assets } => {
            let assets = if assets.is_empty() {
                settings.assets.clone()
            } else {
                assets
            };
            show_market(&settings, &assets).await
        }
        Command::Orders => show_orders(&settings).await,
        Command::Fills { limit } => show_fills(&settings, limit).await,
        Command::CancelAll { asset } => {
            let translator = translator(&settings)?;
            let summary = translator.cancel_all_orders(&asset).await?;
            println!(
                "Cancelled {} orders on {} ({} regular, {} algo)",
                summary.total(),
                asset,
                summary.regular_cancelled,
                summary.algo_cancelled
            );
            Ok(())
        }
        Command::Close { asset } => close_position(&settings, &asset).await,
        Command::History {
            asset,
            action,
            limit,
        } => show_history(&settings, asset, action, limit).await,
        Command::Check => check_connections(&settings).await,
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpbot=info".into()),
        )
        .init();
}

fn translator(settings: &Settings) -> anyhow::Result<OkxTranslator> {
    OkxTranslator::from_settings(&settings.okx).context("failed to create OKX client")
}

async fn show_indicators(settings: &Settings, assets: &[String]) -> anyhow::Result<()> {
    let cache = IndicatorCache::shared(settings.taapi.cache_ttl());
    let fetcher = IndicatorFetcher::from_settings(&settings.taapi, cache)
        .context("failed to create TAAPI client")?;

    for asset in assets {
        match fetcher.fetch_asset_indicators(asset).await {
            Ok(indicators) => {
                println!("== {} ==", asset);
                for (label, bundle) in [
                    (SHORT_INTERVAL, &indicators.short),
                    (LONG_INTERVAL, &indicators.long),
                ] {
                    for (id, value) in bundle.iter() {
                        println!("  {:<3} {:<12} {}", label, id, format_value(value));
                    }
                }
            }
            Err(e) => tracing::error!("Indicators for {} failed: {}", asset, e),
        }
    }

    Ok(())
}

fn format_value(value: &IndicatorValue) -> String {
    match value {
        IndicatorValue::Scalar(Some(v)) => format!("{}", v),
        IndicatorValue::Scalar(None) => "-".to_string(),
        IndicatorValue::Series(values) if values.is_empty() => "-".to_string(),
        IndicatorValue::Series(values) => {
            let head: Vec<String> = values.iter().take(5).map(|v| v.to_string()).collect();
            format!("[{}{}]", head.join(", "), if values.len() > 5 { ", ..." } else { "" })
        }
    }
}

async fn show_account(settings: &Settings) -> anyhow::Result<()> {
    let snapshot = translator(settings)?.get_account_snapshot().await?;

    println!("Balance (USDT): {:.2}", snapshot.balance);
    println!("Total equity:   {:.2}", snapshot.total_equity);
    if snapshot.positions.is_empty() {
        println!("No open positions");
    }
    for position in &snapshot.positions {
        println!(
            "{:<6} qty {:>12.6} entry {:>10.4} mark {:>10.4} upl {:>9.2} lev {}",
            position.asset,
            position.signed_quantity,
            position.entry_price,
            position.mark_price,
            position.unrealized_pnl,
            position
                .leverage
                .map(|l| format!("{}x", l))
                .unwrap_or_else(|| "-".to_string())
        );
    }

    Ok(())
}

async fn show_market(settings: &Settings, assets: &[String]) -> anyhow::Result<()> {
    let translator = translator(settings)?;

    for asset in assets {
        let price = translator.get_current_price(asset).await;
        let funding = translator.get_funding_rate(asset).await;
        let open_interest = translator.get_open_interest(asset).await;
        println!(
            "{:<6} price {:>12.4} funding {:>10} oi {:>14}",
            asset,
            price,
            funding.map(|f| format!("{:.6}", f)).unwrap_or_else(|| "-".to_string()),
            open_interest
                .map(|oi| format!("{:.2}", oi))
                .unwrap_or_else(|| "-".to_string())
        );
    }

    Ok(())
}

async fn show_orders(settings: &Settings) -> anyhow::Result<()> {
    let orders = translator(settings)?.get_open_orders().await?;

    if orders.is_empty() {
        println!("No open orders");
    }
    for order in &orders {
        println!(
            "{:<6} {:<4} {:>12.6} {:<12} id {}{}{}",
            order.asset,
            order.side.as_str(),
            order.coin_size,
            order.order_type,
            order.order_id,
            order
                .price
                .map(|p| format!(" px {}", p))
                .unwrap_or_default(),
            order
                .trigger_price
                .map(|p| format!(" trigger {}", p))
                .unwrap_or_default()
        );
    }

    Ok(())
}

async fn show_fills(settings: &Settings, limit: usize) -> anyhow::Result<()> {
    let fills = translator(settings)?.get_recent_fills(limit).await?;

    for fill in &fills {
        println!(
            "{:<6} {:<4} {:>12.6} @ {:<12} ts {}",
            fill.asset,
            fill.side.as_str(),
            fill.coin_size,
            fill.price,
            fill.timestamp
                .map(|ts| ts.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    Ok(())
}

async fn close_position(settings: &Settings, asset: &str) -> anyhow::Result<()> {
    let translator = translator(settings)?;
    let price = translator.get_current_price(asset).await;
    let closed = translator.close_position(asset).await?;

    if closed.is_empty() {
        println!("No open position on {}", asset);
        return Ok(());
    }

    let diary = TradeDiary::new(&settings.diary_path);
    for position in &closed {
        let mut entry = perpbot::persistence::DiaryEntry::new(
            asset,
            DiaryAction::Close,
            position.signed_quantity.abs(),
        )
        .with_note("manual close");
        entry.price = (price > 0.0).then_some(price);
        diary
            .append(&entry)
            .await
            .context("failed to record close in diary")?;
        println!("Closed {} {}", asset, position.signed_quantity);
    }

    Ok(())
}

async fn show_history(
    settings: &Settings,
    asset: Option<String>,
    action: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let action = match action {
        Some(value) => Some(
            DiaryAction::parse(&value)
                .with_context(|| format!("unknown action '{}' (buy, sell, hold, close)", value))?,
        ),
        None => None,
    };

    let diary = TradeDiary::new(&settings.diary_path);
    let entries = diary
        .read(&DiaryFilter {
            asset,
            action,
            limit,
        })
        .await?;

    if entries.is_empty() {
        println!("No diary entries in {}", diary.path().display());
    }
    for entry in &entries {
        println!("{}", serde_json::to_string(entry)?);
    }

    Ok(())
}

async fn check_connections(settings: &Settings) -> anyhow::Result<()> {
    let mut healthy = true;

    match TaapiClient::from_settings(&settings.taapi) {
        Ok(client) => {
            let price = client
                .fetch_value("price", &taapi_symbol("BTC"), "1h", &[], "value")
                .await;
            match price {
                Some(price) => println!("TAAPI: ok (BTC {})", price),
                None => {
                    healthy = false;
                    println!("TAAPI: no data returned");
                }
            }
        }
        Err(e) => {
            healthy = false;
            println!("TAAPI: {}", e);
        }
    }

    match OkxTranslator::from_settings(&settings.okx) {
        Ok(translator) => {
            match translator.instrument_count().await {
                Ok(count) => println!("OKX public: ok ({} swap instruments)", count),
                Err(e) => {
                    healthy = false;
                    println!("OKX public: {}", e);
                }
            }
            match translator.get_account_snapshot().await {
                Ok(snapshot) => println!(
                    "OKX account: ok (equity {:.2}, {} positions)",
                    snapshot.total_equity,
                    snapshot.positions.len()
                ),
                Err(e) => {
                    healthy = false;
                    println!("OKX account: {}", e);
                }
            }
        }
        Err(e) => {
            healthy = false;
            println!("OKX: {}", e);
        }
    }

    if !healthy {
        anyhow::bail!("connectivity check failed");
    }
    Ok(())
}
