use super::order_ids::extract_order_handles;
use super::session::{ExchangeSession, PositionMode};
use super::symbols::{to_coin, to_instrument_id};
use crate::api::okx::{
    AccountConfigRow, AlgoOrderRow, BalanceRow, FillRow, FundingRateRow, InstrumentRow,
    OkxClient, OpenInterestRow, PendingOrderRow, PositionRow, TickerRow,
};
use crate::config::OkxSettings;
use crate::error::{Error, Result};
use crate::models::{
    AccountSnapshot, CancelAllSummary, ExecutionReport, Fill, Order, OrderHandle, OrderIntent,
    OrderKind, PlacedOrder, PositionSnapshot, Side, TradeIntent,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 20;
const MAX_FILLS: usize = 100;
const BATCH_CANCEL_LIMIT: usize = 20;
const ALGO_CANCEL_LIMIT: usize = 10;
const TRADE_MODE: &str = "cross";
// Absorbs float noise such as 0.3 / 0.1 = 2.9999999999999996
const CONTRACT_EPSILON: f64 = 1e-9;

/// Convert a coin amount into whole contracts, rounding down
pub fn coins_to_contracts(coin_amount: f64, contract_value: f64) -> u64 {
    if coin_amount.is_nan() || coin_amount <= 0.0 || contract_value.is_nan() || contract_value <= 0.0 {
        return 0;
    }
    (coin_amount / contract_value + CONTRACT_EPSILON).floor() as u64
}

#[derive(Debug, Clone, Copy)]
enum Protective {
    TakeProfit,
    StopLoss,
}

impl Protective {
    fn label(&self) -> &'static str {
        match self {
            Protective::TakeProfit => "take profit",
            Protective::StopLoss => "stop loss",
        }
    }

    fn trigger_fields(&self) -> (&'static str, &'static str) {
        match self {
            Protective::TakeProfit => ("tpTriggerPx", "tpOrdPx"),
            Protective::StopLoss => ("slTriggerPx", "slOrdPx"),
        }
    }
}

/// Maps coin-denominated intents onto OKX perpetual swap orders
///
/// Holds the signed transport plus the shared [`ExchangeSession`]. Sizes are
/// converted with the instrument's contract value; the account position mode
/// decides whether orders carry `posSide`.
#[derive(Clone)]
pub struct OkxTranslator {
    client: OkxClient,
    session: Arc<ExchangeSession>,
}

impl OkxTranslator {
    pub fn new(client: OkxClient, session: Arc<ExchangeSession>) -> Self {
        Self { client, session }
    }

    pub fn from_settings(settings: &OkxSettings) -> Result<Self> {
        let client = OkxClient::from_settings(settings)?;
        Ok(Self::new(client, Arc::new(ExchangeSession::new())))
    }

    // ============== Session state ==============

    async fn ensure_position_mode(&self) -> PositionMode {
        let client = &self.client;
        self.session
            .resolve_position_mode(|| async move {
                let rows: Vec<AccountConfigRow> =
                    client.get_data("/api/v5/account/config", &[]).await?;
                Ok::<_, Error>(
                    rows.first()
                        .and_then(|row| PositionMode::from_okx(&row.pos_mode)),
                )
            })
            .await
    }

    async fn contract_value(&self, inst_id: &str) -> Result<f64> {
        if let Some(value) = self.session.contract_value(inst_id).await {
            return Ok(value);
        }

        let rows: Vec<InstrumentRow> = self
            .client
            .get_data(
                "/api/v5/public/instruments",
                &[
                    ("instType", "SWAP".to_string()),
                    ("instId", inst_id.to_string()),
                ],
            )
            .await?;

        let value = rows
            .iter()
            .find(|row| row.inst_id == inst_id)
            .map(|row| row.ct_val)
            .filter(|value| *value > 0.0)
            .ok_or_else(|| {
                Error::UnexpectedResponse(format!("no contract value listed for {}", inst_id))
            })?;

        tracing::debug!(inst_id, contract_value = value, "Loaded contract value");
        self.session.store_contract_value(inst_id, value).await;
        Ok(value)
    }

    async fn contracts_for(&self, asset: &str, inst_id: &str, coin_amount: f64) -> Result<u64> {
        let contract_value = self.contract_value(inst_id).await?;
        let contracts = coins_to_contracts(coin_amount, contract_value);

        if contracts == 0 {
            tracing::warn!(
                "Amount {} is too small for {} (contract value {})",
                coin_amount,
                inst_id,
                contract_value
            );
            return Err(Error::SizeTooSmall {
                asset: asset.to_string(),
                coin_amount,
                contract_value,
            });
        }

        Ok(contracts)
    }

    // ============== Account ==============

    pub async fn get_account_snapshot(&self) -> Result<AccountSnapshot> {
        let balances: Vec<BalanceRow> = self
            .client
            .get_data("/api/v5/account/balance", &[("ccy", "USDT".to_string())])
            .await?;

        let (balance, total_equity) = match balances.first() {
            Some(row) => {
                let usdt = row.details.iter().find(|d| d.ccy == "USDT");
                let balance = usdt.map(|d| d.avail_bal).unwrap_or(0.0);
                let total_equity = if row.total_eq != 0.0 {
                    row.total_eq
                } else {
                    usdt.map(|d| d.eq).unwrap_or(0.0)
                };
                (balance, total_equity)
            }
            None => (0.0, 0.0),
        };

        let rows: Vec<PositionRow> = self
            .client
            .get_data("/api/v5/account/positions", &[("instType", "SWAP".to_string())])
            .await?;

        let mut positions = Vec::new();
        for row in rows.iter().filter(|row| row.pos != 0.0) {
            let contract_value = self.contract_value(&row.inst_id).await?;
            positions.push(position_snapshot(row, contract_value));
        }

        Ok(AccountSnapshot {
            balance,
            total_equity,
            positions,
        })
    }

    /// Last traded price, 0.0 when unavailable
    pub async fn get_current_price(&self, asset: &str) -> f64 {
        let inst_id = to_instrument_id(asset);
        let result: Result<Vec<TickerRow>> = self
            .client
            .get_data("/api/v5/market/ticker", &[("instId", inst_id.clone())])
            .await;

        match result {
            Ok(rows) => rows.first().and_then(|row| row.last).unwrap_or(0.0),
            Err(e) => {
                tracing::warn!("Failed to fetch price for {}: {}", inst_id, e);
                0.0
            }
        }
    }

    pub async fn get_open_interest(&self, asset: &str) -> Option<f64> {
        let inst_id = to_instrument_id(asset);
        let result: Result<Vec<OpenInterestRow>> = self
            .client
            .get_data(
                "/api/v5/public/open-interest",
                &[("instType", "SWAP".to_string()), ("instId", inst_id.clone())],
            )
            .await;

        match result {
            Ok(rows) => rows.first().and_then(|row| row.oi_ccy),
            Err(e) => {
                tracing::debug!("Open interest unavailable for {}: {}", inst_id, e);
                None
            }
        }
    }

    pub async fn get_funding_rate(&self, asset: &str) -> Option<f64> {
        let inst_id = to_instrument_id(asset);
        let result: Result<Vec<FundingRateRow>> = self
            .client
            .get_data("/api/v5/public/funding-rate", &[("instId", inst_id.clone())])
            .await;

        match result {
            Ok(rows) => rows.first().and_then(|row| row.funding_rate),
            Err(e) => {
                tracing::debug!("Funding rate unavailable for {}: {}", inst_id, e);
                None
            }
        }
    }

    /// Number of listed swap instruments
    pub async fn instrument_count(&self) -> Result<usize> {
        let rows: Vec<InstrumentRow> = self
            .client
            .get_data("/api/v5/public/instruments", &[("instType", "SWAP".to_string())])
            .await?;
        Ok(rows.len())
    }

    // ============== Placement ==============

    /// Market order sized in coins. Fails with [`Error::SizeTooSmall`] before
    /// anything is sent when the amount rounds down to zero contracts.
    pub async fn place_market_order(
        &self,
        asset: &str,
        side: Side,
        coin_amount: f64,
    ) -> Result<PlacedOrder> {
        let inst_id = to_instrument_id(asset);
        let contracts = self.contracts_for(asset, &inst_id, coin_amount).await?;
        let mode = self.ensure_position_mode().await;

        let mut body = json!({
            "instId": inst_id,
            "tdMode": TRADE_MODE,
            "side": side.as_str(),
            "ordType": "market",
            "sz": contracts.to_string(),
        });
        if mode.requires_pos_side() {
            body["posSide"] = json!(side.position_side());
        }

        let raw = self.client.post("/api/v5/trade/order", &body).await?;
        let handles = extract_order_handles(&raw);

        tracing::info!(
            asset,
            %side,
            contracts,
            order_ids = ?handles.iter().map(|h| &h.order_id).collect::<Vec<_>>(),
            "Market order placed"
        );

        Ok(PlacedOrder { handles, raw })
    }

    pub async fn place_take_profit(
        &self,
        asset: &str,
        was_long: bool,
        coin_amount: f64,
        trigger_price: f64,
    ) -> Result<PlacedOrder> {
        self.place_protective(Protective::TakeProfit, asset, was_long, coin_amount, trigger_price)
            .await
    }

    pub async fn place_stop_loss(
        &self,
        asset: &str,
        was_long: bool,
        coin_amount: f64,
        trigger_price: f64,
    ) -> Result<PlacedOrder> {
        self.place_protective(Protective::StopLoss, asset, was_long, coin_amount, trigger_price)
            .await
    }

    /// Conditional algo order closing the `was_long` position, market price on trigger
    async fn place_protective(
        &self,
        kind: Protective,
        asset: &str,
        was_long: bool,
        coin_amount: f64,
        trigger_price: f64,
    ) -> Result<PlacedOrder> {
        if trigger_price.is_nan() || trigger_price <= 0.0 {
            return Err(Error::InvalidOrder(format!(
                "{} trigger price must be positive, got {}",
                kind.label(),
                trigger_price
            )));
        }

        let inst_id = to_instrument_id(asset);
        let contracts = self.contracts_for(asset, &inst_id, coin_amount).await?;
        let mode = self.ensure_position_mode().await;

        let position_side = if was_long { Side::Buy } else { Side::Sell };
        let (trigger_field, price_field) = kind.trigger_fields();

        let mut body = json!({
            "instId": inst_id,
            "tdMode": TRADE_MODE,
            "side": position_side.opposite().as_str(),
            "ordType": "conditional",
            "sz": contracts.to_string(),
        });
        body[trigger_field] = json!(trigger_price.to_string());
        body[price_field] = json!("-1");
        if mode.requires_pos_side() {
            body["posSide"] = json!(position_side.position_side());
        }

        let raw = self
            .client
            .post("/api/v5/trade/order-algo", &body)
            .await
            .inspect_err(|e| tracing::error!("Error placing {} for {}: {}", kind.label(), asset, e))?;
        let handles = extract_order_handles(&raw);

        tracing::info!(
            asset,
            was_long,
            contracts,
            trigger_price,
            "{} order placed",
            kind.label()
        );

        Ok(PlacedOrder { handles, raw })
    }

    /// Dispatch a single [`OrderIntent`]
    pub async fn place(&self, intent: &OrderIntent) -> Result<PlacedOrder> {
        let was_long = intent.side == Side::Buy;
        match intent.kind {
            OrderKind::Market => {
                self.place_market_order(&intent.asset, intent.side, intent.coin_amount)
                    .await
            }
            OrderKind::TakeProfit { trigger_price } => {
                self.place_take_profit(&intent.asset, was_long, intent.coin_amount, trigger_price)
                    .await
            }
            OrderKind::StopLoss { trigger_price } => {
                self.place_stop_loss(&intent.asset, was_long, intent.coin_amount, trigger_price)
                    .await
            }
        }
    }

    /// Market entry followed by the optional protective orders
    ///
    /// An entry failure propagates. TP/SL failures are recorded in the report,
    /// since the entry has already been filled at that point.
    pub async fn execute_intent(&self, intent: &TradeIntent) -> Result<ExecutionReport> {
        let entry = self
            .place_market_order(&intent.asset, intent.side, intent.coin_amount)
            .await?;
        let was_long = intent.side == Side::Buy;

        let mut report = ExecutionReport {
            entry,
            take_profit: None,
            stop_loss: None,
            protective_errors: Vec::new(),
        };

        if let Some(price) = intent.take_profit_price {
            match self
                .place_take_profit(&intent.asset, was_long, intent.coin_amount, price)
                .await
            {
                Ok(placed) => report.take_profit = Some(placed),
                Err(e) => {
                    tracing::error!("Take profit failed for {} after entry: {}", intent.asset, e);
                    report.protective_errors.push(format!("take profit: {}", e));
                }
            }
        }

        if let Some(price) = intent.stop_loss_price {
            match self
                .place_stop_loss(&intent.asset, was_long, intent.coin_amount, price)
                .await
            {
                Ok(placed) => report.stop_loss = Some(placed),
                Err(e) => {
                    tracing::error!("Stop loss failed for {} after entry: {}", intent.asset, e);
                    report.protective_errors.push(format!("stop loss: {}", e));
                }
            }
        }

        Ok(report)
    }

    // ============== Cancellation ==============

    /// Cancel as a regular order, falling back to the algo endpoint when the
    /// exchange rejects the id. Transport failures surface immediately.
    pub async fn cancel_order(&self, asset: &str, order_id: &str) -> Result<OrderHandle> {
        let inst_id = to_instrument_id(asset);

        let regular = self
            .client
            .post(
                "/api/v5/trade/cancel-order",
                &json!({"instId": inst_id, "ordId": order_id}),
            )
            .await;

        match regular {
            Ok(_) => {
                tracing::info!(asset, order_id, "Order cancelled");
                Ok(OrderHandle {
                    order_id: order_id.to_string(),
                    is_algo: false,
                })
            }
            Err(e) if e.is_exchange_rejection() => {
                tracing::debug!("Regular cancel of {} rejected ({}), trying algo cancel", order_id, e);
                self.client
                    .post(
                        "/api/v5/trade/cancel-algos",
                        &json!([{"instId": inst_id, "algoId": order_id}]),
                    )
                    .await
                    .inspect_err(|e| tracing::error!("Error cancelling order {}: {}", order_id, e))?;

                tracing::info!(asset, order_id, "Algo order cancelled");
                Ok(OrderHandle {
                    order_id: order_id.to_string(),
                    is_algo: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel every regular and algo order on the asset's instrument
    pub async fn cancel_all_orders(&self, asset: &str) -> Result<CancelAllSummary> {
        let inst_id = to_instrument_id(asset);
        let mut summary = CancelAllSummary::default();

        let pending: Vec<PendingOrderRow> = self
            .paginate(
                "/api/v5/trade/orders-pending",
                &[("instType", "SWAP".to_string()), ("instId", inst_id.clone())],
                |row: &PendingOrderRow| row.ord_id.clone(),
            )
            .await?;

        for chunk in pending.chunks(BATCH_CANCEL_LIMIT) {
            let body: Vec<Value> = chunk
                .iter()
                .map(|row| json!({"instId": inst_id, "ordId": row.ord_id}))
                .collect();
            self.client
                .post("/api/v5/trade/cancel-batch-orders", &Value::Array(body))
                .await?;
            summary.regular_cancelled += chunk.len();
        }

        let algos: Vec<AlgoOrderRow> = self
            .paginate(
                "/api/v5/trade/orders-algo-pending",
                &[
                    ("instType", "SWAP".to_string()),
                    ("ordType", "conditional".to_string()),
                    ("instId", inst_id.clone()),
                ],
                |row: &AlgoOrderRow| row.algo_id.clone(),
            )
            .await?;

        for chunk in algos.chunks(ALGO_CANCEL_LIMIT) {
            let body: Vec<Value> = chunk
                .iter()
                .map(|row| json!({"instId": inst_id, "algoId": row.algo_id}))
                .collect();
            self.client
                .post("/api/v5/trade/cancel-algos", &Value::Array(body))
                .await?;
            summary.algo_cancelled += chunk.len();
        }

        tracing::info!(
            asset,
            regular = summary.regular_cancelled,
            algo = summary.algo_cancelled,
            "Cancelled open orders"
        );

        Ok(summary)
    }

    /// Cancel the asset's orders, then flatten every open position on it.
    /// Returns the positions that were closed.
    pub async fn close_position(&self, asset: &str) -> Result<Vec<PositionSnapshot>> {
        let inst_id = to_instrument_id(asset);
        self.cancel_all_orders(asset).await?;

        let rows: Vec<PositionRow> = self
            .client
            .get_data(
                "/api/v5/account/positions",
                &[("instType", "SWAP".to_string()), ("instId", inst_id.clone())],
            )
            .await?;

        let open: Vec<&PositionRow> = rows.iter().filter(|row| row.pos != 0.0).collect();
        if open.is_empty() {
            tracing::info!("No open position on {}", inst_id);
            return Ok(Vec::new());
        }

        let mode = self.ensure_position_mode().await;
        let contract_value = self.contract_value(&inst_id).await?;
        let mut closed = Vec::with_capacity(open.len());

        for row in open {
            let margin_mode = if row.mgn_mode.is_empty() {
                TRADE_MODE
            } else {
                row.mgn_mode.as_str()
            };
            let mut body = json!({"instId": inst_id, "mgnMode": margin_mode});
            if mode.requires_pos_side() && matches!(row.pos_side.as_str(), "long" | "short") {
                body["posSide"] = json!(row.pos_side);
            }

            self.client.post("/api/v5/trade/close-position", &body).await?;

            let snapshot = position_snapshot(row, contract_value);
            tracing::info!(
                asset,
                quantity = snapshot.signed_quantity,
                "Position closed"
            );
            closed.push(snapshot);
        }

        Ok(closed)
    }

    // ============== Enumeration ==============

    /// Pending regular and conditional algo orders across all swaps
    pub async fn get_open_orders(&self) -> Result<Vec<Order>> {
        let regular: Vec<PendingOrderRow> = self
            .paginate(
                "/api/v5/trade/orders-pending",
                &[("instType", "SWAP".to_string())],
                |row: &PendingOrderRow| row.ord_id.clone(),
            )
            .await?;

        let algos: Vec<AlgoOrderRow> = self
            .paginate(
                "/api/v5/trade/orders-algo-pending",
                &[
                    ("instType", "SWAP".to_string()),
                    ("ordType", "conditional".to_string()),
                ],
                |row: &AlgoOrderRow| row.algo_id.clone(),
            )
            .await?;

        let mut orders = Vec::with_capacity(regular.len() + algos.len());

        for row in &regular {
            let Some(side) = Side::parse(&row.side) else {
                tracing::warn!("Skipping order {} with side {:?}", row.ord_id, row.side);
                continue;
            };
            let contract_value = self.contract_value(&row.inst_id).await?;
            orders.push(Order {
                asset: to_coin(&row.inst_id).to_string(),
                order_id: row.ord_id.clone(),
                is_algo: false,
                side,
                coin_size: row.sz * contract_value,
                price: row.px.filter(|px| *px > 0.0),
                trigger_price: None,
                order_type: row.ord_type.clone(),
            });
        }

        for row in &algos {
            let Some(side) = Side::parse(&row.side) else {
                tracing::warn!("Skipping algo order {} with side {:?}", row.algo_id, row.side);
                continue;
            };
            let contract_value = self.contract_value(&row.inst_id).await?;
            orders.push(Order {
                asset: to_coin(&row.inst_id).to_string(),
                order_id: row.algo_id.clone(),
                is_algo: true,
                side,
                coin_size: row.sz * contract_value,
                // -1 means market on trigger
                price: row.ord_px.filter(|px| *px > 0.0),
                trigger_price: row.tp_trigger_px.or(row.sl_trigger_px),
                order_type: row.ord_type.clone(),
            });
        }

        Ok(orders)
    }

    /// Most recent fills, sizes in coins
    pub async fn get_recent_fills(&self, limit: usize) -> Result<Vec<Fill>> {
        let limit = limit.clamp(1, MAX_FILLS);
        let rows: Vec<FillRow> = self
            .client
            .get_data(
                "/api/v5/trade/fills",
                &[("instType", "SWAP".to_string()), ("limit", limit.to_string())],
            )
            .await?;

        let mut fills = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(side) = Side::parse(&row.side) else {
                continue;
            };
            let contract_value = self.contract_value(&row.inst_id).await?;
            fills.push(Fill {
                asset: to_coin(&row.inst_id).to_string(),
                side,
                coin_size: row.fill_sz * contract_value,
                price: row.fill_px,
                timestamp: row.ts.parse().ok(),
                order_id: non_empty(&row.ord_id),
                trade_id: non_empty(&row.trade_id),
            });
        }

        Ok(fills)
    }

    /// Follow the `after` cursor until a short page or the page cap
    async fn paginate<T, F>(
        &self,
        path: &str,
        query: &[(&str, String)],
        cursor_of: F,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> String,
    {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut page_query = query.to_vec();
            page_query.push(("limit", PAGE_SIZE.to_string()));
            if let Some(after) = &cursor {
                page_query.push(("after", after.clone()));
            }

            let page: Vec<T> = self.client.get_data(path, &page_query).await?;
            let page_len = page.len();
            cursor = page.last().map(&cursor_of);
            rows.extend(page);

            if page_len < PAGE_SIZE || cursor.is_none() {
                return Ok(rows);
            }
        }

        tracing::warn!("Stopped paging {} after {} pages", path, MAX_PAGES);
        Ok(rows)
    }
}

fn position_snapshot(row: &PositionRow, contract_value: f64) -> PositionSnapshot {
    let sign = match row.pos_side.as_str() {
        "long" => 1.0,
        "short" => -1.0,
        _ => row.pos.signum(),
    };

    PositionSnapshot {
        asset: to_coin(&row.inst_id).to_string(),
        signed_quantity: sign * row.pos.abs() * contract_value,
        entry_price: row.avg_px,
        mark_price: row.mark_px,
        unrealized_pnl: row.upl,
        leverage: row.lever,
        liquidation_price: row.liq_px,
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins_to_contracts_floors() {
        assert_eq!(coins_to_contracts(0.035, 0.01), 3);
        assert_eq!(coins_to_contracts(0.3, 0.1), 3);
        assert_eq!(coins_to_contracts(1.99, 1.0), 1);
        assert_eq!(coins_to_contracts(0.009, 0.01), 0);
        assert_eq!(coins_to_contracts(0.25, 0.01), 25);
        assert_eq!(coins_to_contracts(0.001, 1.0), 0);
    }

    #[test]
    fn test_coins_to_contracts_degenerate() {
        assert_eq!(coins_to_contracts(0.0, 0.01), 0);
        assert_eq!(coins_to_contracts(-1.0, 0.01), 0);
        assert_eq!(coins_to_contracts(1.0, 0.0), 0);
        assert_eq!(coins_to_contracts(f64::NAN, 0.01), 0);
    }

    #[test]
    fn test_position_snapshot_sign() {
        let row = |pos: f64, pos_side: &str| PositionRow {
            inst_id: "ETH-USDT-SWAP".to_string(),
            pos,
            pos_side: pos_side.to_string(),
            mgn_mode: "cross".to_string(),
            avg_px: 3000.0,
            mark_px: 3010.0,
            upl: 1.0,
            lever: Some(5.0),
            liq_px: 0.0,
        };

        assert_eq!(position_snapshot(&row(-4.0, "net"), 0.1).signed_quantity, -0.4);
        assert_eq!(position_snapshot(&row(4.0, "short"), 0.1).signed_quantity, -0.4);
        assert_eq!(position_snapshot(&row(2.0, "long"), 0.1).signed_quantity, 0.2);
        assert_eq!(position_snapshot(&row(2.0, "net"), 0.1).asset, "ETH");
    }
}
