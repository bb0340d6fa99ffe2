// Order execution against OKX perpetual swaps
pub mod order_ids;
pub mod session;
pub mod symbols;
pub mod translator;

pub use order_ids::{extract_order_handles, extract_order_ids};
pub use session::{ExchangeSession, PositionMode};
pub use symbols::{to_coin, to_instrument_id, to_unified_symbol};
pub use translator::{coins_to_contracts, OkxTranslator};
