// Asset <-> exchange symbol mapping for USDT-margined perpetual swaps

const SWAP_SUFFIX: &str = "-USDT-SWAP";
const UNIFIED_SUFFIX: &str = "/USDT:USDT";

/// "BTC" -> "BTC-USDT-SWAP"; instrument ids pass through unchanged
pub fn to_instrument_id(asset: &str) -> String {
    if asset.contains("-SWAP") {
        return asset.to_string();
    }
    if asset.contains('/') {
        return format!("{}{}", to_coin(asset), SWAP_SUFFIX);
    }
    format!("{}{}", asset, SWAP_SUFFIX)
}

/// "BTC" -> "BTC/USDT:USDT"; unified symbols pass through unchanged
pub fn to_unified_symbol(asset: &str) -> String {
    if asset.contains('/') {
        return asset.to_string();
    }
    format!("{}{}", to_coin(asset), UNIFIED_SUFFIX)
}

/// Inverse of both mappings; anything else is returned as-is
pub fn to_coin(symbol: &str) -> &str {
    if let Some((coin, _)) = symbol.split_once('/') {
        return coin;
    }
    symbol.strip_suffix(SWAP_SUFFIX).unwrap_or(symbol)
}
