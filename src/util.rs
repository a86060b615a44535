use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{
    utils::{format_ether, format_units},
    U256,
};

pub fn now_sec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn wei_to_gwei(wei: u128) -> String {
    format_units(U256::from(wei), "gwei").unwrap_or_else(|_| format!("{wei} wei"))
}

pub fn wei_to_eth(wei: U256) -> String {
    format_ether(wei)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gwei_formatting() {
        assert_eq!(wei_to_gwei(100_000_000_000), "100.000000000");
    }
}
