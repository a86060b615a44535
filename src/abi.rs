use alloy::primitives::Bytes;
use alloy_sol_types::SolCall;

// Subset of the vault interface the keeper touches.
alloy::sol!(
    #[sol(rpc)]
    #[sol(all_derives)]
    interface IVault {
        function harvest() external;
        function balance() external view returns (uint256);
        function lastHarvest() external view returns (uint256);
        function keeper() external view returns (address);
        function totalSupply() external view returns (uint256);
        function getPricePerFullShare() external view returns (uint256);
    }
);

/// Calldata for `harvest()`; the call takes no arguments so this is just the selector.
pub fn harvest_calldata() -> Bytes {
    IVault::harvestCall {}.abi_encode().into()
}
