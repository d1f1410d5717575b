//! ERC20 bindings and transfer call-data helpers.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::chain::types::Token;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

/// Destination, native value and call data of the on-chain call that moves
/// `amount` of `token` to `recipient`.
pub fn transfer_call(token: Token, recipient: Address, amount: U256) -> (Address, U256, Bytes) {
    match token {
        Token::Native => (recipient, amount, Bytes::new()),
        Token::Erc20(contract) => {
            let data = IERC20::transferCall {
                to: recipient,
                amount,
            }
            .abi_encode();
            (contract, U256::ZERO, Bytes::from(data))
        }
    }
}
