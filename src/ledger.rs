//! The derived ledger: per-token account balances, maintained solely by replaying protocol commands.
//! Held in memory for the lifetime of the replay engine; the durably stored relevant blocks, not
//! these balances, are the source of truth, and a restart rebuilds them by full replay.

use std::collections::HashMap;

use crate::types::{Address, TokenSymbol, Value};

/// Mapping from token symbol to normalized address to balance. Mutated exclusively by the replay
/// engine's folding step.
#[derive(Clone, Default)]
pub struct LedgerState {
    balances: HashMap<TokenSymbol, HashMap<String, Value>>,
}

impl LedgerState {
    pub fn new() -> LedgerState {
        LedgerState {
            balances: HashMap::new(),
        }
    }

    /// The balance of `address` in `token`. Addresses are normalized before lookup; an account that
    /// has never been credited has balance 0.
    pub fn balance(&self, token: &str, address: &Address) -> Value {
        self.balance_of_normalized(token, &address.normalized())
    }

    pub(crate) fn balance_of_normalized(&self, token: &str, address: &str) -> Value {
        self.balances
            .get(token)
            .and_then(|accounts| accounts.get(address))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn set_balance(&mut self, token: TokenSymbol, address: String, value: Value) {
        self.balances.entry(token).or_default().insert(address, value);
    }

    /// The number of accounts with an entry in `token`.
    pub fn accounts(&self, token: &str) -> usize {
        self.balances.get(token).map_or(0, |accounts| accounts.len())
    }
}
