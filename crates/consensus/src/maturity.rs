// consensus/src/maturity.rs

//! Coin maturity: a coin confirmed at height `h` is mature at tip height `H`
//! when `H - h >= window`. Coins at depth zero, or above the tip after a
//! reorganization, are never mature. Coinbase and coinstake outputs use the
//! longer of the staking and reward maturity windows.

use blockchain_core::{BlockNumber, Coin, ConsensusParameters, OutPoint};
use std::collections::HashSet;

/// Whether a coin confirmed at `coin_height` is mature at `tip_height`
pub fn is_mature(coin_height: BlockNumber, tip_height: BlockNumber, window: u64) -> bool {
    match tip_height.checked_sub(coin_height) {
        Some(depth) => depth > 0 && depth >= window,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maturity {
    Immature,
    /// Deep enough but carries no value to stake
    Mature,
    Stakeable,
}

/// Classifies wallet coins against the maturity windows of the network
#[derive(Debug, Clone, Copy)]
pub struct CoinMaturityTracker {
    window: u64,
    reward_window: u64,
}

impl CoinMaturityTracker {
    /// One window for every coin kind
    pub fn new(window: u64) -> Self {
        Self::with_reward_window(window, window)
    }

    pub fn with_reward_window(window: u64, reward_window: u64) -> Self {
        Self { window, reward_window }
    }

    pub fn from_params(params: &ConsensusParameters) -> Self {
        Self::with_reward_window(
            params.stake_min_confirmations,
            params.stake_min_confirmations.max(params.coinbase_maturity),
        )
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Depth `coin` needs before it can stake
    pub fn window_for(&self, coin: &Coin) -> u64 {
        if coin.kind.is_reward() {
            self.reward_window
        } else {
            self.window
        }
    }

    pub fn classify(&self, coin: &Coin, tip_height: BlockNumber) -> Maturity {
        if !is_mature(coin.height, tip_height, self.window_for(coin)) {
            Maturity::Immature
        } else if coin.value().is_zero() {
            Maturity::Mature
        } else {
            Maturity::Stakeable
        }
    }

    /// Stakeable coins not in `excluded`, in input order
    pub fn mature_coins(
        &self,
        tip_height: BlockNumber,
        coins: &[Coin],
        excluded: &HashSet<OutPoint>,
    ) -> Vec<Coin> {
        coins
            .iter()
            .filter(|coin| !excluded.contains(&coin.outpoint))
            .filter(|coin| self.classify(coin, tip_height) == Maturity::Stakeable)
            .cloned()
            .collect()
    }
}
