// consensus/src/selection.rs

use blockchain_core::Coin;
use std::sync::Arc;

/// Order in which mature coins are tried as stake kernels
pub trait CandidateOrdering: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sort `coins` in place. Must be deterministic for a given input set.
    fn order(&self, coins: &mut [Coin]);
}

/// Largest amount first, ties broken by outpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirst;

impl CandidateOrdering for LargestFirst {
    fn name(&self) -> &'static str {
        "largest-first"
    }

    fn order(&self, coins: &mut [Coin]) {
        coins.sort_by(|a, b| {
            b.value()
                .cmp(&a.value())
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });
    }
}

/// Deepest coin first, ties broken by outpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestFirst;

impl CandidateOrdering for OldestFirst {
    fn name(&self) -> &'static str {
        "oldest-first"
    }

    fn order(&self, coins: &mut [Coin]) {
        coins.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.outpoint.cmp(&b.outpoint)));
    }
}

/// Produces the bounded candidate list for one minting round
#[derive(Clone)]
pub struct StakeCandidateSelector {
    ordering: Arc<dyn CandidateOrdering>,
    max_candidates: usize,
}

impl StakeCandidateSelector {
    pub fn new(ordering: Arc<dyn CandidateOrdering>, max_candidates: usize) -> Self {
        Self {
            ordering,
            max_candidates: max_candidates.max(1),
        }
    }

    pub fn ordering_name(&self) -> &'static str {
        self.ordering.name()
    }

    /// At most `max_candidates` coins for round number `round`.
    ///
    /// When the mature set is larger than one round allows, successive rounds
    /// take successive windows of the ordered set, so every coin is tried.
    pub fn select(&self, mut coins: Vec<Coin>, round: u64) -> Vec<Coin> {
        self.ordering.order(&mut coins);
        let len = coins.len();
        if len <= self.max_candidates {
            return coins;
        }

        let start = ((round as usize) % len.div_ceil(self.max_candidates)) * self.max_candidates;
        coins.into_iter().skip(start).take(self.max_candidates).collect()
    }
}

impl Default for StakeCandidateSelector {
    fn default() -> Self {
        Self::new(Arc::new(LargestFirst), 64)
    }
}
