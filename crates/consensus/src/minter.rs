// consensus/src/minter.rs

//! Proof-of-stake block production.
//!
//! A staking session runs as one tokio task. Each round it snapshots the tip,
//! selects mature wallet coins, searches for a kernel on a blocking thread and,
//! on a hit, assembles, signs and submits a block against the same tip. The
//! unlocked key exists only inside the session task.

use crate::{
    engine::{BlockVerdict, ChainEngine},
    interfaces::{BlockRelay, StakingKey, StakingWallet, WalletSecret},
    kernel::{search_kernel, stake_time, KernelContext, KernelHit},
    maturity::CoinMaturityTracker,
    selection::StakeCandidateSelector,
    ConsensusError, ConsensusResult,
};
use blockchain_core::{
    Amount, Block, BlockHeader, BlockNumber, BlockchainError, OutPoint, ProofKind, Transaction, TxOut,
};
use blockchain_crypto::Hash;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinterState {
    Idle,
    Searching,
    KernelFound,
    BlockAssembled,
    Submitted,
    /// No session is running
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinterEvent {
    BlockProduced {
        hash: Hash,
        height: BlockNumber,
        staked: OutPoint,
        payout: Amount,
    },
}

#[derive(Debug, Clone)]
pub struct MinterConfig {
    /// Time between rounds when the tip does not change
    pub poll_interval: Duration,
    pub max_candidates_per_round: usize,
    /// Wall-clock limit on one kernel search
    pub round_budget: Duration,
    /// Pool transactions included in a staked block
    pub max_block_transactions: usize,
}

impl Default for MinterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_candidates_per_round: 64,
            round_budget: Duration::from_millis(250),
            max_block_transactions: 1_000,
        }
    }
}

/// Shared between the handle and the session task
struct MinterCore {
    engine: Arc<ChainEngine>,
    wallet: Arc<dyn StakingWallet>,
    relay: RwLock<Option<Arc<dyn BlockRelay>>>,
    selector: StakeCandidateSelector,
    maturity: CoinMaturityTracker,
    config: MinterConfig,
    state_tx: watch::Sender<MinterState>,
    events: broadcast::Sender<MinterEvent>,
}

struct Session {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Bookkeeping that lives for one session
#[derive(Default)]
struct SessionMemory {
    /// Coins staked by blocks this session got accepted
    staked: HashSet<OutPoint>,
    /// Kernels the engine refused, by coin and parent
    rejected: HashSet<(OutPoint, Hash)>,
    round: u64,
}

pub struct StakeMinter {
    core: Arc<MinterCore>,
    session: Mutex<Option<Session>>,
}

impl StakeMinter {
    pub fn new(engine: Arc<ChainEngine>, wallet: Arc<dyn StakingWallet>, config: MinterConfig) -> Self {
        let selector = StakeCandidateSelector::new(
            Arc::new(crate::selection::LargestFirst),
            config.max_candidates_per_round,
        );
        Self::with_selector(engine, wallet, config, selector)
    }

    pub fn with_selector(
        engine: Arc<ChainEngine>,
        wallet: Arc<dyn StakingWallet>,
        config: MinterConfig,
        selector: StakeCandidateSelector,
    ) -> Self {
        let maturity = CoinMaturityTracker::from_params(engine.params());
        let (state_tx, _) = watch::channel(MinterState::Stopped);
        let (events, _) = broadcast::channel(64);
        Self {
            core: Arc::new(MinterCore {
                engine,
                wallet,
                relay: RwLock::new(None),
                selector,
                maturity,
                config,
                state_tx,
                events,
            }),
            session: Mutex::new(None),
        }
    }

    /// Relay that produced blocks are broadcast through
    pub fn set_relay(&self, relay: Arc<dyn BlockRelay>) {
        *self.core.relay.write().unwrap_or_else(|e| e.into_inner()) = Some(relay);
    }

    /// Unlock the wallet and start a staking session, replacing any running
    /// one. Authentication errors are returned here; later wallet errors end
    /// the session instead.
    pub async fn start(&self, secret: WalletSecret) -> ConsensusResult<()> {
        let key = self.core.wallet.unlock(&secret)?;
        drop(secret);

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.shutdown().await;
        }

        info!(
            "Staking started for wallet '{}' ({}), ordering {}",
            key.wallet(),
            key.address(),
            self.core.selector.ordering_name()
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        self.core.set_state(MinterState::Idle);
        let handle = tokio::spawn(run_session(self.core.clone(), key, stop_rx));
        *session = Some(Session { stop_tx, handle });
        Ok(())
    }

    /// End the session; returns once the task has exited and dropped its key
    pub async fn stop(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown().await;
            info!("Staking stopped");
        }
        self.core.set_state(MinterState::Stopped);
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.handle.is_finished())
    }

    pub fn state(&self) -> MinterState {
        *self.core.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MinterState> {
        self.core.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MinterEvent> {
        self.core.events.subscribe()
    }
}

impl Session {
    async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!("Staking task ended abnormally: {}", e);
        }
    }
}

async fn run_session(core: Arc<MinterCore>, key: StakingKey, mut stop_rx: watch::Receiver<bool>) {
    let mut tip_rx = core.engine.subscribe_tip();
    let mut ticker = interval(core.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut memory = SessionMemory::default();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
            changed = tip_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        match core.round(&key, &mut memory).await {
            Ok(()) => {}
            Err(e) if is_fatal(&e) => {
                error!("Staking session for '{}' ended: {}", key.wallet(), e);
                break;
            }
            Err(e) => warn!("Staking round failed: {}", e),
        }
        // Tip changes made by this round do not trigger another one.
        let _ = tip_rx.borrow_and_update();
        core.set_state(MinterState::Idle);
    }

    core.set_state(MinterState::Stopped);
    debug!("Staking session for '{}' exited", key.wallet());
}

fn is_fatal(error: &ConsensusError) -> bool {
    match error {
        ConsensusError::Wallet(e) => e.is_fatal(),
        ConsensusError::Halted | ConsensusError::Storage(_) | ConsensusError::Config(_) => true,
        _ => false,
    }
}

impl MinterCore {
    fn set_state(&self, state: MinterState) {
        self.state_tx.send_replace(state);
    }

    async fn round(&self, key: &StakingKey, memory: &mut SessionMemory) -> ConsensusResult<()> {
        let tip = self.engine.tip();
        let parent = self
            .engine
            .header(&tip.hash)
            .ok_or(BlockchainError::BlockNotFound(tip.hash))?;

        self.set_state(MinterState::Searching);
        let coins = self.wallet.spendable_coins(key.wallet())?;
        let mut excluded = memory.staked.clone();
        excluded.extend(
            memory
                .rejected
                .iter()
                .filter(|(_, parent_hash)| *parent_hash == tip.hash)
                .map(|(outpoint, _)| *outpoint),
        );
        let mature: Vec<_> = self
            .maturity
            .mature_coins(tip.height, &coins, &excluded)
            .into_iter()
            .filter(|coin| coin.owner() == key.address() && self.engine.coin(&coin.outpoint).is_some())
            .collect();
        let candidates = self.selector.select(mature, memory.round);
        memory.round = memory.round.wrapping_add(1);

        if candidates.is_empty() {
            debug!("No stakeable coins at height {}", tip.height);
            return Ok(());
        }

        let ctx = KernelContext {
            prev_hash: tip.hash,
            prev_time: parent.timestamp,
            time: stake_time(self.engine.params(), parent.timestamp, self.engine.clock().now()),
            bits: self.engine.next_bits(&parent, ProofKind::Stake),
        };
        let time = ctx.time;
        let deadline = Instant::now() + self.config.round_budget;
        let outcome = tokio::task::spawn_blocking(move || search_kernel(&ctx, &candidates, deadline))
            .await
            .map_err(|e| ConsensusError::TaskFailed(e.to_string()))?;
        debug!(
            "Kernel search on #{}: {} attempts{}",
            tip.height,
            outcome.attempts,
            if outcome.timed_out { ", budget exhausted" } else { "" }
        );

        let Some(hit) = outcome.hit else {
            return Ok(());
        };
        self.set_state(MinterState::KernelFound);

        let block = self.assemble(key, &hit, &parent, tip.hash, time)?;
        self.set_state(MinterState::BlockAssembled);

        self.set_state(MinterState::Submitted);
        let verdict = match self.engine.submit_if_tip(block.clone(), &tip.hash) {
            Ok(verdict) => verdict,
            Err(ConsensusError::StaleTip { .. }) => {
                debug!("Tip moved while staking on {}, discarding block", tip.hash);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match verdict {
            BlockVerdict::Accepted(accepted) => {
                memory.staked.insert(hit.coin.outpoint);
                let payout = block.transactions[0].total_output().unwrap_or(Amount::zero());
                info!(
                    "✓ Staked block #{} ({}) with {} worth {}",
                    accepted.height,
                    accepted.hash,
                    hit.coin.outpoint,
                    hit.coin.value()
                );

                if let Err(e) = self.wallet.record_transaction(key.wallet(), &block.transactions[0], accepted.height) {
                    warn!("Wallet did not record coinstake {}: {}", block.transactions[0].txid(), e);
                }
                let relay = self.relay.read().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(relay) = relay {
                    relay.broadcast_block(&block);
                }
                let _ = self.events.send(MinterEvent::BlockProduced {
                    hash: accepted.hash,
                    height: accepted.height,
                    staked: hit.coin.outpoint,
                    payout,
                });
            }
            BlockVerdict::Rejected(reason) => {
                warn!("Staked block on {} rejected: {}", tip.hash, reason);
                memory.rejected.insert((hit.coin.outpoint, tip.hash));
            }
        }
        Ok(())
    }

    /// Coinstake, pool transactions, header and signature
    fn assemble(
        &self,
        key: &StakingKey,
        hit: &KernelHit,
        parent: &BlockHeader,
        parent_hash: Hash,
        time: u64,
    ) -> ConsensusResult<Block> {
        let params = self.engine.params();
        let template = self
            .engine
            .block_template(self.config.max_block_transactions, Some(&hit.coin.outpoint))?;

        let payout = hit
            .coin
            .value()
            .checked_add(params.proof_of_stake_reward)
            .and_then(|value| value.checked_add(template.fees))
            .ok_or_else(|| BlockchainError::InvalidTransaction("stake payout overflows".into()))?;

        let coinstake = Transaction::coinstake(hit.coin.outpoint, vec![TxOut::new(payout, hit.coin.owner())], time);
        let mut transactions = vec![coinstake];
        transactions.extend(template.transactions);

        let bits = self.engine.next_bits(parent, ProofKind::Stake);
        let mut block = Block::new(parent_hash, parent.height + 1, time, bits, ProofKind::Stake, transactions);
        block.sign(key.keypair());
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, interfaces::WalletError, kernel::FixedTarget, pow::PowMiner};
    use blockchain_core::{Coin, ConsensusParameters};
    use blockchain_crypto::{Address, KeyPair};
    use std::sync::atomic::{AtomicBool, Ordering};
    use storage::MemoryStore;
    use tokio::time::timeout;

    /// Single-key wallet reading its coins straight from the engine
    struct TestWallet {
        keypair: KeyPair,
        password: String,
        engine: Arc<ChainEngine>,
        removed: AtomicBool,
        /// Mine a block on the next coin listing, racing the round in progress
        advance_tip: AtomicBool,
    }

    impl StakingWallet for TestWallet {
        fn unlock(&self, secret: &WalletSecret) -> Result<StakingKey, WalletError> {
            if secret.name != "staker" || self.removed.load(Ordering::SeqCst) {
                return Err(WalletError::NotFound(secret.name.clone()));
            }
            if *secret.password != self.password {
                return Err(WalletError::Auth(secret.name.clone()));
            }
            Ok(StakingKey::new("staker", self.keypair.clone()))
        }

        fn spendable_coins(&self, wallet: &str) -> Result<Vec<Coin>, WalletError> {
            if self.removed.load(Ordering::SeqCst) {
                return Err(WalletError::NotFound(wallet.to_string()));
            }
            let coins = self.engine.coins_owned_by(&self.keypair.address());
            if self.advance_tip.swap(false, Ordering::SeqCst) {
                PowMiner::new(self.engine.clone())
                    .generate(1, Address::new([3; 20]))
                    .map_err(|e| WalletError::Other(e.to_string()))?;
            }
            Ok(coins)
        }

        fn record_transaction(&self, _wallet: &str, _tx: &Transaction, _height: BlockNumber) -> Result<(), WalletError> {
            Ok(())
        }
    }

    fn setup() -> (Arc<ChainEngine>, Arc<TestWallet>, StakeMinter) {
        let params = Arc::new(ConsensusParameters::regtest());
        let clock = Arc::new(ManualClock::new(params.genesis_timestamp + 10_000));
        let engine = Arc::new(
            ChainEngine::open_with(params, Arc::new(MemoryStore::new()), clock, Arc::new(FixedTarget)).unwrap(),
        );
        let wallet = Arc::new(TestWallet {
            keypair: KeyPair::generate(),
            password: "correct horse".into(),
            engine: engine.clone(),
            removed: AtomicBool::new(false),
            advance_tip: AtomicBool::new(false),
        });
        let config = MinterConfig {
            poll_interval: Duration::from_millis(20),
            ..MinterConfig::default()
        };
        let minter = StakeMinter::new(engine.clone(), wallet.clone(), config);
        (engine, wallet, minter)
    }

    /// Minter internals driven one round at a time
    fn round_core(engine: &Arc<ChainEngine>, wallet: &Arc<TestWallet>, maturity: CoinMaturityTracker) -> MinterCore {
        let (state_tx, _) = watch::channel(MinterState::Stopped);
        let (events, _) = broadcast::channel(8);
        MinterCore {
            engine: engine.clone(),
            wallet: wallet.clone(),
            relay: RwLock::new(None),
            selector: StakeCandidateSelector::new(Arc::new(crate::selection::LargestFirst), 8),
            maturity,
            config: MinterConfig::default(),
            state_tx,
            events,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stakes_mature_coin() {
        let (engine, wallet, minter) = setup();
        let maturity = engine.params().stake_min_confirmations as usize;
        PowMiner::new(engine.clone())
            .generate(2 + maturity, wallet.keypair.address())
            .unwrap();
        let start_height = engine.tip().height;

        let mut events = minter.subscribe_events();
        minter.start(WalletSecret::new("staker", "correct horse")).await.unwrap();

        let event = timeout(Duration::from_secs(10), events.recv()).await.unwrap().unwrap();
        minter.stop().await;

        let MinterEvent::BlockProduced { hash, height, staked, .. } = event;
        assert!(height > start_height);
        let block = engine.block(&hash).unwrap().unwrap();
        assert!(block.is_proof_of_stake());
        let coinstake = block.coinstake().unwrap();
        assert_eq!(coinstake.inputs.iter().filter(|input| input.prevout == staked).count(), 1);
        assert_eq!(block.verify_signature().unwrap(), wallet.keypair.address());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wrong_password_fails_start() {
        let (_engine, _wallet, minter) = setup();
        let result = minter.start(WalletSecret::new("staker", "wrong")).await;
        assert!(matches!(result, Err(ConsensusError::Wallet(WalletError::Auth(_)))));
        assert!(!minter.is_running().await);
        assert_eq!(minter.state(), MinterState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_ends_session() {
        let (_engine, _wallet, minter) = setup();
        minter.start(WalletSecret::new("staker", "correct horse")).await.unwrap();
        assert!(minter.is_running().await);

        minter.stop().await;
        assert!(!minter.is_running().await);
        assert_eq!(minter.state(), MinterState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removed_wallet_stops_session() {
        let (_engine, wallet, minter) = setup();
        minter.start(WalletSecret::new("staker", "correct horse")).await.unwrap();
        let mut state = minter.subscribe_state();
        wallet.removed.store(true, Ordering::SeqCst);

        timeout(Duration::from_secs(5), state.wait_for(|s| *s == MinterState::Stopped))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(minter.state(), MinterState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_mature_coins_stays_idle() {
        let (engine, wallet, minter) = setup();
        PowMiner::new(engine.clone()).generate(3, wallet.keypair.address()).unwrap();
        let tip = engine.tip();

        minter.start(WalletSecret::new("staker", "correct horse")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        minter.stop().await;

        assert_eq!(engine.tip(), tip);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_kernel_not_retried_on_same_parent() {
        let (engine, wallet, _minter) = setup();
        let miner = PowMiner::new(engine.clone());
        miner.generate(3, wallet.keypair.address()).unwrap();
        // A window shorter than the engine's offers coins the engine refuses.
        let core = round_core(&engine, &wallet, CoinMaturityTracker::new(1));
        let key = StakingKey::new("staker", wallet.keypair.clone());
        let mut memory = SessionMemory::default();
        let tip = engine.tip();

        core.round(&key, &mut memory).await.unwrap();
        assert_eq!(engine.tip(), tip);
        assert_eq!(memory.rejected.len(), 1);
        let (first, parent) = *memory.rejected.iter().next().unwrap();
        assert_eq!(parent, tip.hash);

        core.round(&key, &mut memory).await.unwrap();
        assert_eq!(engine.tip(), tip);
        assert_eq!(memory.rejected.len(), 2);
        assert!(memory.rejected.iter().all(|(_, parent)| *parent == tip.hash));
        assert_eq!(memory.rejected.iter().filter(|(outpoint, _)| *outpoint == first).count(), 1);

        // Both coins have been refused on this parent; nothing is submitted.
        core.round(&key, &mut memory).await.unwrap();
        assert_eq!(memory.rejected.len(), 2);
        assert_eq!(engine.tip(), tip);

        // On a new parent the coin may be tried again.
        miner.generate(1, Address::new([3; 20])).unwrap();
        let moved = engine.tip();
        core.round(&key, &mut memory).await.unwrap();
        assert_eq!(memory.rejected.len(), 3);
        assert!(memory.rejected.iter().any(|(_, parent)| *parent == moved.hash));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_tip_discards_block_and_resumes() {
        let (engine, wallet, _minter) = setup();
        let maturity = engine.params().stake_min_confirmations as usize;
        PowMiner::new(engine.clone())
            .generate(2 + maturity, wallet.keypair.address())
            .unwrap();
        let core = round_core(&engine, &wallet, CoinMaturityTracker::from_params(engine.params()));
        let key = StakingKey::new("staker", wallet.keypair.clone());
        let mut memory = SessionMemory::default();
        let mut events = core.events.subscribe();
        let before = engine.tip();

        wallet.advance_tip.store(true, Ordering::SeqCst);
        core.round(&key, &mut memory).await.unwrap();
        let moved = engine.tip();
        assert_eq!(moved.height, before.height + 1);
        assert!(!engine.block(&moved.hash).unwrap().unwrap().is_proof_of_stake());
        assert!(memory.staked.is_empty());
        assert!(memory.rejected.is_empty());
        assert!(events.try_recv().is_err());

        core.round(&key, &mut memory).await.unwrap();
        let staked = engine.tip();
        assert_eq!(staked.height, moved.height + 1);
        assert!(engine.block(&staked.hash).unwrap().unwrap().is_proof_of_stake());
        assert_eq!(memory.staked.len(), 1);
        assert!(matches!(events.try_recv(), Ok(MinterEvent::BlockProduced { .. })));
    }
}
