//! Iterative, retrying, stack-bounded block crawler that emits
//! extracted Whiteflag messages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Network;
use tracing::{debug, warn};

use crate::account::AccountManager;
use crate::error::GatewayResult;
use crate::events::EventSinks;
use crate::message::{extract_message, ExtractError};
use crate::rpc::RpcTransport;
use crate::state::{ChainParameters, ChainStateStore};

/// Floor below which a configured retrieval interval is clamped.
pub const MIN_RETRIEVAL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRIEVAL_INTERVAL_MS: u64 = 60_000;
/// Delay before retrying a block that failed to fetch/process.
pub const BLOCK_RETRY_DELAY: Duration = Duration::from_millis(10_000);
/// Work-per-wake-up bound: `processBlocks` yields back to the caller's
/// scheduling loop once it has advanced this many blocks in one call.
pub const MAX_STACK_SIZE: u32 = 100;
/// Peer count / fee-rate are refreshed once every this many polling
/// ticks rather than on every tick, since they're purely informational.
pub const PEER_HEALTH_INTERVAL_TICKS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub configured_start: u64,
    pub configured_end: Option<u64>,
    pub restart_window: u64,
    pub retrieval_interval_ms: u64,
    pub max_retries: u32,
    pub transaction_batch_size: usize,
    pub reorg_window: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            configured_start: 0,
            configured_end: None,
            restart_window: 1000,
            retrieval_interval_ms: DEFAULT_RETRIEVAL_INTERVAL_MS,
            max_retries: 5,
            transaction_batch_size: 128,
            reorg_window: 6,
        }
    }
}

impl ListenerConfig {
    pub fn clamped_interval(&self) -> Duration {
        Duration::from_millis(self.retrieval_interval_ms.max(MIN_RETRIEVAL_INTERVAL_MS))
    }
}

/// Chooses the block height to resume crawling from:
/// - an explicit `configured_start > 0` always wins;
/// - otherwise, if the persisted cursor has fallen more than
///   `restart_window` blocks behind the chain tip, jump to
///   `highest - restart_window` rather than replaying the whole backlog;
/// - otherwise resume exactly where persisted state left off;
/// - and if there is no persisted cursor at all, start one block behind
///   the tip.
pub fn determine_starting_block(
    configured_start: u64,
    persisted_current: u64,
    highest: u64,
    restart_window: u64,
) -> u64 {
    if configured_start > 0 {
        return configured_start;
    }
    if persisted_current > 0 {
        if highest.saturating_sub(persisted_current) > restart_window {
            return highest.saturating_sub(restart_window);
        }
        return persisted_current;
    }
    highest.saturating_sub(1)
}

/// Result of processing a single block: either applied normally, or a
/// reorg was detected against the rolling window of previously seen
/// hashes, in which case the cursor should roll back before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOutcome {
    Applied,
    Reorg { rollback_to: u64 },
}

/// Compares `block`'s `previousblockhash` against the hash this listener
/// previously recorded for `height - 1`. A mismatch means the chain tip
/// moved underneath the crawler between polls; the caller should roll
/// the cursor back by `reorg_window` blocks and re-walk the fork rather
/// than silently reprocessing the new block on top of stale state.
/// Returns `None` when there is nothing to compare against (startup, or
/// the window doesn't reach back that far).
fn detect_reorg(
    recent_hashes: &VecDeque<(u64, String)>,
    height: u64,
    block: &crate::rpc::types::RpcBlock,
    reorg_window: usize,
) -> Option<u64> {
    let prev_height = height.checked_sub(1)?;
    let (_, expected_hash) = recent_hashes.iter().rev().find(|(h, _)| *h == prev_height)?;
    let actual_prev = block.previousblockhash.as_deref()?;
    if actual_prev == expected_hash {
        return None;
    }
    Some(height.saturating_sub(reorg_window as u64).saturating_sub(1))
}

pub struct BlockListener {
    chain_name: String,
    network: Network,
    config: ListenerConfig,
    store: Arc<dyn ChainStateStore>,
    rpc: Arc<dyn RpcTransport>,
    accounts: Arc<AccountManager>,
    events: EventSinks,
}

impl BlockListener {
    pub fn new(
        chain_name: impl Into<String>,
        network: Network,
        config: ListenerConfig,
        store: Arc<dyn ChainStateStore>,
        rpc: Arc<dyn RpcTransport>,
        accounts: Arc<AccountManager>,
        events: EventSinks,
    ) -> Self {
        Self {
            chain_name: chain_name.into(),
            network,
            config,
            store,
            rpc,
            accounts,
            events,
        }
    }

    fn default_parameters(&self) -> ChainParameters {
        ChainParameters {
            chain: crate::state::model::NetworkKind::Regtest,
            rpc_url: String::new(),
        }
    }

    /// Runs the main polling loop forever. Intended to be spawned as a
    /// background task, one per enabled chain.
    pub async fn run(&self) -> GatewayResult<()> {
        let mut cursor = self.initialise_cursor().await?;
        let mut recent_hashes: VecDeque<(u64, String)> = VecDeque::with_capacity(self.config.reorg_window.max(1));
        let mut tick: u64 = 0;

        loop {
            tokio::time::sleep(self.config.clamped_interval()).await;
            tick += 1;

            let highest = match self.rpc.get_block_count().await {
                Ok(h) => h,
                Err(e) => {
                    warn!(chain = %self.chain_name, error = %e, "failed to query highest block");
                    continue;
                }
            };

            // Peer/fee-rate health is informational only and runs on a
            // slower cadence than block retrieval since it's not needed
            // to make forward progress.
            if tick % PEER_HEALTH_INTERVAL_TICKS == 0 {
                self.refresh_peer_health().await;
            }

            if highest == cursor || cursor > highest {
                // Either caught up, or the node re-synced underneath us;
                // either way there's nothing to do this tick.
                continue;
            }

            let end = match self.config.configured_end {
                Some(configured_end) => highest.min(configured_end),
                None => highest,
            };

            cursor = self.process_blocks(cursor, end, &mut recent_hashes).await;

            if let Some(configured_end) = self.config.configured_end {
                if cursor >= configured_end {
                    let persisted = self.load_current_block();
                    cursor = determine_starting_block(
                        self.config.configured_start,
                        persisted,
                        highest,
                        self.config.restart_window,
                    );
                }
            }
        }
    }

    async fn initialise_cursor(&self) -> GatewayResult<u64> {
        let highest = self.rpc.get_block_count().await?;
        let persisted = self.load_current_block();
        Ok(determine_starting_block(
            self.config.configured_start,
            persisted,
            highest,
            self.config.restart_window,
        ))
    }

    fn load_current_block(&self) -> u64 {
        self.store
            .get_chain(&self.chain_name, self.default_parameters())
            .status
            .current_block
    }

    /// Processes blocks strictly sequentially from `cursor + 1` up to
    /// `end`, bounding work per call to [`MAX_STACK_SIZE`] blocks so a
    /// long backlog doesn't monopolize the scheduling loop. Returns the
    /// new cursor.
    async fn process_blocks(
        &self,
        mut cursor: u64,
        end: u64,
        recent_hashes: &mut VecDeque<(u64, String)>,
    ) -> u64 {
        let mut stack_size: u32 = 0;
        let mut retry_count: u32 = 0;

        while cursor < end {
            if stack_size > MAX_STACK_SIZE {
                break;
            }
            stack_size += 1;

            let next = cursor + 1;
            match self.process_one_block(next, recent_hashes).await {
                Ok(BlockOutcome::Applied) => {
                    cursor = next;
                    retry_count = 0;
                    self.persist_cursor(cursor);
                }
                Ok(BlockOutcome::Reorg { rollback_to }) => {
                    warn!(
                        chain = %self.chain_name,
                        block = next,
                        rollback_to,
                        "chain tip reorganised, rolling cursor back to re-walk the fork"
                    );
                    recent_hashes.clear();
                    cursor = rollback_to;
                    retry_count = 0;
                    self.persist_cursor(cursor);
                }
                Err(e) if retry_count >= self.config.max_retries => {
                    warn!(
                        chain = %self.chain_name,
                        block = next,
                        retries = retry_count,
                        error = %e,
                        "max retries exceeded, skipping block"
                    );
                    cursor = next;
                    retry_count = 0;
                    self.persist_cursor(cursor);
                }
                Err(e) => {
                    retry_count += 1;
                    warn!(chain = %self.chain_name, block = next, attempt = retry_count, error = %e, "block processing failed, retrying");
                    tokio::time::sleep(BLOCK_RETRY_DELAY).await;
                }
            }
        }

        cursor
    }

    async fn process_one_block(
        &self,
        height: u64,
        recent_hashes: &mut VecDeque<(u64, String)>,
    ) -> GatewayResult<BlockOutcome> {
        let hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block_by_hash(&hash, 2).await?;

        if let Some(rollback_to) = detect_reorg(recent_hashes, height, &block, self.config.reorg_window) {
            return Ok(BlockOutcome::Reorg { rollback_to });
        }

        self.accounts.process_block(height, &block).await?;

        for chunk in block.tx.chunks(self.config.transaction_batch_size.max(1)) {
            for tx in chunk {
                match extract_message(&self.chain_name, &block, tx, self.network) {
                    Ok(metaheader) => {
                        if self.events.receive.send(metaheader).await.is_err() {
                            warn!(chain = %self.chain_name, "receive event channel closed");
                        }
                    }
                    Err(ExtractError::NoOpReturn) | Err(ExtractError::NotWhiteflag) => {
                        // Not every transaction carries a Whiteflag
                        // payload; this is the common case, not an error.
                    }
                }
            }
        }

        if recent_hashes.len() == recent_hashes.capacity().max(1) {
            recent_hashes.pop_front();
        }
        recent_hashes.push_back((height, hash));

        debug!(chain = %self.chain_name, height, "processed block");
        Ok(BlockOutcome::Applied)
    }

    fn persist_cursor(&self, cursor: u64) {
        let mut state = self.store.get_chain(&self.chain_name, self.default_parameters());
        state.status.current_block = cursor;
        if cursor > state.status.highest_block {
            state.status.highest_block = cursor;
        }
        self.store.save(&self.chain_name, state);
    }

    /// Refreshes `status.peers`/`status.feerate` from the node, per §4.1's
    /// `getConnectionCount`/`estimateFeeRate` facade methods and §3's
    /// `ChainStatus` fields. Exposed but never consulted by the builder
    /// (§4.4: fee-rate estimation is informational, not auto-applied).
    async fn refresh_peer_health(&self) {
        let peers = match self.rpc.get_connection_count().await {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(chain = %self.chain_name, error = %e, "failed to query peer count");
                None
            }
        };
        let feerate = match self.rpc.estimate_fee_rate(6).await {
            Ok(rate) => rate,
            Err(e) => {
                debug!(chain = %self.chain_name, error = %e, "failed to estimate fee rate");
                None
            }
        };

        let mut state = self.store.get_chain(&self.chain_name, self.default_parameters());
        if let Some(peers) = peers {
            state.status.peers = peers;
        }
        if feerate.is_some() {
            state.status.feerate = feerate;
        }
        state.status.updated = Some(crate::message::iso_time_from_unix_seconds(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        ));
        self.store.save(&self.chain_name, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_configured_start_when_set() {
        assert_eq!(determine_starting_block(500, 0, 2000, 100), 500);
    }

    #[test]
    fn restarts_at_head_minus_window_when_far_behind() {
        // persisted 1000, highest 2000, restart 100 => resume at 1900.
        assert_eq!(determine_starting_block(0, 1000, 2000, 100), 1900);
    }

    #[test]
    fn resumes_at_persisted_cursor_when_within_window() {
        assert_eq!(determine_starting_block(0, 1950, 2000, 100), 1950);
    }

    #[test]
    fn starts_one_block_behind_tip_with_no_persisted_state() {
        assert_eq!(determine_starting_block(0, 0, 2000, 100), 1999);
    }

    #[test]
    fn retrieval_interval_clamps_to_floor() {
        let mut cfg = ListenerConfig::default();
        cfg.retrieval_interval_ms = 10;
        assert_eq!(cfg.clamped_interval(), Duration::from_millis(MIN_RETRIEVAL_INTERVAL_MS));

        cfg.retrieval_interval_ms = 500;
        assert_eq!(cfg.clamped_interval(), Duration::from_millis(500));
    }

    fn block_at(height: u64, previousblockhash: Option<&str>) -> crate::rpc::types::RpcBlock {
        crate::rpc::types::RpcBlock {
            hash: format!("hash{height}"),
            height,
            time: 0,
            previousblockhash: previousblockhash.map(str::to_string),
            tx: vec![],
        }
    }

    #[test]
    fn no_reorg_when_previous_hash_matches_recorded_tip() {
        let mut recent = VecDeque::new();
        recent.push_back((99, "hash99".to_string()));
        let block = block_at(100, Some("hash99"));
        assert_eq!(detect_reorg(&recent, 100, &block, 6), None);
    }

    #[test]
    fn reorg_detected_on_previous_hash_mismatch() {
        let mut recent = VecDeque::new();
        recent.push_back((99, "hash99".to_string()));
        let block = block_at(100, Some("someone-elses-hash99"));
        assert_eq!(detect_reorg(&recent, 100, &block, 6), Some(93));
    }

    #[test]
    fn no_reorg_check_possible_with_empty_window() {
        let recent = VecDeque::new();
        let block = block_at(100, Some("whatever"));
        assert_eq!(detect_reorg(&recent, 100, &block, 6), None);
    }
}
