//! Chain state data model (§3 of the design spec).

use serde::{Deserialize, Serialize};

/// Lifecycle of a UTXO. Transitions only ever move forward:
/// `Unspent -> NeedsVerification -> SpentVerified`. `Spent` is a terminal
/// state reached once the spending transaction itself reaches the
/// configured confirmation depth, handled by the confirmation tracker
/// rather than the account manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpentStatus {
    Unspent,
    NeedsVerification,
    SpentVerified,
    Spent,
}

impl SpentStatus {
    /// Whether `self -> next` is a legal forward transition.
    /// `Unspent -> SpentVerified` is included alongside the usual
    /// `Unspent -> NeedsVerification -> SpentVerified` path because a
    /// block scan can observe a spend that was never broadcast by this
    /// gateway (and so never passed through `NeedsVerification`) already
    /// confirmed.
    pub fn can_advance_to(self, next: SpentStatus) -> bool {
        use SpentStatus::*;
        matches!(
            (self, next),
            (Unspent, NeedsVerification)
                | (Unspent, SpentVerified)
                | (NeedsVerification, SpentVerified)
                | (SpentVerified, Spent)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub index: u32,
    pub value: u64,
    pub spent: SpentStatus,
}

/// An opaque identifier for an entry in the key store: `hash(chainName
/// ‖ address)` truncated to 12 bytes, hex-encoded.
pub fn key_store_id(chain_name: &str, address: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(chain_name.as_bytes());
    hasher.update(address.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..12])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub public_key: String,
    pub balance: u64,
    pub first_block: u64,
    pub last_block: u64,
    pub syncing: bool,
    pub utxos: Vec<Utxo>,
}

impl Account {
    pub fn new(address: String, public_key: String, first_block: u64) -> Self {
        Self {
            address,
            public_key,
            balance: 0,
            first_block,
            last_block: first_block,
            syncing: false,
            utxos: Vec::new(),
        }
    }

    /// `balance = sum(value(utxo)) for utxo.spent == Unspent`, per the
    /// invariant in §3 — never decremented speculatively from
    /// `NeedsVerification`/`SpentVerified` states.
    pub fn recompute_balance(&mut self) {
        self.balance = self
            .utxos
            .iter()
            .filter(|u| u.spent == SpentStatus::Unspent)
            .map(|u| u.value)
            .sum();
    }

    pub fn utxo_mut(&mut self, txid: &str, index: u32) -> Option<&mut Utxo> {
        self.utxos
            .iter_mut()
            .find(|u| u.txid == txid && u.index == index)
    }

    pub fn has_utxo_for_txid(&self, txid: &str) -> bool {
        self.utxos.iter().any(|u| u.txid == txid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParameters {
    pub chain: NetworkKind,
    /// RPC URL with credentials stripped, suitable for display.
    pub rpc_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainStatus {
    pub current_block: u64,
    pub highest_block: u64,
    pub peers: u64,
    pub updated: Option<String>,
    pub feerate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainState {
    pub parameters: ChainParameters,
    pub status: ChainStatus,
    pub accounts: Vec<Account>,
}

impl ChainState {
    pub fn empty(parameters: ChainParameters) -> Self {
        Self {
            parameters,
            status: ChainStatus::default(),
            accounts: Vec::new(),
        }
    }

    pub fn account(&self, address: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.address == address)
    }

    pub fn account_mut(&mut self, address: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.address == address)
    }

    /// Set-union upsert keyed by account address, per the "array merges
    /// are set-union by key" redesign note.
    pub fn upsert_account(&mut self, account: Account) {
        if let Some(existing) = self.account_mut(&account.address) {
            *existing = account;
        } else {
            self.accounts.push(account);
        }
    }

    pub fn remove_account(&mut self, address: &str) -> Option<Account> {
        let idx = self.accounts.iter().position(|a| a.address == address)?;
        Some(self.accounts.remove(idx))
    }
}

/// Direction of a message relative to this gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransceiveDirection {
    Rx,
    Tx,
}

/// A confirmation record queued in the global `blockDepths` queue,
/// keyed by `transactionHash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub transaction_hash: String,
    pub blockchain: String,
    pub block_number: u64,
    pub block_depth: u64,
    pub confirmed: bool,
}
