//! UTXO transaction builder (§4.4): composes, signs and broadcasts
//! Bitcoin-style transactions with an optional embedded OP_RETURN
//! payload.

use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{ecdsa, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};

use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::keystore::KeyStore;
use crate::rpc::RpcTransport;
use crate::state::{Account, ChainStateStore, SpentStatus, Utxo};

/// OP_RETURN data cap, per §4.4/§6.
pub const MAX_OP_RETURN_BYTES: usize = 80;

/// Fixed fee applied to every transaction, in satoshis, per §4.4.
pub const DEFAULT_TRANSACTION_FEE: u64 = 4_000;

pub struct TransactionBuilder {
    chain_name: String,
    network: bitcoin::Network,
    store: Arc<dyn ChainStateStore>,
    rpc: Arc<dyn RpcTransport>,
    fee: u64,
    trace_raw_transaction: bool,
}

impl TransactionBuilder {
    pub fn new(
        chain_name: impl Into<String>,
        network: bitcoin::Network,
        store: Arc<dyn ChainStateStore>,
        rpc: Arc<dyn RpcTransport>,
    ) -> Self {
        Self {
            chain_name: chain_name.into(),
            network,
            store,
            rpc,
            fee: DEFAULT_TRANSACTION_FEE,
            trace_raw_transaction: false,
        }
    }

    pub fn with_fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    /// Enables `debug`-level logging of the raw transaction hex just
    /// before broadcast, for node-side troubleshooting.
    pub fn with_trace_raw_transaction(mut self, enabled: bool) -> Self {
        self.trace_raw_transaction = enabled;
        self
    }

    /// Builds, signs and broadcasts a transaction sending `amount`
    /// satoshis from `account` to `to_address`, optionally carrying
    /// `data` in an OP_RETURN output. Returns the broadcast txid.
    pub async fn send(
        &self,
        account: &Account,
        to_address: &str,
        amount: u64,
        data: Option<&[u8]>,
    ) -> GatewayResult<String> {
        if let Some(data) = data {
            if data.len() > MAX_OP_RETURN_BYTES {
                return Err(GatewayError::BadRequest(format!(
                    "embedded data is {} bytes, limit is {MAX_OP_RETURN_BYTES}",
                    data.len()
                )));
            }
        }

        let needed = amount + self.fee;
        let (selected, total_input) = select_inputs(&account.utxos, needed)?;

        let checked_from = account
            .address
            .parse::<Address<_>>()
            .map_err(|e| GatewayError::BadRequest(format!("invalid source address: {e}")))?
            .require_network(self.network)
            .map_err(|e| GatewayError::BadRequest(format!("source address wrong network: {e}")))?;

        let to = to_address
            .parse::<Address<_>>()
            .map_err(|e| GatewayError::BadRequest(format!("invalid destination address: {e}")))?
            .require_network(self.network)
            .map_err(|e| GatewayError::BadRequest(format!("destination address wrong network: {e}")))?;

        let mut outputs = Vec::new();
        if let Some(data) = data {
            let push = PushBytesBuf::try_from(data.to_vec())
                .map_err(|e| GatewayError::BadRequest(format!("invalid OP_RETURN data: {e}")))?;
            outputs.push(TxOut {
                value: Amount::from_sat(0),
                script_pubkey: ScriptBuf::new_op_return(push),
            });
        }

        if checked_from.to_string() != to.to_string() {
            outputs.push(TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: to.script_pubkey(),
            });
        }

        let change = total_input - amount - self.fee;
        outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: checked_from.script_pubkey(),
        });

        let inputs: Vec<TxIn> = selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: OutPoint {
                    txid: utxo.txid.parse().expect("stored utxo txid is always valid"),
                    vout: utxo.index,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };

        self.sign(&mut tx, account, &selected, &checked_from)?;

        let hex = bitcoin::consensus::encode::serialize_hex(&tx);
        if self.trace_raw_transaction {
            debug!(chain = %self.chain_name, raw_transaction = %hex, "broadcasting raw transaction");
        }
        let txid = self
            .rpc
            .send_raw_transaction(&hex)
            .await?
            .ok_or(GatewayError::TransactionRejected)?;

        self.mark_spent(account, &selected, &txid)?;

        Ok(txid)
    }

    /// Signs each input with the private key retrieved from the key
    /// store, zeroizing the key material immediately after use (§4.4).
    fn sign(
        &self,
        tx: &mut Transaction,
        account: &Account,
        selected: &[Utxo],
        from_address: &Address,
    ) -> GatewayResult<()> {
        let keystore = KeyStore::new(self.store.as_ref());
        let secret = keystore
            .get(&self.chain_name, &account.address)
            .ok_or_else(|| GatewayError::NotFound(format!("key for {}", account.address)))?;
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&secret)
            .map_err(|e| GatewayError::Sign(format!("invalid stored key: {e}")))?;
        let public_key = bitcoin::PublicKey::new(SecretKey::public_key(&secret_key, &secp));

        let script_pubkey = from_address.script_pubkey();
        let sighash_cache = SighashCache::new(&*tx);
        let mut sighashes = Vec::with_capacity(selected.len());
        for (idx, utxo) in selected.iter().enumerate() {
            let sighash = sighash_cache
                .legacy_signature_hash(idx, &script_pubkey, EcdsaSighashType::All.to_u32())
                .map_err(|e| GatewayError::Sign(format!("sighash for utxo {}: {e}", utxo.txid)))?;
            sighashes.push(sighash);
        }
        drop(sighash_cache);

        for (idx, sighash) in sighashes.into_iter().enumerate() {
            let message = Message::from_digest(sighash.to_byte_array());
            let signature: ecdsa::Signature = secp.sign_ecdsa(&message, &secret_key);
            let mut sig_bytes = signature.serialize_der().to_vec();
            sig_bytes.push(EcdsaSighashType::All as u8);

            let script_sig = bitcoin::script::Builder::new()
                .push_slice(PushBytesBuf::try_from(sig_bytes).expect("der sig fits"))
                .push_slice(PushBytesBuf::try_from(public_key.to_bytes()).expect("pubkey fits"))
                .into_script();
            tx.input[idx].script_sig = script_sig;
        }

        // `secret_key`/`secret` drop here; `Zeroizing` wipes the buffer.
        Ok(())
    }

    fn mark_spent(&self, account: &Account, selected: &[Utxo], _txid: &str) -> GatewayResult<()> {
        let mut state = self
            .store
            .get_chain(&self.chain_name, crate::state::ChainParameters {
                chain: crate::state::model::NetworkKind::Regtest,
                rpc_url: String::new(),
            });
        let stored = state
            .account_mut(&account.address)
            .ok_or_else(|| GatewayError::NotFound(format!("account {}", account.address)))?;

        for utxo in selected {
            if let Some(u) = stored.utxo_mut(&utxo.txid, utxo.index) {
                if u.spent.can_advance_to(SpentStatus::NeedsVerification) {
                    u.spent = SpentStatus::NeedsVerification;
                } else {
                    warn!(
                        chain = %self.chain_name,
                        txid = %utxo.txid,
                        index = utxo.index,
                        from = ?u.spent,
                        "skipping illegal spend-status transition after broadcast"
                    );
                }
            }
        }
        stored.recompute_balance();
        self.store.save(&self.chain_name, state);
        Ok(())
    }
}

/// Selects UNSPENT inputs smallest-value-first until their sum covers
/// `needed`, returning the selected UTXOs and their total value.
/// Fails `InsufficientFunds` without mutating anything if the account
/// cannot cover `needed`.
fn select_inputs(utxos: &[Utxo], needed: u64) -> GatewayResult<(Vec<Utxo>, u64)> {
    let mut candidates: Vec<&Utxo> = utxos.iter().filter(|u| u.spent == SpentStatus::Unspent).collect();
    candidates.sort_by_key(|u| u.value);

    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in candidates {
        if total >= needed {
            break;
        }
        total += utxo.value;
        selected.push(utxo.clone());
    }

    if total < needed {
        let available: u64 = utxos
            .iter()
            .filter(|u| u.spent == SpentStatus::Unspent)
            .map(|u| u.value)
            .sum();
        return Err(GatewayError::InsufficientFunds {
            needed,
            available,
        });
    }

    Ok((selected, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(txid: &str, value: u64) -> Utxo {
        Utxo {
            txid: txid.to_string(),
            index: 0,
            value,
            spent: SpentStatus::Unspent,
        }
    }

    #[test]
    fn selects_smallest_utxos_first_until_covered() {
        let utxos = vec![utxo("a", 5000), utxo("b", 1000), utxo("c", 2000)];
        let (selected, total) = select_inputs(&utxos, 2500).unwrap();
        assert_eq!(selected.iter().map(|u| u.txid.clone()).collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(total, 3000);
    }

    #[test]
    fn insufficient_funds_does_not_mutate_anything() {
        let utxos = vec![utxo("a", 3000)];
        let err = select_inputs(&utxos, 4000 + DEFAULT_TRANSACTION_FEE).unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientFunds { needed: _, available: 3000 }));
        // Inputs passed by reference: nothing to roll back, confirming
        // no partial mutation occurred before the failure.
        assert_eq!(utxos[0].spent, SpentStatus::Unspent);
    }

    #[test]
    fn ignores_already_spent_utxos_during_selection() {
        let mut utxos = vec![utxo("a", 5000)];
        utxos.push(Utxo {
            txid: "b".into(),
            index: 0,
            value: 10_000,
            spent: SpentStatus::SpentVerified,
        });
        let err = select_inputs(&utxos, 6000).unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientFunds { .. }));
    }
}
