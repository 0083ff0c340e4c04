//! Wire-level shapes returned by chain-node JSON-RPC methods.

#[cfg(test)]
use arbitrary::Arbitrary;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize};

/// Result of `getblockchaininfo`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct RpcBlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    pub bestblockhash: String,
}

/// A transaction as returned by `getrawtransaction` with verbosity 2,
/// trimmed to the fields the gateway core uses.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct RpcTransaction {
    pub txid: String,
    pub hash: String,
    pub hex: String,
    pub vin: Vec<RpcTxIn>,
    pub vout: Vec<RpcTxOut>,
    pub confirmations: Option<u64>,
    pub blockhash: Option<String>,
    pub blocktime: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct RpcTxIn {
    pub txid: Option<String>,
    pub vout: Option<u32>,
    #[serde(rename = "scriptSig")]
    pub script_sig: Option<RpcScriptSig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct RpcScriptSig {
    pub asm: String,
    pub hex: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct RpcTxOut {
    #[serde(deserialize_with = "deserialize_satoshis")]
    pub value: u64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RpcScriptPubKey,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct RpcScriptPubKey {
    pub asm: String,
    pub hex: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A block as returned by `getblock` with verbosity 2 (full transactions).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct RpcBlock {
    pub hash: String,
    pub height: u64,
    pub time: u64,
    /// Absent only for the genesis block; used by the listener's reorg
    /// check to confirm the chain it is walking has not forked
    /// underneath it.
    #[serde(default)]
    pub previousblockhash: Option<String>,
    pub tx: Vec<RpcTransaction>,
}

/// Bitcoin Core (and most `bitcoind`-alikes) represent amounts in the
/// node's native unit as a JSON float. The gateway's data model keeps
/// everything as integer satoshis, so every deserialization site for a
/// monetary value converts eagerly via this helper (multiply by 1e8,
/// round) rather than carrying floats further into the system.
pub fn deserialize_satoshis<'d, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'d>,
{
    struct SatVisitor;

    impl<'d> Visitor<'d> for SatVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "a float amount in the node's native unit")
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok((v * 100_000_000.0).round() as u64)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(v)
        }
    }
    deserializer.deserialize_any(SatVisitor)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(deserialize_with = "deserialize_satoshis")]
        value: u64,
    }

    #[test]
    fn converts_float_btc_to_satoshis() {
        let w: Wrapper = serde_json::from_str(r#"{"value": 0.000042}"#).unwrap();
        assert_eq!(w.value, 4200);

        let w: Wrapper = serde_json::from_str(r#"{"value": 1.23456789}"#).unwrap();
        assert_eq!(w.value, 123456789);
    }
}
