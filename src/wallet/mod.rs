use std::{collections::HashMap, sync::Mutex};

use bitcoin::{
    Amount, NetworkKind, OutPoint, Script, TxIn, TxOut, Txid,
    bip32::{ChildNumber, Xpriv},
    hashes::{Hash, hash160, sha256},
    secp256k1::{Secp256k1, rand, rand::Rng},
};
use tracing::{debug, info};

use crate::{error::Error, sync::TransactionScanner};

/// Size of the watched-key set, derived once at startup and immutable after.
pub const WATCHED_KEY_COUNT: u32 = 255;

// m/44'/1'/0'/0/i
const PURPOSE: ChildNumber = ChildNumber::Hardened { index: 44 };
const COIN_TYPE: ChildNumber = ChildNumber::Hardened { index: 1 };
const ACCOUNT: ChildNumber = ChildNumber::Hardened { index: 0 };
const CHANGE: ChildNumber = ChildNumber::Normal { index: 0 };

/// The two output script shapes the tracker recognizes. Anything else, even
/// a near miss of the right length, is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh,
    P2wpkh,
}

/// Lifecycle of a tracked output. `Lock` is reserved for transaction
/// building and `Fork` for reorg invalidation; neither is assigned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoStatus {
    CanUse,
    Lock,
    Used,
    Fork,
}

/// A pre-derived key the tracker watches for, reduced to its hash160
/// fingerprint as embedded in output scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedKey {
    pub pubkey_hash: [u8; 20],
    pub index: u32,
}

/// A matched output. Records are append-only; spending flips the status to
/// `Used` but never removes the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub value: Amount,
    pub height: u64,
    pub key_index: u32,
    pub kind: ScriptKind,
    pub status: UtxoStatus,
}

/// Watches a fixed set of derived keys and maintains the wallet's UTXO map
/// as blocks are scanned.
///
/// The key set is derived once along `m/44'/1'/0'/0/i` for i in [0, 255) and
/// never extended; address issuance picks a random member, so reuse across
/// calls is expected.
pub struct UtxoTracker {
    watched: Vec<WatchedKey>,
    utxos: Mutex<HashMap<OutPoint, Utxo>>,
}

/// Matches a script against the two watched templates, returning the kind
/// and the embedded hash160 fingerprint.
fn classify(script: &Script) -> Option<(ScriptKind, [u8; 20])> {
    let bytes = script.as_bytes();

    if script.is_p2wpkh() {
        // 00 14 <20 byte hash>
        let hash: [u8; 20] = bytes[2..22].try_into().ok()?;
        return Some((ScriptKind::P2wpkh, hash));
    }

    if script.is_p2pkh() {
        // 76 a9 14 <20 byte hash> 88 ac
        let hash: [u8; 20] = bytes[3..23].try_into().ok()?;
        return Some((ScriptKind::P2pkh, hash));
    }

    None
}

/// Reduces a passphrase to the 32 byte master seed.
pub fn seed_from_passphrase(passphrase: &str) -> [u8; 32] {
    sha256::Hash::hash(passphrase.as_bytes()).to_byte_array()
}

impl UtxoTracker {
    pub fn new(seed: &[u8], network: NetworkKind) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)?;

        let branch = master.derive_priv(&secp, &[PURPOSE, COIN_TYPE, ACCOUNT, CHANGE])?;

        let mut watched = Vec::with_capacity(WATCHED_KEY_COUNT as usize);

        for index in 0..WATCHED_KEY_COUNT {
            let child = branch.derive_priv(&secp, &[ChildNumber::Normal { index }])?;
            let pubkey = child.private_key.public_key(&secp);

            watched.push(WatchedKey {
                pubkey_hash: hash160::Hash::hash(&pubkey.serialize()).to_byte_array(),
                index,
            });
        }

        debug!(count = watched.len(), "derived watched key set");

        Ok(Self {
            watched,
            utxos: Mutex::new(HashMap::new()),
        })
    }

    /// Issues an address fingerprint by uniform random pick from the watched
    /// set. No gap limit; handing out the same key twice is fine.
    pub fn new_pkh(&self) -> &WatchedKey {
        let index = rand::thread_rng().gen_range(0..self.watched.len());
        &self.watched[index]
    }

    pub fn watched_keys(&self) -> &[WatchedKey] {
        &self.watched
    }

    fn watched_index(&self, pubkey_hash: &[u8; 20]) -> Option<u32> {
        self.watched
            .iter()
            .find(|key| key.pubkey_hash == *pubkey_hash)
            .map(|key| key.index)
    }

    /// Snapshot of the UTXO map, spent entries included.
    pub fn utxos(&self) -> Vec<(OutPoint, Utxo)> {
        self.utxos
            .lock()
            .expect("utxo lock")
            .iter()
            .map(|(outpoint, utxo)| (*outpoint, *utxo))
            .collect()
    }

    pub fn spendable_balance(&self) -> Amount {
        self.utxos
            .lock()
            .expect("utxo lock")
            .values()
            .filter(|utxo| utxo.status == UtxoStatus::CanUse)
            .map(|utxo| utxo.value)
            .sum()
    }
}

impl TransactionScanner for UtxoTracker {
    fn scan_input(&self, input: &TxIn) {
        let mut utxos = self.utxos.lock().expect("utxo lock");

        if let Some(utxo) = utxos.get_mut(&input.previous_output) {
            if utxo.status != UtxoStatus::Used {
                info!(outpoint = %input.previous_output, value = %utxo.value, "utxo spent");
                utxo.status = UtxoStatus::Used;
            }
        }
    }

    fn scan_output(&self, height: u64, txid: Txid, vout: u32, output: &TxOut) {
        let Some((kind, hash)) = classify(&output.script_pubkey) else {
            return;
        };

        let Some(key_index) = self.watched_index(&hash) else {
            return;
        };

        let outpoint = OutPoint { txid, vout };
        let mut utxos = self.utxos.lock().expect("utxo lock");

        // reprocessing a block must not duplicate or reset an entry
        if utxos.contains_key(&outpoint) {
            return;
        }

        info!(%outpoint, value = %output.value, key_index, "utxo received");

        utxos.insert(
            outpoint,
            Utxo {
                value: output.value,
                height,
                key_index,
                kind,
                status: UtxoStatus::CanUse,
            },
        );
    }
}
