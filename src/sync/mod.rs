use bitcoin::{
    Block, BlockHash, NetworkKind, TxIn, TxOut, Txid, consensus::Decodable, p2p::Magic,
};
use serde::Deserialize;

use crate::error::Error;

pub mod blocks;
pub mod headers;
pub mod session;

/// Capability consumed by the block sync engine: every transaction of every
/// processed block is fed through all registered scanners, inputs first, then
/// outputs with their position.
///
/// Invoked on the peer session's read task, one event at a time; impls that
/// expose state to other tasks must synchronize internally.
pub trait TransactionScanner: Send + Sync {
    fn scan_input(&self, input: &TxIn);

    fn scan_output(&self, height: u64, txid: Txid, vout: u32, output: &TxOut);
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub network: Network,
    /// Trusted sync start; defaults to the network genesis
    pub checkpoint: Option<CheckpointConfig>,
    /// Seconds between reconnect/retry timer ticks
    pub tick_interval_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub p2p_address: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CheckpointConfig {
    pub hash: String,
    pub height: u64,
}

/// Immutable (hash, height) pair marking the root of the local header chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub hash: BlockHash,
    pub height: u64,
}

impl Config {
    pub fn checkpoint(&self) -> Result<Checkpoint, Error> {
        match &self.checkpoint {
            Some(configured) => Ok(Checkpoint {
                hash: configured.hash.parse().map_err(|e| {
                    Error::Config(format!("bad checkpoint hash {:?}: {e}", configured.hash))
                })?,
                height: configured.height,
            }),
            None => Ok(Checkpoint {
                hash: self.network.genesis_block().block_hash(),
                height: 0,
            }),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet4,
    Regtest,
}

impl Network {
    pub fn genesis_block(&self) -> Block {
        match self {
            Self::Mainnet => bitcoin::constants::genesis_block(bitcoin::Network::Bitcoin),
            Self::Testnet4 => {
                let raw_block = hex::decode("0100000000000000000000000000000000000000000000000000000000000000000000004e7b2b9128fe0291db0693af2ae418b767e657cd407e80cb1434221eaea7a07a046f3566ffff001dbb0c78170101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff5504ffff001d01044c4c30332f4d61792f323032342030303030303030303030303030303030303030303165626435386332343439373062336161396437383362623030313031316662653865613865393865303065ffffffff0100f2052a010000002321000000000000000000000000000000000000000000000000000000000000000000ac00000000").unwrap();
                Block::consensus_decode_from_finite_reader(&mut &raw_block[..]).unwrap()
            }
            Self::Regtest => bitcoin::constants::genesis_block(bitcoin::Network::Regtest),
        }
    }

    pub fn magic(&self) -> Magic {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin.magic(),
            Self::Testnet4 => Magic::from_bytes([0x1c, 0x16, 0x3f, 0x28]),
            Self::Regtest => bitcoin::Network::Regtest.magic(),
        }
    }

    pub fn kind(&self) -> NetworkKind {
        match self {
            Self::Mainnet => NetworkKind::Main,
            Self::Testnet4 | Self::Regtest => NetworkKind::Test,
        }
    }
}
