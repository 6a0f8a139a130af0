use std::{ops::Range, path::Path};

use bitcoin::{
    BlockHash, Transaction, Txid,
    block::Header,
    consensus::encode::{deserialize, serialize},
    hashes::Hash,
};
use rocksdb::{DB, IteratorMode, Options, ReadOptions, WriteBatch};
use tracing::debug;

use crate::error::Error;

// Single column family, with a one-byte tag namespacing each table.
const TAG_STATE: u8 = b'S';
const TAG_HEADER_BY_HASH: u8 = b'H';
const TAG_HASH_BY_HEIGHT: u8 = b'I';
const TAG_PENDING_TX: u8 = b'T';

const CURSOR_STATE_KEY: &[u8] = b"check_height";

/// Persistent store backing the sync engines: the sync cursor, the header
/// chain (addressable by hash and by height) and locally built transactions
/// awaiting delivery to the peer.
///
/// All operations are synchronous and individually transactional; a batch of
/// headers is inserted atomically via a single write batch.
pub struct Store {
    db: DB,
}

/// Shape of the stored header range. Heights are contiguous, so the span
/// determines the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSpan {
    pub count: u64,
    pub min: u64,
    pub max: u64,
}

fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + body.len());
    key.push(tag);
    key.extend_from_slice(body);
    key
}

fn tag_range(tag: u8) -> Range<Vec<u8>> {
    vec![tag]..vec![tag + 1]
}

fn decode_height(raw: &[u8]) -> Result<u64, Error> {
    let raw: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Corrupt("stored height is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(raw))
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        Ok(Self {
            db: DB::open(&opts, path)?,
        })
    }

    // state

    pub fn put_cursor(&self, height: u64) -> Result<(), Error> {
        self.db
            .put(tagged(TAG_STATE, CURSOR_STATE_KEY), height.to_be_bytes())?;

        Ok(())
    }

    pub fn cursor(&self) -> Result<Option<u64>, Error> {
        match self.db.get(tagged(TAG_STATE, CURSOR_STATE_KEY))? {
            Some(raw) => Ok(Some(decode_height(&raw)?)),
            None => Ok(None),
        }
    }

    // headers

    /// Append a batch of headers as one atomic write, assigning consecutive
    /// heights starting at `start_height`.
    pub fn insert_headers(&self, headers: &[Header], start_height: u64) -> Result<(), Error> {
        let mut batch = WriteBatch::default();

        for (i, header) in headers.iter().enumerate() {
            let height = start_height + i as u64;
            let hash = header.block_hash();

            // height (8 bytes BE) followed by the 80 byte consensus encoding
            let mut value = Vec::with_capacity(8 + 80);
            value.extend_from_slice(&height.to_be_bytes());
            value.extend_from_slice(&serialize(header));

            batch.put(tagged(TAG_HEADER_BY_HASH, hash.as_byte_array()), value);
            batch.put(
                tagged(TAG_HASH_BY_HEIGHT, &height.to_be_bytes()),
                hash.to_byte_array(),
            );

            debug!(height, %hash, "storing header");
        }

        self.db.write(batch)?;

        Ok(())
    }

    pub fn header_by_hash(&self, hash: &BlockHash) -> Result<Option<(Header, u64)>, Error> {
        match self.db.get(tagged(TAG_HEADER_BY_HASH, hash.as_byte_array()))? {
            Some(raw) => {
                if raw.len() < 8 {
                    return Err(Error::Corrupt(format!(
                        "header record for {hash} is truncated"
                    )));
                }

                let height = decode_height(&raw[..8])?;
                let header = deserialize(&raw[8..])?;

                Ok(Some((header, height)))
            }
            None => Ok(None),
        }
    }

    pub fn header_by_height(&self, height: u64) -> Result<Option<Header>, Error> {
        let Some(raw) = self
            .db
            .get(tagged(TAG_HASH_BY_HEIGHT, &height.to_be_bytes()))?
        else {
            return Ok(None);
        };

        let hash = BlockHash::from_byte_array(raw.as_slice().try_into().map_err(|_| {
            Error::Corrupt(format!("height index entry for {height} is malformed"))
        })?);

        match self.header_by_hash(&hash)? {
            Some((header, _)) => Ok(Some(header)),
            None => Err(Error::Corrupt(format!(
                "height {height} points at missing header {hash}"
            ))),
        }
    }

    /// Count and min/max height of the stored header chain, or `None` when no
    /// headers are stored yet.
    pub fn header_stats(&self) -> Result<Option<HeaderSpan>, Error> {
        let Some(min) = self.edge_height(IteratorMode::Start)? else {
            return Ok(None);
        };
        let Some(max) = self.edge_height(IteratorMode::End)? else {
            return Ok(None);
        };

        Ok(Some(HeaderSpan {
            count: max - min + 1,
            min,
            max,
        }))
    }

    fn edge_height(&self, mode: IteratorMode) -> Result<Option<u64>, Error> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(tag_range(TAG_HASH_BY_HEIGHT));

        let mut iter = self.db.iterator_opt(mode, read_opts);

        match iter.next() {
            Some(kv) => {
                let (key, _) = kv?;
                Ok(Some(decode_height(&key[1..])?))
            }
            None => Ok(None),
        }
    }

    // pending outbound transactions

    pub fn put_pending_tx(&self, tx: &Transaction) -> Result<(), Error> {
        let txid = tx.compute_txid();
        self.db
            .put(tagged(TAG_PENDING_TX, txid.as_byte_array()), serialize(tx))?;

        Ok(())
    }

    pub fn pending_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        match self.db.get(tagged(TAG_PENDING_TX, txid.as_byte_array()))? {
            Some(raw) => Ok(Some(deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn delete_pending_tx(&self, txid: &Txid) -> Result<(), Error> {
        self.db.delete(tagged(TAG_PENDING_TX, txid.as_byte_array()))?;

        Ok(())
    }

    pub fn pending_tx_ids(&self) -> Result<Vec<Txid>, Error> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(tag_range(TAG_PENDING_TX));

        let mut ids = Vec::new();

        for kv in self.db.iterator_opt(IteratorMode::Start, read_opts) {
            let (key, _) = kv?;
            let raw: [u8; 32] = key[1..]
                .try_into()
                .map_err(|_| Error::Corrupt("pending transaction key is malformed".into()))?;
            ids.push(Txid::from_byte_array(raw));
        }

        Ok(ids)
    }
}


#[cfg(test)]
mod tests {
    use bitcoin::{
        Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness, absolute::LockTime,
        transaction,
    };

    use super::{testutil::header_chain, *};

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (store, dir)
    }

    fn dummy_tx(value: u64) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn cursor_round_trip() {
        let (store, _dir) = temp_store();

        assert_eq!(store.cursor().unwrap(), None);

        store.put_cursor(42).unwrap();
        assert_eq!(store.cursor().unwrap(), Some(42));

        store.put_cursor(43).unwrap();
        assert_eq!(store.cursor().unwrap(), Some(43));
    }

    #[test]
    fn headers_addressable_by_hash_and_height() {
        let (store, _dir) = temp_store();
        let headers = header_chain(BlockHash::all_zeros(), 5);

        store.insert_headers(&headers, 100).unwrap();

        for (i, header) in headers.iter().enumerate() {
            let height = 100 + i as u64;

            let (by_hash, stored_height) =
                store.header_by_hash(&header.block_hash()).unwrap().unwrap();
            assert_eq!(by_hash, *header);
            assert_eq!(stored_height, height);

            assert_eq!(store.header_by_height(height).unwrap(), Some(*header));
        }

        assert_eq!(store.header_by_height(99).unwrap(), None);
        assert_eq!(store.header_by_height(105).unwrap(), None);
    }

    #[test]
    fn header_stats_track_contiguous_range() {
        let (store, _dir) = temp_store();

        assert_eq!(store.header_stats().unwrap(), None);

        let headers = header_chain(BlockHash::all_zeros(), 5);
        store.insert_headers(&headers[..2], 100).unwrap();
        store.insert_headers(&headers[2..], 102).unwrap();

        let span = store.header_stats().unwrap().unwrap();
        assert_eq!(span.min, 100);
        assert_eq!(span.max, 104);
        assert_eq!(span.count, 5);
    }

    #[test]
    fn pending_tx_lifecycle() {
        let (store, _dir) = temp_store();

        let tx_a = dummy_tx(5_000);
        let tx_b = dummy_tx(7_000);

        store.put_pending_tx(&tx_a).unwrap();
        store.put_pending_tx(&tx_b).unwrap();

        let txid_a = tx_a.compute_txid();

        assert_eq!(store.pending_tx(&txid_a).unwrap(), Some(tx_a));
        assert_eq!(store.pending_tx_ids().unwrap().len(), 2);

        store.delete_pending_tx(&txid_a).unwrap();

        assert_eq!(store.pending_tx(&txid_a).unwrap(), None);
        assert_eq!(store.pending_tx_ids().unwrap(), vec![tx_b.compute_txid()]);
    }
}
