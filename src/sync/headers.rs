use std::sync::atomic::Ordering;

use bitcoin::{
    BlockHash,
    block::Header,
    hashes::Hash,
    p2p::{
        message::NetworkMessage, message_blockdata::GetHeadersMessage,
        message_blockdata::Inventory,
    },
};
use tracing::{debug, info, trace, warn};

use crate::{error::Error, sync::session::Session};

/// Nodes cap a headers response at this many entries; receiving a full page
/// means more are available.
const MAX_HEADERS_PER_PAGE: usize = 2000;

/// How far below the stored tip the getheaders locator starts. A small
/// overlap keeps a single stale locator from stalling sync.
const LOCATOR_LOOKBACK: u64 = 6;

impl Session {
    /// Asks the peer for headers extending the stored chain. On a fresh
    /// store there is no header to build a locator from, so the checkpoint
    /// block itself is fetched first and its header learned from the body.
    pub(crate) fn request_headers(&self) {
        if let Err(e) = self.request_headers_inner() {
            warn!("requesting headers failed: {e}");
            self.flags.header_error.store(true, Ordering::SeqCst);
        }
    }

    fn request_headers_inner(&self) -> Result<(), Error> {
        let Some(span) = self.store.header_stats()? else {
            info!(checkpoint = %self.checkpoint.hash, "bootstrapping from checkpoint block");
            self.send(NetworkMessage::GetData(vec![Inventory::WitnessBlock(
                self.checkpoint.hash,
            )]));
            return Ok(());
        };

        let locator_height = span.max.saturating_sub(LOCATOR_LOOKBACK).max(span.min);

        let Some(locator) = self.store.header_by_height(locator_height)? else {
            return Err(Error::Corrupt(format!(
                "no header stored at locator height {locator_height}"
            )));
        };

        self.send_get_headers(locator.block_hash());

        Ok(())
    }

    fn send_get_headers(&self, locator: BlockHash) {
        trace!(%locator, "requesting headers");

        self.send(NetworkMessage::GetHeaders(GetHeadersMessage::new(
            vec![locator],
            BlockHash::all_zeros(),
        )));
    }

    /// A headers response either extends the tip, overlaps what is already
    /// stored, or contradicts the stored chain (a fork, which is reported and
    /// left alone). An empty response means the peer has nothing newer and
    /// block download can proceed.
    pub(crate) fn handle_headers(&self, headers: Vec<Header>) {
        if let Err(e) = self.extend_header_chain(&headers) {
            warn!("processing headers failed: {e}");
            self.flags.header_error.store(true, Ordering::SeqCst);
        }
    }

    fn extend_header_chain(&self, headers: &[Header]) -> Result<(), Error> {
        let Some(last) = headers.last() else {
            trace!("header chain is up to date");
            self.request_next_block();
            return Ok(());
        };

        let full_page = headers.len() == MAX_HEADERS_PER_PAGE;
        let anchor = last.block_hash();

        // skip the overlap with headers already stored, from the locator
        // lookback or a repeated response
        let mut fresh = &headers[..];
        while let [first, rest @ ..] = fresh {
            if self.store.header_by_hash(&first.block_hash())?.is_none() {
                break;
            }
            fresh = rest;
        }

        if let [first, ..] = fresh {
            let Some(span) = self.store.header_stats()? else {
                return Err(Error::Corrupt(
                    "received headers before any are stored".into(),
                ));
            };

            // the first new header must sit on the stored tip
            match self.store.header_by_hash(&first.prev_blockhash)? {
                Some((_, height)) if height == span.max => {}
                _ => {
                    warn!(
                        tip = span.max,
                        received = %first.block_hash(),
                        "received headers do not extend the local chain; possible fork"
                    );
                    self.flags.fork_detected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            }

            self.store.insert_headers(fresh, span.max + 1)?;

            debug!(
                count = fresh.len(),
                tip = span.max + fresh.len() as u64,
                "extended header chain"
            );
        }

        if full_page {
            // more pages behind this one
            self.send_get_headers(anchor);
        } else {
            self.request_next_block();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::{super::session::testutil::test_session, *};
    use crate::{
        storage::{Store, testutil::header_chain},
        sync::Network,
    };

    fn seeded_session(
        chain_len: usize,
    ) -> (
        Arc<Session>,
        UnboundedReceiver<NetworkMessage>,
        Vec<Header>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());

        let genesis = Network::Regtest.genesis_block().header;
        store.insert_headers(&[genesis], 0).unwrap();

        let chain = header_chain(genesis.block_hash(), chain_len);
        if !chain.is_empty() {
            store.insert_headers(&chain, 1).unwrap();
        }

        let (session, outbound) = test_session(store);
        (session, outbound, chain, dir)
    }

    fn expect_block_request(outbound: &mut UnboundedReceiver<NetworkMessage>, hash: BlockHash) {
        match outbound.try_recv().unwrap() {
            NetworkMessage::GetData(inv) => {
                assert_eq!(inv, vec![Inventory::WitnessBlock(hash)]);
            }
            other => panic!("expected getdata, got {:?}", other.command()),
        }
    }

    fn expect_get_headers(outbound: &mut UnboundedReceiver<NetworkMessage>) -> GetHeadersMessage {
        match outbound.try_recv().unwrap() {
            NetworkMessage::GetHeaders(msg) => msg,
            other => panic!("expected getheaders, got {:?}", other.command()),
        }
    }

    #[test]
    fn fresh_store_bootstraps_from_checkpoint_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let (session, mut outbound) = test_session(store);

        session.request_headers();

        expect_block_request(
            &mut outbound,
            Network::Regtest.genesis_block().block_hash(),
        );
    }

    #[test]
    fn locator_sits_a_lookback_below_the_tip() {
        let (session, mut outbound, chain, _dir) = seeded_session(10);

        session.request_headers();

        // tip is at height 10, so the locator is the header at height 4
        let msg = expect_get_headers(&mut outbound);
        assert_eq!(msg.locator_hashes, vec![chain[3].block_hash()]);
        assert_eq!(msg.stop_hash, BlockHash::all_zeros());
    }

    #[test]
    fn short_chain_locator_clamps_to_the_oldest_header() {
        let (session, mut outbound, _chain, _dir) = seeded_session(2);

        session.request_headers();

        let msg = expect_get_headers(&mut outbound);
        assert_eq!(
            msg.locator_hashes,
            vec![Network::Regtest.genesis_block().block_hash()]
        );
    }

    #[test]
    fn empty_response_moves_on_to_block_download() {
        let (session, mut outbound, _chain, _dir) = seeded_session(0);

        session.handle_headers(vec![]);

        // the block at the sync cursor (genesis, height 0) is requested
        expect_block_request(
            &mut outbound,
            Network::Regtest.genesis_block().block_hash(),
        );
    }

    #[test]
    fn extension_is_stored_and_block_download_resumes() {
        let (session, mut outbound, chain, _dir) = seeded_session(3);

        let extension = header_chain(chain[2].block_hash(), 4);
        session.handle_headers(extension.clone());

        let span = session.store().header_stats().unwrap().unwrap();
        assert_eq!(span.max, 7);
        assert_eq!(
            session.store().header_by_height(7).unwrap(),
            Some(extension[3])
        );

        expect_block_request(
            &mut outbound,
            Network::Regtest.genesis_block().block_hash(),
        );
    }

    #[test]
    fn overlapping_response_stores_only_the_new_headers() {
        let (session, mut outbound, chain, _dir) = seeded_session(3);

        // headers 2 and 3 are already stored, 4 and 5 are new
        let mut page = vec![chain[1], chain[2]];
        page.extend(header_chain(chain[2].block_hash(), 2));

        session.handle_headers(page);

        let span = session.store().header_stats().unwrap().unwrap();
        assert_eq!(span.max, 5);

        let _ = outbound.try_recv().unwrap();
    }

    #[test]
    fn fully_known_response_is_a_no_op_on_the_store() {
        let (session, mut outbound, chain, _dir) = seeded_session(3);

        session.handle_headers(chain);

        let span = session.store().header_stats().unwrap().unwrap();
        assert_eq!(span.max, 3);
        assert!(!session.fork_detected());

        // not a full page, so block download resumes
        expect_block_request(
            &mut outbound,
            Network::Regtest.genesis_block().block_hash(),
        );
    }

    #[test]
    fn full_page_is_followed_up_from_its_last_header() {
        let (session, mut outbound, chain, _dir) = seeded_session(1);

        let page = header_chain(chain[0].block_hash(), MAX_HEADERS_PER_PAGE);
        session.handle_headers(page.clone());

        let span = session.store().header_stats().unwrap().unwrap();
        assert_eq!(span.max, 1 + MAX_HEADERS_PER_PAGE as u64);

        let msg = expect_get_headers(&mut outbound);
        assert_eq!(msg.locator_hashes, vec![page[1999].block_hash()]);
    }

    #[test]
    fn headers_off_the_tip_raise_the_fork_flag() {
        let (session, mut outbound, chain, _dir) = seeded_session(3);

        // a branch off the header at height 1, below the stored tip
        let branch = header_chain(chain[0].block_hash(), 2);

        session.handle_headers(branch);

        assert!(session.fork_detected());
        assert_eq!(session.store().header_stats().unwrap().unwrap().max, 3);
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn headers_with_unknown_parent_raise_the_fork_flag() {
        let (session, mut outbound, _chain, _dir) = seeded_session(3);

        let orphans = header_chain(BlockHash::from_byte_array([0xab; 32]), 2);
        session.handle_headers(orphans);

        assert!(session.fork_detected());
        assert!(outbound.try_recv().is_err());
    }
}
