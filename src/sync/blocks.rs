use std::sync::atomic::Ordering;

use bitcoin::{
    Block,
    p2p::{message::NetworkMessage, message_blockdata::Inventory},
};
use tracing::{debug, info, trace, warn};

use crate::{error::Error, sync::session::Session};

impl Session {
    /// Requests the block at the sync cursor, one in flight at a time. With
    /// no stored header at the cursor the chain is fully processed; the
    /// cursor is persisted and nothing is requested until new headers arrive.
    pub(crate) fn request_next_block(&self) {
        if let Err(e) = self.request_next_block_inner() {
            warn!("requesting block failed: {e}");
            self.flags.block_error.store(true, Ordering::SeqCst);
        }
    }

    fn request_next_block_inner(&self) -> Result<(), Error> {
        let height = self.check_height.load(Ordering::SeqCst);

        match self.store.header_by_height(height)? {
            Some(header) => {
                trace!(height, "requesting block");
                self.send(NetworkMessage::GetData(vec![Inventory::WitnessBlock(
                    header.block_hash(),
                )]));
            }
            None => {
                debug!(height, "block download caught up with the header chain");
                self.store.put_cursor(height)?;
            }
        }

        Ok(())
    }

    pub(crate) fn handle_block(&self, block: Block) {
        if let Err(e) = self.process_block(block) {
            warn!("processing block failed: {e}");
            self.flags.block_error.store(true, Ordering::SeqCst);
        }
    }

    fn process_block(&self, block: Block) -> Result<(), Error> {
        let hash = block.block_hash();

        let Some((_, height)) = self.store.header_by_hash(&hash)? else {
            if hash == self.checkpoint.hash {
                // checkpoint bootstrap: the first header is learned from the
                // block body, then header sync proceeds from it
                info!(%hash, height = self.checkpoint.height, "learned checkpoint header");
                self.store
                    .insert_headers(&[block.header], self.checkpoint.height)?;
                self.request_headers();
                return Ok(());
            }

            warn!(%hash, "received a block with no stored header");
            self.flags.block_error.store(true, Ordering::SeqCst);
            return Ok(());
        };

        let cursor = self.check_height.load(Ordering::SeqCst);
        if height != cursor {
            warn!(height, cursor, "received a block out of order");
            self.flags.block_error.store(true, Ordering::SeqCst);
            return Ok(());
        }

        for tx in &block.txdata {
            let txid = tx.compute_txid();

            for input in &tx.input {
                for registered in &self.scanners {
                    registered.scanner.scan_input(input);
                }
            }

            for (vout, output) in tx.output.iter().enumerate() {
                for registered in &self.scanners {
                    registered
                        .scanner
                        .scan_output(height, txid, vout as u32, output);
                }
            }
        }

        debug!(height, txs = block.txdata.len(), "processed block");

        self.check_height.store(height + 1, Ordering::SeqCst);
        self.store.put_cursor(height + 1)?;

        self.request_next_block();

        Ok(())
    }
}
