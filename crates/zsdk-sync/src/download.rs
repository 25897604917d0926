//! Batched compact block download.

use crate::backend::{BlockCacheStore, BlockRange, CompactBlock, RemoteChainService};
use crate::{Error, Result};
use futures::StreamExt;
use zsdk_params::BlockHeight;

/// Height and hash of a downloaded block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    /// Block height
    pub height: BlockHeight,
    /// Block hash
    pub hash: Vec<u8>,
}

/// One unit of download work. Lives for a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadBatch {
    /// Position within the pass
    pub order: usize,
    /// Heights covered
    pub range: BlockRange,
    /// Filled in once the batch has been written to the cache
    pub blocks: Option<Vec<BlockMeta>>,
}

impl DownloadBatch {
    /// Split `range` into batches of at most `batch_size` blocks
    pub fn plan(range: BlockRange, batch_size: u32) -> Vec<DownloadBatch> {
        range
            .chunks(batch_size)
            .into_iter()
            .enumerate()
            .map(|(order, range)| DownloadBatch {
                order,
                range,
                blocks: None,
            })
            .collect()
    }

    /// Whether the batch has been written to the cache
    pub fn is_complete(&self) -> bool {
        self.blocks.is_some()
    }

    /// Stream the batch from `remote` and write it to `cache`.
    pub async fn fetch(
        &mut self,
        remote: &dyn RemoteChainService,
        cache: &dyn BlockCacheStore,
    ) -> Result<()> {
        let mut stream = remote.block_range(self.range).await?;
        let mut blocks: Vec<CompactBlock> = Vec::with_capacity(self.range.len() as usize);
        let mut expected = self.range.start;

        while let Some(block) = stream.next().await {
            let block = block?;
            if block.height != expected {
                return Err(Error::Sync(format!(
                    "Out of order block in batch {}: expected {}, got {}",
                    self.range, expected, block.height
                )));
            }
            blocks.push(block);
            if expected >= self.range.end {
                break;
            }
            expected = expected.checked_add(1)?;
        }

        if blocks.len() as u32 != self.range.len() {
            return Err(Error::Network(format!(
                "Short batch {}: received {} of {} blocks",
                self.range,
                blocks.len(),
                self.range.len()
            )));
        }

        let meta = blocks
            .iter()
            .map(|b| BlockMeta {
                height: b.height,
                hash: b.hash.clone(),
            })
            .collect();
        cache.write_batch(blocks).await?;
        self.blocks = Some(meta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zsdk_params::NetworkType;

    fn h(v: u64) -> BlockHeight {
        BlockHeight::new(v, NetworkType::Regtest).unwrap()
    }

    #[test]
    fn test_plan_orders_batches() {
        let range = BlockRange::new(h(1), h(250)).unwrap();
        let batches = DownloadBatch::plan(range, 100);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].order, 2);
        assert_eq!(batches[2].range.start, h(201));
        assert!(batches.iter().all(|b| !b.is_complete()));
    }
}
