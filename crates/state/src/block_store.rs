use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_common::{Block, BlockMeta, Commit, Part, PartSet};
use parking_lot::RwLock;

/// Storage of committed blocks, their parts and commits.
pub trait BlockStore: Send + Sync {
    /// The lowest height still stored, or zero if empty.
    fn base(&self) -> i64;

    /// The highest stored height, or zero if empty.
    fn height(&self) -> i64;

    fn size(&self) -> i64 {
        let height = self.height();
        if height == 0 {
            0
        } else {
            height - self.base() + 1
        }
    }

    fn load_block(&self, height: i64) -> Option<Arc<Block>>;

    fn load_block_meta(&self, height: i64) -> Option<BlockMeta>;

    fn load_block_part(&self, height: i64, index: usize) -> Option<Arc<Part>>;

    /// The commit for block `height`, as included in block `height + 1`.
    fn load_block_commit(&self, height: i64) -> Option<Commit>;

    /// The commit this node saw for the block at `height`, available only
    /// for the last stored block.
    fn load_seen_commit(&self) -> Option<Commit>;

    /// Stores a block and the commit seen for it. Blocks must be saved in
    /// height order without gaps.
    fn save_block(&self, block: Arc<Block>, parts: &PartSet, seen_commit: Commit);

    /// Removes blocks below `height`, returning how many were removed.
    fn prune_blocks(&self, height: i64) -> u64;
}

struct StoredBlock {
    block: Arc<Block>,
    meta: BlockMeta,
    parts: PartSet,
}

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<i64, StoredBlock>,
    commits: BTreeMap<i64, Commit>,
    seen_commit: Option<Commit>,
}

/// An in-memory [`BlockStore`]. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn base(&self) -> i64 {
        self.inner
            .read()
            .blocks
            .keys()
            .next()
            .copied()
            .unwrap_or(0)
    }

    fn height(&self) -> i64 {
        self.inner
            .read()
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    fn load_block(&self, height: i64) -> Option<Arc<Block>> {
        self.inner
            .read()
            .blocks
            .get(&height)
            .map(|stored| stored.block.clone())
    }

    fn load_block_meta(&self, height: i64) -> Option<BlockMeta> {
        self.inner
            .read()
            .blocks
            .get(&height)
            .map(|stored| stored.meta.clone())
    }

    fn load_block_part(&self, height: i64, index: usize) -> Option<Arc<Part>> {
        self.inner
            .read()
            .blocks
            .get(&height)
            .and_then(|stored| stored.parts.get_part(index))
    }

    fn load_block_commit(&self, height: i64) -> Option<Commit> {
        self.inner.read().commits.get(&height).cloned()
    }

    fn load_seen_commit(&self) -> Option<Commit> {
        self.inner.read().seen_commit.clone()
    }

    fn save_block(&self, block: Arc<Block>, parts: &PartSet, seen_commit: Commit) {
        let height = block.height();
        let mut inner = self.inner.write();
        if let Some((&last, _)) = inner.blocks.iter().next_back() {
            assert_eq!(
                height,
                last + 1,
                "blocks must be saved contiguously, store is at {last}"
            );
        }
        assert!(parts.is_complete(), "cannot save a block with missing parts");

        if block.last_commit.height > 0 {
            inner
                .commits
                .insert(height - 1, block.last_commit.clone());
        }
        inner.blocks.insert(
            height,
            StoredBlock {
                meta: BlockMeta::new(&block, parts),
                block,
                parts: parts.clone(),
            },
        );
        inner.seen_commit = Some(seen_commit);
    }

    fn prune_blocks(&self, height: i64) -> u64 {
        let mut inner = self.inner.write();
        let kept = inner.blocks.split_off(&height);
        let pruned = std::mem::replace(&mut inner.blocks, kept).len() as u64;
        inner.commits = inner.commits.split_off(&height);
        pruned
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use meridian_common::BLOCK_PART_SIZE_BYTES;

    use super::*;
    use crate::test_utils::genesis;
    use crate::State;

    fn block(state: &State, height: i64, last_commit: Commit) -> (Arc<Block>, PartSet) {
        let proposer = state.validators.validators()[0].address.clone();
        let block = state.make_block(height, SystemTime::now(), Vec::new(), last_commit, Vec::new(), proposer);
        let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
        (Arc::new(block), parts)
    }

    #[test]
    fn saves_and_prunes() {
        let state = State::from_genesis(&genesis(1)).unwrap();
        let store = MemoryBlockStore::new();
        assert_eq!((store.base(), store.height(), store.size()), (0, 0, 0));

        let (b1, p1) = block(&state, 1, Commit::default());
        let c1 = Commit {
            height: 1,
            block_id: meridian_common::BlockId::new(b1.hash(), p1.header()),
            ..Default::default()
        };
        store.save_block(b1.clone(), &p1, c1.clone());
        let (b2, p2) = block(&state, 2, c1.clone());
        store.save_block(b2, &p2, Commit::default());

        assert_eq!((store.base(), store.height(), store.size()), (1, 2, 2));
        assert_eq!(store.load_block(1).unwrap(), b1);
        assert_eq!(store.load_block_commit(1), Some(c1));
        assert_eq!(store.load_block_meta(1).unwrap().block_id.hash, b1.hash());
        assert_eq!(*store.load_block_part(1, 0).unwrap(), *p1.get_part(0).unwrap());

        assert_eq!(store.prune_blocks(2), 1);
        assert_eq!(store.base(), 2);
        assert!(store.load_block(1).is_none());
    }
}
