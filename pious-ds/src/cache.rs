// Segmented-LRU data cache over the stable-storage layer.
//
// Two segments, protected and probationary: a miss installs the block in
// probationary, a probationary hit promotes to protected, protected
// evictions demote back into probationary, probationary evictions leave the
// cache (after write-back when dirty). Committed volatile writes stay dirty
// until evicted or flushed; stable commits force their blocks down at commit
// time via flush_blocks.

use crate::sfile::{OpResult, SFile};
use pious_base::FHandle;
use std::collections::{HashMap, VecDeque};

pub(crate) type BlockKey = (FHandle, i64);

struct Block {
    data: Vec<u8>,
    /// Bytes of `data` that exist on disk or have been written; write-back
    /// stops here so the cache never extends a file past its real contents.
    valid: usize,
    dirty: bool,
}

pub(crate) struct Cache {
    blksz: usize,
    prot_cap: usize,
    prob_cap: usize,
    // Front is most recently used.
    protected: VecDeque<BlockKey>,
    probationary: VecDeque<BlockKey>,
    blocks: HashMap<BlockKey, Block>,
}

impl Cache {
    /// `nblocks` is the effective count: zero disables caching entirely and
    /// every access goes straight to storage.
    pub(crate) fn new(blksz: usize, nblocks: usize) -> Cache {
        let prot_cap = nblocks / 2;
        Cache {
            blksz,
            prot_cap,
            prob_cap: nblocks - prot_cap,
            protected: VecDeque::new(),
            probationary: VecDeque::new(),
            blocks: HashMap::new(),
        }
    }

    fn enabled(&self) -> bool {
        self.prot_cap + self.prob_cap > 0
    }

    /// Reference `key`, promoting or installing as the segments require;
    /// the block must already be in `self.blocks` or `miss` is used to
    /// build it. Any block pushed out of probationary is written back.
    fn touch(&mut self, sf: &SFile, key: BlockKey, miss: Option<Block>) -> OpResult<()> {
        if let Some(pos) = self.protected.iter().position(|k| *k == key) {
            self.protected.remove(pos);
            self.protected.push_front(key);
            return Ok(());
        }
        if let Some(pos) = self.probationary.iter().position(|k| *k == key) {
            // Re-reference: promote into the protected segment.
            self.probationary.remove(pos);
            self.protected.push_front(key);
        } else {
            let block = miss.expect("missed block not supplied");
            self.blocks.insert(key, block);
            self.probationary.push_front(key);
        }
        while self.protected.len() > self.prot_cap {
            let demoted = self.protected.pop_back().unwrap();
            self.probationary.push_front(demoted);
        }
        while self.probationary.len() > self.prob_cap {
            let evicted = self.probationary.pop_back().unwrap();
            let block = self.blocks.remove(&evicted).unwrap();
            if block.dirty {
                sf.write_at(evicted.0, evicted.1 * self.blksz as i64, &block.data[..block.valid])?;
            }
        }
        Ok(())
    }

    fn load(&mut self, sf: &SFile, key: BlockKey) -> OpResult<()> {
        if self.blocks.contains_key(&key) {
            self.touch(sf, key, None)
        } else {
            let mut data = vec![0u8; self.blksz];
            let valid = sf.read_at(key.0, key.1 * self.blksz as i64, &mut data)?;
            self.touch(
                sf,
                key,
                Some(Block {
                    data,
                    valid,
                    dirty: false,
                }),
            )
        }
    }

    /// Fill `buf` from the file at `offset`; bytes past end of file come
    /// back zeroed, callers bound the length beforehand.
    pub(crate) fn read(
        &mut self,
        sf: &SFile,
        fhandle: FHandle,
        offset: i64,
        buf: &mut [u8],
    ) -> OpResult<()> {
        if !self.enabled() {
            buf.fill(0);
            sf.read_at(fhandle, offset, buf)?;
            return Ok(());
        }
        let blksz = self.blksz as i64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as i64;
            let blkno = pos / blksz;
            let blkoff = (pos % blksz) as usize;
            let take = buf.len() - done;
            let take = take.min(self.blksz - blkoff);
            self.load(sf, (fhandle, blkno))?;
            let block = &self.blocks[&(fhandle, blkno)];
            buf[done..done + take].copy_from_slice(&block.data[blkoff..blkoff + take]);
            done += take;
        }
        Ok(())
    }

    /// Apply a committed write through the cache, dirtying the touched
    /// blocks; returns their keys so a stable commit can force them down.
    pub(crate) fn write(
        &mut self,
        sf: &SFile,
        fhandle: FHandle,
        offset: i64,
        data: &[u8],
    ) -> OpResult<Vec<BlockKey>> {
        if !self.enabled() {
            sf.write_at(fhandle, offset, data)?;
            return Ok(Vec::new());
        }
        let blksz = self.blksz as i64;
        let mut keys = Vec::new();
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as i64;
            let blkno = pos / blksz;
            let blkoff = (pos % blksz) as usize;
            let take = (data.len() - done).min(self.blksz - blkoff);
            let key = (fhandle, blkno);
            self.load(sf, key)?;
            let block = self.blocks.get_mut(&key).unwrap();
            block.data[blkoff..blkoff + take].copy_from_slice(&data[done..done + take]);
            block.valid = block.valid.max(blkoff + take);
            block.dirty = true;
            keys.push(key);
            done += take;
        }
        Ok(keys)
    }

    /// Synchronous write-back of specific blocks plus an fsync of their
    /// files; the stable-commit path.
    pub(crate) fn flush_blocks(&mut self, sf: &SFile, keys: &[BlockKey]) -> OpResult<()> {
        let mut files: Vec<FHandle> = Vec::new();
        for key in keys {
            if let Some(block) = self.blocks.get_mut(key) {
                if block.dirty {
                    sf.write_at(key.0, key.1 * self.blksz as i64, &block.data[..block.valid])?;
                    block.dirty = false;
                }
            }
            if !files.contains(&key.0) {
                files.push(key.0);
            }
        }
        for fh in files {
            sf.sync(fh)?;
        }
        Ok(())
    }

    /// File length as readers must see it: the stored length extended by
    /// any dirty cached block past it.
    pub(crate) fn len(&self, sf: &SFile, fhandle: FHandle) -> OpResult<i64> {
        let mut len = sf.len(fhandle)?;
        for ((fh, blkno), block) in &self.blocks {
            if *fh == fhandle {
                len = len.max(blkno * self.blksz as i64 + block.valid as i64);
            }
        }
        Ok(len)
    }

    /// Force every dirty block to storage and fsync the touched files.
    pub(crate) fn flush_all(&mut self, sf: &SFile) -> OpResult<()> {
        let dirty: Vec<BlockKey> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.dirty)
            .map(|(k, _)| *k)
            .collect();
        self.flush_blocks(sf, &dirty)
    }

    /// Forget all blocks of a file whose handle went stale (unlink).
    pub(crate) fn drop_file(&mut self, fhandle: FHandle) {
        self.protected.retain(|k| k.0 != fhandle);
        self.probationary.retain(|k| k.0 != fhandle);
        self.blocks.retain(|k, _| k.0 != fhandle);
    }

    #[cfg(test)]
    pub(crate) fn residency(&self, key: &BlockKey) -> (bool, bool) {
        (
            self.protected.contains(key),
            self.probationary.contains(key),
        )
    }
}
