//! Arena-style memory pool for pixel storage.
//!
//! The arena is a list of large zeroed chunks laid end to end in one offset
//! space. Every block is described by a record `{id, offset, size, alignment,
//! in_use, chunk}` kept in offset order, and blocks are referenced by handle
//! (`BlockId` + offset), never by raw pointer. A [`PoolBlock`] views its byte
//! range inside the chunk that backs it.
//!
//! Live blocks never move. When the arena is exhausted a new chunk is added
//! that at least doubles the arena, instead of reallocating and copying the
//! existing chunks under the feet of live blocks. Blocks never straddle two
//! chunks.
//!
//! # Lifecycle
//!
//! ```text
//! allocate ──► first-fit over free records ──hit──► reuse (split if oversized)
//!                     │ miss
//!                     ▼
//!              carve at arena top ──full──► add chunk (arena at least 2x)
//!
//! deallocate ──► mark free ──every 10th──► coalesce adjacent free records
//! ```

use crate::core::error::{ProcessingError, ProcessingResult};
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cache line size; every block and buffer stride is a multiple of it.
pub const CACHE_LINE: usize = 64;

/// Every Nth deallocation triggers coalescing of free blocks.
pub const COALESCE_INTERVAL: u64 = 10;

/// Oversized first-fit hits are split when the remainder is at least this big.
pub const MIN_SPLIT_BYTES: usize = 4 * 1024;

/// Granularity used by the fragmentation heuristic.
const FRAGMENTATION_UNIT: usize = 64 * 1024;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
struct CacheLine([u8; CACHE_LINE]);

fn reserve_lines<T>(lines: &mut Vec<T>, len: usize) -> ProcessingResult<usize> {
    let line_count = len.div_ceil(CACHE_LINE);
    lines
        .try_reserve_exact(line_count)
        .map_err(|_| ProcessingError::AllocationFailure {
            requested: len,
            alignment: CACHE_LINE,
        })?;
    Ok(line_count)
}

/// Owned byte storage whose start is aligned to a cache line.
///
/// Used for buffers that live outside any pool.
#[derive(Clone)]
pub struct AlignedBytes {
    lines: Vec<CacheLine>,
    len: usize,
}

impl AlignedBytes {
    /// Allocate zeroed storage of `len` bytes, failing instead of aborting on OOM.
    pub fn try_zeroed(len: usize) -> ProcessingResult<Self> {
        let mut lines = Vec::new();
        let line_count = reserve_lines(&mut lines, len)?;
        lines.resize(line_count, CacheLine::zeroed());
        Ok(Self { lines, len })
    }

    /// Copy a byte slice into fresh aligned storage.
    pub fn copy_from(bytes: &[u8]) -> Self {
        let line_count = bytes.len().div_ceil(CACHE_LINE);
        let mut storage = Self {
            lines: vec![CacheLine::zeroed(); line_count],
            len: bytes.len(),
        };
        storage.as_mut_slice().copy_from_slice(bytes);
        storage
    }

    /// Number of usable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the storage holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes reserved (a whole number of cache lines).
    pub fn capacity(&self) -> usize {
        self.lines.len() * CACHE_LINE
    }

    /// View the usable bytes.
    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice::<CacheLine, u8>(&self.lines)[..self.len]
    }

    /// Mutably view the usable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<CacheLine, u8>(&mut self.lines)[..len]
    }
}

impl fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBytes")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

// ============================================================================
// Arena chunks
// ============================================================================

/// One backing allocation of the arena, covering `[base, base + len)` of the
/// arena offset space.
struct ArenaChunk {
    serial: u64,
    base: usize,
    lines: Box<[UnsafeCell<CacheLine>]>,
}

// SAFETY: chunk bytes are only reached through `PoolBlock`, and the pool never
// has two live blocks over the same range, so no byte is aliased mutably
// across threads.
unsafe impl Sync for ArenaChunk {}

impl ArenaChunk {
    fn try_new(serial: u64, base: usize, len: usize) -> ProcessingResult<Self> {
        let mut lines = Vec::new();
        let line_count = reserve_lines(&mut lines, len)?;
        lines.extend((0..line_count).map(|_| UnsafeCell::new(CacheLine::zeroed())));
        Ok(Self {
            serial,
            base,
            lines: lines.into_boxed_slice(),
        })
    }

    fn len(&self) -> usize {
        self.lines.len() * CACHE_LINE
    }

    fn end(&self) -> usize {
        self.base + self.len()
    }

    fn contains(&self, offset: usize, size: usize) -> bool {
        offset >= self.base && offset + size <= self.end()
    }

    fn ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.lines.as_ptr()) as *mut u8
    }
}

/// Handle identifying a block inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// A live block handed out by [`MemoryPool::allocate`].
///
/// The block has exclusive use of its byte range until it is returned with
/// [`MemoryPool::deallocate`].
pub struct PoolBlock {
    id: BlockId,
    pool_id: usize,
    offset: usize,
    size: usize,
    reserved: usize,
    alignment: usize,
    chunk: Arc<ArenaChunk>,
}

impl PoolBlock {
    /// Block handle.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Arena offset of the block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Serial number of the arena chunk backing the block.
    pub fn chunk(&self) -> u64 {
        self.chunk.serial
    }

    /// Requested size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the block holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes reserved in the arena (cache-line granular).
    pub fn capacity(&self) -> usize {
        self.reserved
    }

    /// Alignment requested at allocation time.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// View the block's bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range lies inside the chunk (checked when carved) and no
        // other live block covers it.
        unsafe {
            std::slice::from_raw_parts(self.chunk.ptr().add(self.offset - self.chunk.base), self.size)
        }
    }

    /// Mutably view the block's bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`; `&mut self` makes this the only view.
        unsafe {
            std::slice::from_raw_parts_mut(self.chunk.ptr().add(self.offset - self.chunk.base), self.size)
        }
    }
}

impl fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBlock")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("chunk", &self.chunk.serial)
            .finish()
    }
}

/// Snapshot of one block record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub id: BlockId,
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    pub in_use: bool,
    /// Serial number of the backing chunk.
    pub chunk: u64,
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatistics {
    /// Bytes handed out over the pool's lifetime.
    pub total_allocated: u64,
    /// Bytes returned over the pool's lifetime.
    pub total_freed: u64,
    /// Bytes held by live blocks.
    pub current_usage: usize,
    /// Highest `current_usage` observed.
    pub peak_usage: usize,
    /// Number of successful allocations.
    pub allocation_count: u64,
    /// Number of deallocations.
    pub deallocation_count: u64,
    /// Live block count.
    pub live_blocks: usize,
    /// Free block count.
    pub free_blocks: usize,
    /// Bytes covered by free blocks.
    pub free_bytes: usize,
    /// Arena bytes not held by live blocks.
    pub retained_bytes: usize,
    /// Bytes of all arena chunks.
    pub arena_capacity: usize,
    /// Number of arena chunks.
    pub chunk_count: usize,
    /// Free block count relative to free space in 64 KiB units.
    pub fragmentation_ratio: f64,
}

impl PoolStatistics {
    /// Memory the pool actually holds: live blocks plus idle arena space.
    pub fn resident_bytes(&self) -> usize {
        self.current_usage + self.retained_bytes
    }
}

#[derive(Debug)]
struct BlockRecord {
    id: BlockId,
    offset: usize,
    size: usize,
    alignment: usize,
    in_use: bool,
    chunk: u64,
}

impl BlockRecord {
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

struct PoolState {
    blocks: Vec<BlockRecord>,
    /// Ordered by base offset.
    chunks: Vec<Arc<ArenaChunk>>,
    /// End of the offset space; the next chunk starts here.
    end: usize,
    top: usize,
    next_id: u64,
    next_chunk: u64,
    total_allocated: u64,
    total_freed: u64,
    current_usage: usize,
    peak_usage: usize,
    allocation_count: u64,
    deallocation_count: u64,
}

impl PoolState {
    fn fresh_id(&mut self) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        id
    }

    fn capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    fn chunk(&self, serial: u64) -> Option<Arc<ArenaChunk>> {
        self.chunks.iter().find(|c| c.serial == serial).cloned()
    }

    fn index_of(&self, offset: usize, id: BlockId) -> Option<usize> {
        self.blocks
            .binary_search_by_key(&offset, |b| b.offset)
            .ok()
            .filter(|&idx| self.blocks[idx].id == id)
    }

    /// Add a chunk of at least `min_len` bytes that at least doubles the arena.
    fn grow(&mut self, min_len: usize, initial: usize) -> ProcessingResult<Arc<ArenaChunk>> {
        let held = self.capacity();
        let len = round_up(min_len.max(if held == 0 { initial } else { held }), CACHE_LINE);
        let chunk = Arc::new(ArenaChunk::try_new(self.next_chunk, self.end, len)?);
        log::debug!("memory pool arena expanded {} -> {} bytes", held, held + len);
        self.next_chunk += 1;
        self.end = chunk.end();
        self.chunks.push(Arc::clone(&chunk));
        Ok(chunk)
    }

    fn coalesce(&mut self) -> usize {
        let before = self.blocks.len();
        let mut merged: Vec<BlockRecord> = Vec::with_capacity(before);

        for record in self.blocks.drain(..) {
            if let Some(last) = merged.last_mut() {
                if !last.in_use
                    && !record.in_use
                    && last.chunk == record.chunk
                    && last.end() == record.offset
                {
                    last.size += record.size;
                    continue;
                }
            }
            merged.push(record);
        }

        self.blocks = merged;
        before - self.blocks.len()
    }

    /// Drop free records at the top of the arena and the chunks left above
    /// the new top. The first chunk is kept. Returns chunk bytes released.
    fn release_trailing_free(&mut self) -> usize {
        while let Some(record) = self.blocks.pop() {
            if record.in_use {
                self.blocks.push(record);
                break;
            }
            self.top = record.offset;
        }
        if self.blocks.is_empty() {
            self.top = 0;
        }

        let mut released = 0;
        while self.chunks.len() > 1 && matches!(self.chunks.last(), Some(c) if c.base >= self.top) {
            if let Some(chunk) = self.chunks.pop() {
                released += chunk.len();
            }
        }
        self.end = self.chunks.last().map_or(0, |c| c.end());
        self.top = self.top.min(self.end);
        released
    }

    /// Remove chunks matching `drop_chunk` that hold no live block, together
    /// with their free records. Returns chunk bytes released.
    fn release_idle_chunks(&mut self, drop_chunk: impl Fn(&ArenaChunk) -> bool) -> usize {
        let blocks = &self.blocks;
        let (idle, kept): (Vec<_>, Vec<_>) = self.chunks.drain(..).partition(|chunk| {
            drop_chunk(&**chunk) && !blocks.iter().any(|b| b.in_use && b.chunk == chunk.serial)
        });
        self.chunks = kept;
        if idle.is_empty() {
            return 0;
        }

        self.blocks
            .retain(|b| !idle.iter().any(|chunk| chunk.serial == b.chunk));
        self.end = self.chunks.last().map_or(0, |c| c.end());
        self.top = self.top.min(self.end);
        if self.blocks.is_empty() {
            self.top = 0;
        }
        idle.iter().map(|c| c.len()).sum()
    }

    fn rollback(&mut self, offset: usize, id: BlockId, reserved: usize) {
        if let Some(idx) = self.index_of(offset, id) {
            self.blocks[idx].in_use = false;
        }
        self.current_usage = self.current_usage.saturating_sub(reserved);
        self.total_allocated = self.total_allocated.saturating_sub(reserved as u64);
        self.allocation_count = self.allocation_count.saturating_sub(1);
    }
}

/// Thread-safe arena allocator handing out aligned blocks.
pub struct MemoryPool {
    id: usize,
    initial_capacity: usize,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Create a pool and reserve its first arena chunk of `initial_bytes`.
    ///
    /// If the system refuses the initial chunk the pool starts empty and
    /// reserves memory on first use.
    pub fn new(initial_bytes: usize) -> Self {
        let initial_capacity = round_up(initial_bytes.max(CACHE_LINE), CACHE_LINE);
        let mut state = PoolState {
            blocks: Vec::new(),
            chunks: Vec::new(),
            end: 0,
            top: 0,
            next_id: 1,
            next_chunk: 0,
            total_allocated: 0,
            total_freed: 0,
            current_usage: 0,
            peak_usage: 0,
            allocation_count: 0,
            deallocation_count: 0,
        };
        if let Err(err) = state.grow(initial_capacity, initial_capacity) {
            log::warn!("initial pool chunk not reserved: {}", err);
        }
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            initial_capacity,
            state: Mutex::new(state),
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two ≤ 64).
    ///
    /// The returned block is zero-filled. Fails with
    /// [`ProcessingError::AllocationFailure`] when the arena cannot grow;
    /// callers treat that as a hard failure.
    pub fn allocate(&self, size: usize, alignment: usize) -> ProcessingResult<PoolBlock> {
        if size == 0 {
            return Err(ProcessingError::invalid("size", "allocation size must be non-zero"));
        }
        if !alignment.is_power_of_two() || alignment > CACHE_LINE {
            return Err(ProcessingError::invalid(
                "alignment",
                format!("{} is not a power of two no larger than {}", alignment, CACHE_LINE),
            ));
        }

        let block_size = round_up(size, CACHE_LINE);
        let (id, offset, chunk) = {
            let mut state = self.state.lock();
            let (id, offset, chunk) = match Self::first_fit(&mut state, block_size, alignment) {
                Some(hit) => hit,
                None => self.carve(&mut state, block_size, alignment, size)?,
            };
            state.current_usage += block_size;
            state.peak_usage = state.peak_usage.max(state.current_usage);
            state.total_allocated += block_size as u64;
            state.allocation_count += 1;
            (id, offset, chunk)
        };

        if !chunk.contains(offset, block_size) {
            self.state.lock().rollback(offset, id, block_size);
            return Err(ProcessingError::AllocationFailure {
                requested: size,
                alignment,
            });
        }

        let mut block = PoolBlock {
            id,
            pool_id: self.id,
            offset,
            size,
            reserved: block_size,
            alignment,
            chunk,
        };
        // Zeroed outside the lock; reused ranges hold old pixels.
        block.as_mut_slice().fill(0);
        Ok(block)
    }

    fn first_fit(
        state: &mut PoolState,
        block_size: usize,
        alignment: usize,
    ) -> Option<(BlockId, usize, Arc<ArenaChunk>)> {
        let idx = state
            .blocks
            .iter()
            .position(|b| !b.in_use && b.size >= block_size && b.offset % alignment == 0)?;
        let chunk = state.chunk(state.blocks[idx].chunk)?;

        let remainder = state.blocks[idx].size - block_size;
        if remainder >= MIN_SPLIT_BYTES {
            let tail_id = state.fresh_id();
            let record = &mut state.blocks[idx];
            record.size = block_size;
            let tail = BlockRecord {
                id: tail_id,
                offset: record.offset + block_size,
                size: remainder,
                alignment: CACHE_LINE,
                in_use: false,
                chunk: record.chunk,
            };
            state.blocks.insert(idx + 1, tail);
        }

        let record = &mut state.blocks[idx];
        record.in_use = true;
        record.alignment = alignment;
        Some((record.id, record.offset, chunk))
    }

    fn carve(
        &self,
        state: &mut PoolState,
        block_size: usize,
        alignment: usize,
        requested: usize,
    ) -> ProcessingResult<(BlockId, usize, Arc<ArenaChunk>)> {
        let mut offset = round_up(state.top, alignment);
        let chunk = loop {
            let next = state
                .chunks
                .iter()
                .find(|c| c.end() > offset)
                .map(Arc::clone);
            match next {
                Some(chunk) => {
                    // Chunk bases are cache-line aligned.
                    let start = offset.max(chunk.base);
                    if chunk.contains(start, block_size) {
                        offset = start;
                        break chunk;
                    }
                    offset = chunk.end();
                }
                None => {
                    let chunk = state.grow(block_size, self.initial_capacity).map_err(|_| {
                        ProcessingError::AllocationFailure {
                            requested,
                            alignment,
                        }
                    })?;
                    offset = chunk.base;
                    break chunk;
                }
            }
        };

        let id = state.fresh_id();
        state.blocks.push(BlockRecord {
            id,
            offset,
            size: block_size,
            alignment,
            in_use: true,
            chunk: chunk.serial,
        });
        state.top = offset + block_size;
        Ok((id, offset, chunk))
    }

    /// Return a block to the pool.
    ///
    /// Blocks from another pool are dropped with a warning.
    pub fn deallocate(&self, block: PoolBlock) {
        if block.pool_id != self.id {
            log::warn!("block {:?} returned to a pool that did not allocate it", block.id);
            return;
        }

        let mut state = self.state.lock();
        let Some(idx) = state.index_of(block.offset, block.id) else {
            log::warn!("unknown block {:?} returned to pool", block.id);
            return;
        };

        let record = &mut state.blocks[idx];
        if !record.in_use {
            log::warn!("block {:?} returned twice", block.id);
            return;
        }
        let size = record.size;
        record.in_use = false;

        state.current_usage = state.current_usage.saturating_sub(size);
        state.total_freed += size as u64;
        state.deallocation_count += 1;

        if state.deallocation_count % COALESCE_INTERVAL == 0 {
            let merged = state.coalesce();
            log::trace!("periodic coalesce merged {} free blocks", merged);
        }
    }

    /// Merge address-adjacent free blocks. Returns the number of merges.
    pub fn coalesce(&self) -> usize {
        self.state.lock().coalesce()
    }

    /// Coalesce free blocks, move the arena top down over trailing free
    /// space, and release chunks left entirely above it (the first chunk is
    /// kept).
    ///
    /// Live blocks are never moved. Returns the number of chunk bytes released.
    pub fn compact(&self) -> usize {
        let mut state = self.state.lock();
        state.coalesce();
        let released = state.release_trailing_free();
        log::debug!("memory pool compacted, released {} bytes", released);
        released
    }

    /// Release every chunk larger than `threshold` bytes that holds no live
    /// block. Returns the number of bytes released.
    pub fn purge_free_above(&self, threshold: usize) -> usize {
        self.state
            .lock()
            .release_idle_chunks(|chunk| chunk.len() > threshold)
    }

    /// Drop every free block and reset lifetime counters.
    ///
    /// Live blocks stay valid and keep counting toward `current_usage`. Idle
    /// chunks other than the first are released.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.blocks.retain(|b| b.in_use);
        let first = state.chunks.first().map(|c| c.serial);
        state.release_idle_chunks(|chunk| Some(chunk.serial) != first);
        state.top = state.blocks.last().map_or(0, |b| b.end());
        state.total_allocated = state.current_usage as u64;
        state.total_freed = 0;
        state.peak_usage = state.current_usage;
        state.allocation_count = state.blocks.len() as u64;
        state.deallocation_count = 0;
    }

    /// Current statistics; the fragmentation ratio is computed on demand.
    pub fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock();
        let arena_capacity = state.capacity();
        let mut stats = PoolStatistics {
            total_allocated: state.total_allocated,
            total_freed: state.total_freed,
            current_usage: state.current_usage,
            peak_usage: state.peak_usage,
            allocation_count: state.allocation_count,
            deallocation_count: state.deallocation_count,
            retained_bytes: arena_capacity.saturating_sub(state.current_usage),
            arena_capacity,
            chunk_count: state.chunks.len(),
            ..PoolStatistics::default()
        };

        for record in &state.blocks {
            if record.in_use {
                stats.live_blocks += 1;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += record.size;
            }
        }
        stats.fragmentation_ratio =
            stats.free_blocks as f64 / (stats.free_bytes / FRAGMENTATION_UNIT).max(1) as f64;
        stats
    }

    /// Snapshot of the block table in address order.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.state
            .lock()
            .blocks
            .iter()
            .map(|b| BlockInfo {
                id: b.id,
                offset: b.offset,
                size: b.size,
                alignment: b.alignment,
                in_use: b.in_use,
                chunk: b.chunk,
            })
            .collect()
    }

    /// Verify the block table: ordered, non-overlapping, inside its chunk,
    /// aligned, and consistent with `current_usage`.
    pub fn check_invariants(&self) -> Result<(), String> {
        let state = self.state.lock();
        let mut live_bytes = 0;

        for pair in state.blocks.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(format!(
                    "blocks {:?} and {:?} overlap",
                    pair[0].id, pair[1].id
                ));
            }
        }
        for pair in state.chunks.windows(2) {
            if pair[0].end() > pair[1].base {
                return Err(format!(
                    "chunks {} and {} overlap",
                    pair[0].serial, pair[1].serial
                ));
            }
        }
        for record in &state.blocks {
            if record.offset % record.alignment != 0 {
                return Err(format!("block {:?} is misaligned", record.id));
            }
            match state.chunks.iter().find(|c| c.serial == record.chunk) {
                Some(chunk) if chunk.contains(record.offset, record.size) => {}
                _ => return Err(format!("block {:?} lies outside its chunk", record.id)),
            }
            if record.in_use {
                live_bytes += record.size;
            }
        }
        if live_bytes != state.current_usage {
            return Err(format!(
                "live bytes {} disagree with current usage {}",
                live_bytes, state.current_usage
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.statistics();
        f.debug_struct("MemoryPool")
            .field("id", &self.id)
            .field("arena_capacity", &stats.arena_capacity)
            .field("chunk_count", &stats.chunk_count)
            .field("current_usage", &stats.current_usage)
            .field("live_blocks", &stats.live_blocks)
            .finish()
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(crate::core::config::DEFAULT_POOL_INITIAL_BYTES)
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub(crate) fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocation_is_aligned_and_zeroed() {
        let pool = MemoryPool::new(4096);
        let block = pool.allocate(100, 64).unwrap();

        assert_eq!(block.len(), 100);
        assert_eq!(block.capacity(), 128);
        assert_eq!(block.as_slice().as_ptr() as usize % CACHE_LINE, 0);
        assert!(block.as_slice().iter().all(|&b| b == 0));
        pool.deallocate(block);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let pool = MemoryPool::new(4096);
        assert!(pool.allocate(0, 64).is_err());
        assert!(pool.allocate(16, 3).is_err());
        assert!(pool.allocate(16, 128).is_err());
    }

    #[test]
    fn test_initial_chunk_is_reserved_up_front() {
        let pool = MemoryPool::new(1 << 16);
        let stats = pool.statistics();
        assert_eq!(stats.arena_capacity, 1 << 16);
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.resident_bytes(), 1 << 16);
    }

    #[test]
    fn test_small_blocks_share_one_chunk() {
        let pool = MemoryPool::new(4096);
        let mut a = pool.allocate(64, 64).unwrap();
        let mut b = pool.allocate(64, 64).unwrap();

        assert_eq!(a.chunk(), b.chunk());
        assert_eq!(b.offset() - a.offset(), 64);
        let distance = b.as_slice().as_ptr() as usize - a.as_slice().as_ptr() as usize;
        assert_eq!(distance, b.offset() - a.offset());

        // Neighbouring views stay independent.
        a.as_mut_slice().fill(1);
        b.as_mut_slice().fill(2);
        assert!(a.as_slice().iter().all(|&x| x == 1));
        assert!(b.as_slice().iter().all(|&x| x == 2));
        assert_eq!(pool.statistics().chunk_count, 1);
    }

    #[test]
    fn test_first_fit_reuses_freed_block() {
        let pool = MemoryPool::new(4096);
        let a = pool.allocate(256, 64).unwrap();
        let a_offset = a.offset();
        let _b = pool.allocate(256, 64).unwrap();
        pool.deallocate(a);

        let c = pool.allocate(200, 64).unwrap();
        assert_eq!(c.offset(), a_offset);
    }

    #[test]
    fn test_reused_block_is_zeroed() {
        let pool = MemoryPool::new(4096);
        let mut a = pool.allocate(128, 64).unwrap();
        a.as_mut_slice().fill(0xAB);
        pool.deallocate(a);

        let b = pool.allocate(128, 64).unwrap();
        assert!(b.as_slice().iter().all(|&x| x == 0));
    }

    #[test]
    fn test_arena_expands_at_least_double() {
        let pool = MemoryPool::new(1024);
        let mut a = pool.allocate(1024, 64).unwrap();
        a.as_mut_slice()[0] = 9;
        let b = pool.allocate(64, 64).unwrap();

        let stats = pool.statistics();
        assert!(stats.arena_capacity >= 2048);
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.live_blocks, 2);
        assert_ne!(a.chunk(), b.chunk());
        // Growth leaves existing blocks in place.
        assert_eq!(a.as_slice()[0], 9);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_block_never_straddles_chunks() {
        let pool = MemoryPool::new(1024);
        let a = pool.allocate(512, 64).unwrap();
        let b = pool.allocate(768, 64).unwrap();

        assert_eq!(b.offset(), 1024);
        assert_ne!(a.chunk(), b.chunk());
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_oversized_hit_is_split() {
        let pool = MemoryPool::new(64 * 1024);
        let big = pool.allocate(32 * 1024, 64).unwrap();
        let _guard = pool.allocate(64, 64).unwrap();
        pool.deallocate(big);

        let small = pool.allocate(1024, 64).unwrap();
        assert_eq!(small.offset(), 0);
        let blocks = pool.blocks();
        assert_eq!(blocks[0].size, 1024);
        assert!(!blocks[1].in_use);
        assert_eq!(blocks[1].size, 32 * 1024 - 1024);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_periodic_coalescing() {
        let pool = MemoryPool::new(64 * 1024);
        let blocks: Vec<_> = (0..10).map(|_| pool.allocate(64, 64).unwrap()).collect();
        for block in blocks {
            pool.deallocate(block);
        }

        // The tenth deallocation merges all ten adjacent free blocks
        let stats = pool.statistics();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 640);
        assert_eq!(stats.current_usage, 0);
    }

    #[test]
    fn test_coalescing_stops_at_chunk_boundary() {
        let pool = MemoryPool::new(1024);
        let a = pool.allocate(1024, 64).unwrap();
        let b = pool.allocate(1024, 64).unwrap();
        let _live = pool.allocate(64, 64).unwrap();
        pool.deallocate(a);
        pool.deallocate(b);

        assert_eq!(pool.coalesce(), 0);
        assert_eq!(pool.statistics().free_blocks, 2);
    }

    #[test]
    fn test_compact_keeps_live_blocks() {
        let pool = MemoryPool::new(4096);
        let a = pool.allocate(128, 64).unwrap();
        let mut live = pool.allocate(128, 64).unwrap();
        let c = pool.allocate(128, 64).unwrap();
        live.as_mut_slice()[0] = 7;
        pool.deallocate(a);
        pool.deallocate(c);

        // The first chunk stays reserved.
        assert_eq!(pool.compact(), 0);
        assert_eq!(live.as_slice()[0], 7);
        let blocks = pool.blocks();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].in_use);
        assert_eq!(blocks[1].offset, live.offset());

        // The trailing space is carved again.
        let d = pool.allocate(256, 64).unwrap();
        assert_eq!(d.offset(), 256);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_compact_releases_trailing_chunks() {
        let pool = MemoryPool::new(1024);
        let _a = pool.allocate(1024, 64).unwrap();
        let b = pool.allocate(4096, 64).unwrap();
        assert_eq!(pool.statistics().chunk_count, 2);
        pool.deallocate(b);

        assert_eq!(pool.compact(), 4096);
        let stats = pool.statistics();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.arena_capacity, 1024);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_fragmentation_ratio() {
        let pool = MemoryPool::new(4096);
        let held: Vec<_> = (0..6).map(|_| pool.allocate(64, 64).unwrap()).collect();
        let mut held = held.into_iter();
        // Free every other block so nothing coalesces
        let mut keep = Vec::new();
        while let (Some(free), Some(live)) = (held.next(), held.next()) {
            pool.deallocate(free);
            keep.push(live);
        }

        let stats = pool.statistics();
        assert_eq!(stats.free_blocks, 3);
        assert_eq!(stats.fragmentation_ratio, 3.0);
    }

    #[test]
    fn test_purge_and_reset() {
        let pool = MemoryPool::new(1024);
        let live = pool.allocate(64, 64).unwrap();
        let big = pool.allocate(256 * 1024, 64).unwrap();
        pool.deallocate(big);
        assert_eq!(pool.statistics().arena_capacity, 1024 + 256 * 1024);

        // The first chunk holds a live block and stays.
        assert_eq!(pool.purge_free_above(512), 256 * 1024);
        let stats = pool.statistics();
        assert_eq!(stats.arena_capacity, 1024);
        assert_eq!(stats.free_blocks, 0);

        pool.reset();
        let stats = pool.statistics();
        assert_eq!(stats.live_blocks, 1);
        assert_eq!(stats.current_usage, 64);
        assert_eq!(stats.total_freed, 0);
        pool.deallocate(live);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_foreign_block_is_ignored() {
        let a = MemoryPool::new(4096);
        let b = MemoryPool::new(4096);
        let block = a.allocate(64, 64).unwrap();
        b.deallocate(block);

        assert_eq!(a.statistics().current_usage, 64);
        assert_eq!(b.statistics().deallocation_count, 0);
    }

    proptest! {
        #[test]
        fn prop_live_blocks_never_overlap(ops in prop::collection::vec((1usize..20_000, any::<bool>()), 1..80)) {
            let pool = MemoryPool::new(8 * 1024);
            let mut live: Vec<PoolBlock> = Vec::new();

            for (size, release) in ops {
                if release && !live.is_empty() {
                    let idx = size % live.len();
                    pool.deallocate(live.swap_remove(idx));
                } else {
                    let mut block = pool.allocate(size, 64).unwrap();
                    block.as_mut_slice().fill((size % 251) as u8);
                    live.push(block);
                }
                if size % 7 == 0 {
                    pool.compact();
                }
                if size % 11 == 0 {
                    pool.purge_free_above(4096);
                }
                prop_assert!(pool.check_invariants().is_ok());

                let mut ranges: Vec<_> = live.iter().map(|b| (b.offset(), b.offset() + b.capacity())).collect();
                ranges.sort();
                for pair in ranges.windows(2) {
                    prop_assert!(pair[0].1 <= pair[1].0);
                }
                // No block's bytes were overwritten by another.
                for block in &live {
                    let fill = (block.len() % 251) as u8;
                    prop_assert!(block.as_slice().iter().all(|&x| x == fill));
                }
                let expected: usize = live.iter().map(|b| b.capacity()).sum();
                prop_assert_eq!(pool.statistics().current_usage, expected);
            }
        }
    }
}
