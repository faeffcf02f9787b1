//! Per-mutator write buffers (update, create, snoop logs) and the global
//! pool of buffer chunks.
//!
//! A buffer is a chain of fixed 256 KiB chunks. The first four words of
//! every chunk are reserved: a free/stolen-list link, a reinforce-list
//! link, the next chunk of the chain, and the last logged position. Every
//! entry is one word tagged in its low two bits (handles are 8-byte
//! aligned, so the payload loses nothing):
//!
//! * `Child` (00): a child handle captured in a replica, a snooped new
//!   value, a created handle, or a ZCT member.
//! * `Link` (01): chunk chaining, both the back pointer at the start of
//!   each chunk and a forward pointer written where a chain was extended.
//! * `Closer` (10): the containing handle, closing the replica entries
//!   logged before it.
//! * `Dup` (11): a neutralized entry whose handle was freed or re-logged
//!   while it was pending. Framing stays walkable.
//!
//! A logger reserves all the space it needs before writing, chaining a
//! new chunk if necessary, so commits never fail; each chunk keeps three
//! words in reserve for the closer, a forward link, and one snooped
//! value.

use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::*;
use crate::util::{memory, Address, Handle};

/// Reserved word indices at the start of every chunk.
pub const LINKED_LIST_IDX: usize = 0;
pub const REINFORCE_IDX: usize = 1;
pub const NEXT_CHUNK_IDX: usize = 2;
pub const LAST_POS_IDX: usize = 3;
pub const N_RESERVED_SLOTS: usize = 4;

const TAG_MASK: usize = 0b11;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Child = 0,
    Link = 1,
    Closer = 2,
    Dup = 3,
}

impl From<usize> for EntryKind {
    fn from(tag: usize) -> EntryKind {
        match tag & TAG_MASK {
            0 => EntryKind::Child,
            1 => EntryKind::Link,
            2 => EntryKind::Closer,
            _ => EntryKind::Dup,
        }
    }
}

/// Decode an entry word into its kind and payload address.
pub fn decode(word: usize) -> (EntryKind, Address) {
    (
        EntryKind::from(word),
        unsafe { Address::from_usize(word & !TAG_MASK) },
    )
}

pub fn encode(addr: Address, kind: EntryKind) -> usize {
    debug_assert_eq!(addr & TAG_MASK, 0);
    addr.as_usize() | kind as usize
}

fn reserved_word(chunk: Address, idx: usize) -> Address {
    chunk + idx * BYTES_IN_WORD
}

pub fn load_reserved(chunk: Address, idx: usize) -> usize {
    unsafe { reserved_word(chunk, idx).load::<usize>() }
}

pub fn store_reserved(chunk: Address, idx: usize, val: usize) {
    unsafe { reserved_word(chunk, idx).store::<usize>(val) }
}

/// The process-wide pool of buffer chunks. Chunks are recycled between
/// cycles; running out of address space for a fresh chunk is fatal, since
/// barrier correctness depends on loggers always having space.
pub struct ChunkPool {
    free: SpinMutex<Vec<Address>>,
    n_allocated: AtomicUsize,
    n_used: AtomicUsize,
    /// Chunks handed to mutators since the last cycle; crossing the
    /// configured threshold triggers an asynchronous collection.
    user_chunks: AtomicUsize,
}

impl ChunkPool {
    pub fn new() -> ChunkPool {
        ChunkPool {
            free: SpinMutex::new(Vec::new()),
            n_allocated: AtomicUsize::new(0),
            n_used: AtomicUsize::new(0),
            user_chunks: AtomicUsize::new(0),
        }
    }

    /// Take a chunk, reusing a recycled one when possible. `for_mutator`
    /// feeds the user-buffer trigger accounting.
    pub fn alloc(&self, for_mutator: bool) -> Address {
        let recycled = self.free.lock().pop();
        let chunk = recycled.unwrap_or_else(|| {
            self.n_allocated.fetch_add(1, Ordering::Relaxed);
            memory::reserve_and_commit(BYTES_IN_BUFFER)
        });
        self.n_used.fetch_add(1, Ordering::Relaxed);
        if for_mutator {
            self.user_chunks.fetch_add(1, Ordering::Relaxed);
        }
        chunk
    }

    pub fn free(&self, chunk: Address) {
        self.n_used.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(chunk);
    }

    /// (allocated, used, free) chunk counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let allocated = self.n_allocated.load(Ordering::Relaxed);
        let used = self.n_used.load(Ordering::Relaxed);
        (allocated, used, allocated - used)
    }

    pub fn user_chunks(&self) -> usize {
        self.user_chunks.load(Ordering::Relaxed)
    }

    pub fn reset_user_chunks(&self) {
        self.user_chunks.store(0, Ordering::Relaxed);
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An append-only log: the mutator-facing cursor over a chain of chunks.
#[derive(Copy, Clone)]
pub struct LogBuffer {
    pos: Address,
    limit: Address,
    start: Address,
    curr: Address,
}

impl LogBuffer {
    /// Start a fresh buffer with one chunk.
    pub fn new(pool: &ChunkPool, for_mutator: bool) -> LogBuffer {
        let chunk = pool.alloc(for_mutator);
        Self::init_reserved(chunk);
        // Null back link: this is the first chunk of the chain.
        store_reserved(chunk, N_RESERVED_SLOTS, encode(Address::ZERO, EntryKind::Link));
        LogBuffer {
            pos: chunk + (N_RESERVED_SLOTS + 1) * BYTES_IN_WORD,
            limit: chunk + BYTES_IN_BUFFER - 3 * BYTES_IN_WORD,
            start: chunk,
            curr: chunk,
        }
    }

    fn init_reserved(chunk: Address) {
        store_reserved(chunk, LINKED_LIST_IDX, 0);
        store_reserved(chunk, REINFORCE_IDX, 0);
        store_reserved(chunk, NEXT_CHUNK_IDX, 0);
        store_reserved(chunk, LAST_POS_IDX, 0);
    }

    /// Has anything been logged since the buffer was created?
    pub fn is_modified(&self) -> bool {
        self.pos != self.start + (N_RESERVED_SLOTS + 1) * BYTES_IN_WORD
    }

    pub fn start_chunk(&self) -> Address {
        self.start
    }

    pub fn pos(&self) -> Address {
        self.pos
    }

    pub(crate) fn set_pos(&mut self, pos: Address) {
        self.pos = pos;
    }

    pub fn available_words(&self) -> usize {
        self.limit.diff_words(self.pos)
    }

    /// Chain a fresh chunk onto the buffer. Links both directions: a
    /// back-pointer entry at the head of the new chunk and a forward
    /// pointer at the current position.
    pub fn grow(&mut self, pool: &ChunkPool, for_mutator: bool) {
        let chunk = pool.alloc(for_mutator);
        Self::init_reserved(chunk);

        let back_entry = chunk + N_RESERVED_SLOTS * BYTES_IN_WORD;
        unsafe {
            back_entry.store::<usize>(encode(self.pos, EntryKind::Link));
            self.pos.store::<usize>(encode(back_entry, EntryKind::Link));
        }
        store_reserved(self.curr, NEXT_CHUNK_IDX, chunk.as_usize());

        self.pos = chunk + (N_RESERVED_SLOTS + 1) * BYTES_IN_WORD;
        self.limit = chunk + BYTES_IN_BUFFER - 3 * BYTES_IN_WORD;
        self.curr = chunk;
    }

    /// Make sure one more word can be logged without growing. Returns
    /// whether a chunk was chained on, so callers can run the buffer
    /// trigger check.
    pub fn reserve_word(&mut self, pool: &ChunkPool, for_mutator: bool) -> bool {
        if self.pos >= self.limit {
            self.grow(pool, for_mutator);
            return true;
        }
        false
    }

    /// Append a raw entry word without checking space. The caller must
    /// have reserved the slot.
    pub fn push_word_unchecked(&mut self, word: usize) {
        debug_assert!(self.pos < self.limit + 3 * BYTES_IN_WORD);
        unsafe { self.pos.store::<usize>(word) };
        self.pos += BYTES_IN_WORD;
    }

    /// Append an entry word, growing first if needed.
    pub fn log_word(&mut self, pool: &ChunkPool, word: usize) {
        self.reserve_word(pool, false);
        self.push_word_unchecked(word);
    }

    /// Append a handle as a `Child` entry.
    pub fn log_handle(&mut self, pool: &ChunkPool, h: Handle) {
        self.log_word(pool, encode(h.to_address(), EntryKind::Child));
    }

    /// Terminate the buffer for hand-off: a zero word at the current
    /// position and the position recorded in the first chunk.
    pub fn seal(&mut self) {
        unsafe { self.pos.store::<usize>(0) };
        store_reserved(self.start, LAST_POS_IDX, self.pos.as_usize());
    }

    /// Record the current position as the sliding-view cut mark without
    /// terminating the buffer; the mutator keeps logging past it.
    pub fn record_cut(&self) {
        store_reserved(self.start, LAST_POS_IDX, self.pos.as_usize());
    }
}

/// Free one buffer chain through the next-chunk links.
pub fn free_chain(pool: &ChunkPool, start: Address) {
    let mut chunk = start;
    while !chunk.is_zero() {
        let next = unsafe { Address::from_usize(load_reserved(chunk, NEXT_CHUNK_IDX)) };
        pool.free(chunk);
        chunk = next;
    }
}

/// Free a list of buffer chains linked through the stolen-list word.
pub fn free_chains(pool: &ChunkPool, mut list: Option<Address>) {
    while let Some(start) = list {
        list = match load_reserved(start, LINKED_LIST_IDX) {
            0 => None,
            raw => Some(unsafe { Address::from_usize(raw) }),
        };
        free_chain(pool, start);
    }
}

/// Push a sealed buffer chain onto an intrusive stolen list.
pub fn push_onto_list(list: &mut Option<Address>, chunk: Address) {
    store_reserved(chunk, LINKED_LIST_IDX, list.map_or(0, |a| a.as_usize()));
    *list = Some(chunk);
}

pub fn list_next(chunk: Address) -> Option<Address> {
    match load_reserved(chunk, LINKED_LIST_IDX) {
        0 => None,
        raw => Some(unsafe { Address::from_usize(raw) }),
    }
}

/// Walk the entries of a buffer chain backwards, newest first, starting
/// from a recorded end position. Yields `(kind, entry address, payload)`
/// for every non-link entry. With a pool, each chunk is recycled as the
/// walk leaves it.
pub struct BackwardWalk<'a> {
    pool: Option<&'a ChunkPool>,
    p: Address,
    done: bool,
}

impl<'a> BackwardWalk<'a> {
    /// `end` is the address one past the newest entry (a terminator or
    /// the buffer's current position).
    pub fn new(end: Address, pool: Option<&'a ChunkPool>) -> BackwardWalk<'a> {
        BackwardWalk {
            pool,
            p: end - BYTES_IN_WORD,
            done: false,
        }
    }

    /// Walk a sealed buffer from its recorded last position.
    pub fn of_sealed(chunk: Address, pool: Option<&'a ChunkPool>) -> BackwardWalk<'a> {
        let end = unsafe { Address::from_usize(load_reserved(chunk, LAST_POS_IDX)) };
        debug_assert!(!end.is_zero());
        debug_assert_eq!(unsafe { end.load::<usize>() }, 0);
        Self::new(end, pool)
    }
}

impl<'a> Iterator for BackwardWalk<'a> {
    type Item = (EntryKind, Address, Address);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let word = unsafe { self.p.load::<usize>() };
            let (kind, payload) = decode(word);
            if kind != EntryKind::Link {
                let entry = self.p;
                self.p -= BYTES_IN_WORD;
                return Some((kind, entry, payload));
            }
            // The back pointer at a chunk head: recycle the chunk we are
            // leaving and continue in the previous one, skipping its
            // forward pointer.
            let chunk = self.p - N_RESERVED_SLOTS * BYTES_IN_WORD;
            if let Some(pool) = self.pool {
                pool.free(chunk);
            }
            if payload.is_zero() {
                self.done = true;
                return None;
            }
            self.p = payload - BYTES_IN_WORD;
        }
        None
    }
}

/// Walk the entries of a buffer chain forwards, oldest first, up to (and
/// excluding) `limit`.
pub struct ForwardWalk {
    p: Address,
    limit: Address,
}

impl ForwardWalk {
    pub fn new(start_chunk: Address, limit: Address) -> ForwardWalk {
        ForwardWalk {
            // Skip the reserved words and the back pointer.
            p: start_chunk + (N_RESERVED_SLOTS + 1) * BYTES_IN_WORD,
            limit,
        }
    }
}

impl Iterator for ForwardWalk {
    type Item = (EntryKind, Address, Address);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.p == self.limit {
                return None;
            }
            let word = unsafe { self.p.load::<usize>() };
            let (kind, payload) = decode(word);
            if kind != EntryKind::Link {
                let entry = self.p;
                self.p += BYTES_IN_WORD;
                return Some((kind, entry, payload));
            }
            // A forward pointer: continue past the next chunk's back
            // pointer.
            debug_assert!(!payload.is_zero());
            self.p = payload + BYTES_IN_WORD;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ChunkPool {
        ChunkPool::new()
    }

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    #[test]
    fn tags_roundtrip() {
        let a = addr(0x1_0008);
        for kind in [EntryKind::Child, EntryKind::Link, EntryKind::Closer, EntryKind::Dup] {
            let (k, p) = decode(encode(a, kind));
            assert_eq!(k, kind);
            assert_eq!(p, a);
        }
    }

    #[test]
    fn fresh_buffer_is_unmodified() {
        let pool = pool();
        let buf = LogBuffer::new(&pool, false);
        assert!(!buf.is_modified());
        assert_eq!(pool.counts(), (1, 1, 0));
    }

    #[test]
    fn backward_walk_single_chunk() {
        let pool = pool();
        let mut buf = LogBuffer::new(&pool, false);
        for i in 1..=5usize {
            buf.log_word(&pool, encode(addr(i * 8), EntryKind::Child));
        }
        buf.seal();

        let seen: Vec<usize> = BackwardWalk::of_sealed(buf.start_chunk(), None)
            .map(|(k, _, payload)| {
                assert_eq!(k, EntryKind::Child);
                payload.as_usize() / 8
            })
            .collect();
        assert_eq!(seen, vec![5, 4, 3, 2, 1]);
        free_chain(&pool, buf.start_chunk());
        assert_eq!(pool.counts(), (1, 0, 1));
    }

    #[test]
    fn walks_cross_chunk_boundaries() {
        let pool = pool();
        let mut buf = LogBuffer::new(&pool, false);
        // Force at least three chunks.
        let entries = 2 * BYTES_IN_BUFFER / BYTES_IN_WORD + 100;
        for i in 1..=entries {
            buf.log_word(&pool, encode(addr(i * 8), EntryKind::Child));
        }
        buf.seal();
        assert!(pool.counts().1 >= 3);

        // Forward: oldest first, up to the terminator position.
        let limit = unsafe { Address::from_usize(load_reserved(buf.start_chunk(), LAST_POS_IDX)) };
        let forward: Vec<usize> = ForwardWalk::new(buf.start_chunk(), limit)
            .map(|(_, _, p)| p.as_usize() / 8)
            .collect();
        assert_eq!(forward.len(), entries);
        assert_eq!(forward[0], 1);
        assert_eq!(*forward.last().unwrap(), entries);

        // Backward: newest first, recycling chunks as it goes.
        let mut expect = entries;
        for (k, _, payload) in BackwardWalk::of_sealed(buf.start_chunk(), Some(&pool)) {
            assert_eq!(k, EntryKind::Child);
            assert_eq!(payload.as_usize() / 8, expect);
            expect -= 1;
        }
        assert_eq!(expect, 0);
        assert_eq!(pool.counts().1, 0);
    }

    #[test]
    fn closer_framing_survives_dup_rewrite() {
        let pool = pool();
        let mut buf = LogBuffer::new(&pool, false);
        buf.log_word(&pool, encode(addr(0x100), EntryKind::Child));
        buf.log_word(&pool, encode(addr(0x108), EntryKind::Child));
        let closer_at = buf.pos();
        buf.log_word(&pool, encode(addr(0x200), EntryKind::Closer));
        buf.log_word(&pool, encode(addr(0x300), EntryKind::Child));
        buf.log_word(&pool, encode(addr(0x308), EntryKind::Closer));
        buf.seal();

        // Neutralize the first object's closer the way the collector
        // does when it frees a logged handle.
        unsafe {
            closer_at.store::<usize>(closer_at.load::<usize>() | EntryKind::Dup as usize);
        }

        let kinds: Vec<EntryKind> = BackwardWalk::of_sealed(buf.start_chunk(), None)
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::Closer,
                EntryKind::Child,
                EntryKind::Dup,
                EntryKind::Child,
                EntryKind::Child,
            ]
        );
        free_chain(&pool, buf.start_chunk());
    }
}
