/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// Handles are aligned to this grain; the low `LOG_HANDLE_GRAIN` bits of
/// any handle are zero and are reused as tag bits in log buffers.
pub const LOG_HANDLE_GRAIN: u8 = 3;
/// The handle alignment grain in bytes.
pub const HANDLE_GRAIN: usize = 1 << LOG_HANDLE_GRAIN;

/// log2 of the block size. A block is the unit of heap bookkeeping.
pub const LOG_BYTES_IN_BLOCK: u8 = 14;
/// The number of bytes in a block
pub const BYTES_IN_BLOCK: usize = 1 << LOG_BYTES_IN_BLOCK;
/// Selects the offset of an address within its block.
pub const BLOCK_MASK: usize = BYTES_IN_BLOCK - 1;

/// Allocations larger than this bypass the chunk manager and get whole
/// blocks.
pub const MAX_CHUNK_ALLOC: usize = BYTES_IN_BLOCK / 2;

/// log2 of the size of one write-buffer chunk.
pub const LOG_BYTES_IN_BUFFER: u8 = 18;
/// The size of one write-buffer chunk (256 KiB).
pub const BYTES_IN_BUFFER: usize = 1 << LOG_BYTES_IN_BUFFER;
