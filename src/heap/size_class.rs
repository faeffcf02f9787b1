//! Size classes (bins) for chunked allocation.

use crate::util::constants::MAX_CHUNK_ALLOC;

/// The number of size classes.
pub const N_BINS: usize = 27;

/// Chunk sizes per bin. Allocations larger than the last bin bypass the
/// chunk manager and take whole blocks.
pub const BIN_SIZE: [usize; N_BINS] = [
    8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640,
    768, 1024, 1280, 2048, 4096, 8192,
];

/// Conversion tables between request sizes and bins.
pub struct SizeClassTables {
    size_to_bin: Vec<u8>,
    size_to_rounded: Vec<u16>,
    chunks_per_block: [usize; N_BINS],
}

impl SizeClassTables {
    fn build() -> SizeClassTables {
        let mut size_to_bin = vec![0u8; MAX_CHUNK_ALLOC + 1];
        let mut size_to_rounded = vec![0u16; MAX_CHUNK_ALLOC + 1];
        let mut bin = 0;
        for sz in 0..=MAX_CHUNK_ALLOC {
            while BIN_SIZE[bin] < sz {
                bin += 1;
            }
            size_to_bin[sz] = bin as u8;
            size_to_rounded[sz] = BIN_SIZE[bin] as u16;
        }
        let mut chunks_per_block = [0; N_BINS];
        for (i, per_block) in chunks_per_block.iter_mut().enumerate() {
            *per_block = crate::util::constants::BYTES_IN_BLOCK / BIN_SIZE[i];
        }
        SizeClassTables {
            size_to_bin,
            size_to_rounded,
            chunks_per_block,
        }
    }

    /// The bin serving a request of `size` bytes (including the handle
    /// header).
    pub fn bin_for(&self, size: usize) -> usize {
        debug_assert!(size <= MAX_CHUNK_ALLOC);
        self.size_to_bin[size] as usize
    }

    /// The actual chunk size a request of `size` bytes receives.
    pub fn rounded_size(&self, size: usize) -> usize {
        debug_assert!(size <= MAX_CHUNK_ALLOC);
        self.size_to_rounded[size] as usize
    }

    /// How many chunks of this bin fit in one block.
    pub fn chunks_per_block(&self, bin: usize) -> usize {
        self.chunks_per_block[bin]
    }
}

lazy_static! {
    pub static ref SIZE_CLASSES: SizeClassTables = SizeClassTables::build();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_cover_every_size() {
        for size in 0..=MAX_CHUNK_ALLOC {
            let bin = SIZE_CLASSES.bin_for(size);
            let rounded = SIZE_CLASSES.rounded_size(size);
            assert!(bin < N_BINS, "size {} got invalid bin {}", size, bin);
            assert_eq!(rounded, BIN_SIZE[bin]);
            assert!(
                rounded >= size,
                "size {} assigned to bin {} of chunk size {}",
                size,
                bin,
                rounded
            );
            if bin > 0 {
                assert!(
                    BIN_SIZE[bin - 1] < size,
                    "size {} should fit the smaller bin {}",
                    size,
                    bin - 1
                );
            }
        }
    }

    #[test]
    fn chunk_counts_fill_blocks() {
        for bin in 0..N_BINS {
            let n = SIZE_CLASSES.chunks_per_block(bin);
            assert!(n >= 2);
            assert!(n * BIN_SIZE[bin] <= crate::util::constants::BYTES_IN_BLOCK);
        }
    }
}
