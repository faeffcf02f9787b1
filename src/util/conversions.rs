use crate::util::constants::*;
use crate::util::Address;

/// Align an address down to a block boundary.
pub const fn block_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_BLOCK)
}

/// The number of whole blocks needed to hold `bytes`.
pub fn bytes_to_blocks_up(bytes: usize) -> usize {
    let blocks = bytes >> LOG_BYTES_IN_BLOCK as usize;
    if blocks == 0 || bytes & BLOCK_MASK != 0 {
        blocks + 1
    } else {
        blocks
    }
}

pub const fn blocks_to_bytes(blocks: usize) -> usize {
    blocks << LOG_BYTES_IN_BLOCK as usize
}

pub fn bytes_to_pages_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_PAGE - 1) >> LOG_BYTES_IN_PAGE as usize
}

pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE as usize
}

/// Align a byte size up to a whole page.
pub fn raw_align_up_page(bytes: usize) -> usize {
    pages_to_bytes(bytes_to_pages_up(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_round_up() {
        assert_eq!(bytes_to_blocks_up(1), 1);
        assert_eq!(bytes_to_blocks_up(BYTES_IN_BLOCK), 1);
        assert_eq!(bytes_to_blocks_up(BYTES_IN_BLOCK + 1), 2);
        assert_eq!(bytes_to_blocks_up(4 * BYTES_IN_BLOCK), 4);
    }
}
