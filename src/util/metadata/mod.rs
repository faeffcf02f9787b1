//! Collector-side metadata tables keyed by handle address.

pub mod handle_bitmap;

pub use handle_bitmap::{HandleBitmap, RcBitmap, MAX_RC};
