//! burn-diffuse-image: image-space tensor utilities
//!
//! - [`tiles`]: split an oversized tensor into four overlapping quadrants and
//!   join processed quadrants back under one of four blending policies
//! - [`ops`]: mask binarization, nearest resizing, control image inversion

pub mod ops;
pub mod tiles;

pub use ops::{OpsError, binarize_mask, invert, normalize_image, repeat_batch, resize_nearest};
pub use tiles::{TileConfig, TileError, TileMode, TileSet, join_tiles, split_tiles};
