//! Quadrant tiling for oversized tensors
//!
//! A source tensor of height `H` and width `W` is split into four tiles of
//! `(H/2 + o) × (W/2 + o)`, each overlapping its neighbours by `o` pixels
//! past the centre line:
//!
//! ```text
//!  T1 (0, 0)            T2 (0, W/2 - o)
//!  T3 (H/2 - o, 0)      T4 (H/2 - o, W/2 - o)
//! ```
//!
//! Joining writes the tiles back in T1..T4 order under a [`TileMode`]. Each
//! `[batch, channel]` plane is independent and joined in parallel.

use burn::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from splitting or joining tiles
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TileError {
    #[error("tile source must have even height and width, got {height}x{width}")]
    OddDimensions { height: usize, width: usize },

    #[error("overlap {overlap} must be smaller than the tile half size {half_height}x{half_width}")]
    OverlapTooLarge {
        overlap: usize,
        half_height: usize,
        half_width: usize,
    },

    #[error("tiles have mismatched shapes: {0:?}")]
    ShapeMismatch(Vec<[usize; 4]>),

    #[error("tile data could not be read: {0}")]
    Data(String),
}

/// How overlapping tile regions are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileMode {
    /// Later tiles overwrite earlier ones
    Overlap,
    /// Overlap pixels are averaged with what is already written
    Blend,
    /// Interior overlap is trimmed; written pixels are never overwritten
    Clip,
    /// Half the overlap is trimmed; the remainder is averaged
    #[default]
    ClipBlend,
}

impl TileMode {
    /// Pixels trimmed from each interior tile edge
    fn trim(&self, overlap: usize) -> usize {
        match self {
            TileMode::Overlap | TileMode::Blend => 0,
            TileMode::Clip => overlap,
            TileMode::ClipBlend => overlap / 2,
        }
    }

    #[inline]
    fn write(&self, dst: &mut f32, covered: &mut bool, value: f32) {
        match self {
            TileMode::Overlap => *dst = value,
            TileMode::Clip => {
                if !*covered {
                    *dst = value;
                }
            }
            TileMode::Blend | TileMode::ClipBlend => {
                *dst = if *covered { (*dst + value) / 2.0 } else { value };
            }
        }
        *covered = true;
    }
}

/// Configuration for tiled processing of large latents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Enable tiling when the input exceeds `tile_size`
    pub enabled: bool,
    /// Largest latent height/width processed without tiling
    pub tile_size: usize,
    /// Tile overlap in latent pixels
    pub overlap: usize,
    /// Join policy
    pub mode: TileMode,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tile_size: 64,
            overlap: 8,
            mode: TileMode::ClipBlend,
        }
    }
}

impl TileConfig {
    /// Tiling enabled with default size and overlap
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// True when a `[_, _, height, width]` tensor should be tiled
    pub fn should_tile(&self, height: usize, width: usize) -> bool {
        self.enabled && (height > self.tile_size || width > self.tile_size)
    }
}

/// Four overlapping quadrant tiles, in T1..T4 order
#[derive(Debug, Clone)]
pub struct TileSet<B: Backend> {
    pub tiles: [Tensor<B, 4>; 4],
    pub overlap: usize,
}

impl<B: Backend> TileSet<B> {
    /// Wrap processed tiles, checking they can be joined
    ///
    /// Tiles must share a shape `[b, c, th, tw]` with `th` and `tw` larger
    /// than twice the overlap.
    pub fn new(tiles: [Tensor<B, 4>; 4], overlap: usize) -> Result<Self, TileError> {
        let dims: Vec<[usize; 4]> = tiles.iter().map(|t| t.dims()).collect();
        if dims.iter().any(|d| *d != dims[0]) {
            return Err(TileError::ShapeMismatch(dims));
        }
        let [_, _, th, tw] = dims[0];
        if th <= 2 * overlap || tw <= 2 * overlap {
            return Err(TileError::OverlapTooLarge {
                overlap,
                half_height: th.saturating_sub(overlap),
                half_width: tw.saturating_sub(overlap),
            });
        }

        Ok(Self { tiles, overlap })
    }

    /// Shape of each tile
    pub fn tile_dims(&self) -> [usize; 4] {
        self.tiles[0].dims()
    }

    /// Shape of the joined tensor
    pub fn output_dims(&self) -> [usize; 4] {
        let [b, c, th, tw] = self.tile_dims();
        [b, c, 2 * (th - self.overlap), 2 * (tw - self.overlap)]
    }

    /// Rebuild the set from processed tiles whose spatial size grew by `factor`
    ///
    /// Used after decoding latent tiles to pixels: the overlap scales with
    /// the tiles.
    pub fn rescale(&self, tiles: [Tensor<B, 4>; 4], factor: usize) -> Result<Self, TileError> {
        Self::new(tiles, self.overlap * factor)
    }
}

/// Split `source` into four overlapping quadrants
pub fn split_tiles<B: Backend>(source: Tensor<B, 4>, overlap: usize) -> Result<TileSet<B>, TileError> {
    let [batch, channels, height, width] = source.dims();
    if height % 2 != 0 || width % 2 != 0 {
        return Err(TileError::OddDimensions { height, width });
    }

    let half_h = height / 2;
    let half_w = width / 2;
    if overlap >= half_h || overlap >= half_w {
        return Err(TileError::OverlapTooLarge {
            overlap,
            half_height: half_h,
            half_width: half_w,
        });
    }

    let top = 0..half_h + overlap;
    let bottom = half_h - overlap..height;
    let left = 0..half_w + overlap;
    let right = half_w - overlap..width;

    let tile = |rows: std::ops::Range<usize>, cols: std::ops::Range<usize>| {
        source
            .clone()
            .slice([0..batch, 0..channels, rows, cols])
    };

    let tiles = [
        tile(top.clone(), left.clone()),
        tile(top, right.clone()),
        tile(bottom.clone(), left),
        tile(bottom, right),
    ];

    tracing::trace!(height, width, overlap, "split into quadrant tiles");
    TileSet::new(tiles, overlap)
}

/// Join four tiles into one tensor under `mode`
pub fn join_tiles<B: Backend>(set: TileSet<B>, mode: TileMode) -> Result<Tensor<B, 4>, TileError> {
    let [batch, channels, th, tw] = set.tile_dims();
    let [_, _, height, width] = set.output_dims();
    let overlap = set.overlap;
    let device = set.tiles[0].device();

    let tile_values = set
        .tiles
        .into_iter()
        .map(|tile| {
            tile.into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| TileError::Data(format!("{e:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let trim = mode.trim(overlap);
    let half_h = th - overlap;
    let half_w = tw - overlap;

    // (row origin, col origin, local row range, local col range) per tile
    let placements: Vec<_> = (0..4)
        .map(|k| {
            let is_top = k < 2;
            let is_left = k % 2 == 0;
            let origin = (
                if is_top { 0 } else { half_h - overlap },
                if is_left { 0 } else { half_w - overlap },
            );
            let rows = if is_top { 0..th - trim } else { trim..th };
            let cols = if is_left { 0..tw - trim } else { trim..tw };
            (origin, rows, cols)
        })
        .collect();

    let plane = height * width;
    let tile_plane = th * tw;
    let mut output = vec![0.0f32; batch * channels * plane];

    output
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(p, dst)| {
            let mut covered = vec![false; plane];
            for (values, ((oy, ox), rows, cols)) in tile_values.iter().zip(&placements) {
                let src = &values[p * tile_plane..(p + 1) * tile_plane];
                for y in rows.clone() {
                    let dst_row = (oy + y) * width;
                    for x in cols.clone() {
                        let idx = dst_row + ox + x;
                        mode.write(&mut dst[idx], &mut covered[idx], src[y * tw + x]);
                    }
                }
            }
        });

    Ok(Tensor::from_data(
        TensorData::new(output, [batch, channels, height, width]),
        &device,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        let len: usize = shape.iter().product();
        let values: Vec<f32> = (0..len).map(|i| i as f32 * 0.25 - 3.0).collect();
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_split_dims() {
        let set = split_tiles(ramp([1, 3, 16, 24]), 4).unwrap();
        assert_eq!(set.tile_dims(), [1, 3, 12, 16]);
        assert_eq!(set.output_dims(), [1, 3, 16, 24]);
    }

    #[test]
    fn test_split_rejects_large_overlap() {
        assert!(matches!(
            split_tiles(ramp([1, 1, 8, 8]), 4),
            Err(TileError::OverlapTooLarge { .. })
        ));
        assert!(matches!(
            split_tiles(ramp([1, 1, 9, 8]), 1),
            Err(TileError::OddDimensions { .. })
        ));
    }

    #[test]
    fn test_overlap_zero_round_trip() {
        let source = ramp([2, 3, 8, 10]);
        let expected = values(source.clone());
        let set = split_tiles(source, 0).unwrap();
        assert_eq!(values(join_tiles(set, TileMode::Overlap).unwrap()), expected);
    }

    #[test]
    fn test_every_mode_round_trips_unmodified_tiles() {
        // Identical overlap values average to themselves
        let source = ramp([1, 2, 12, 16]);
        let expected = values(source.clone());
        for mode in [TileMode::Overlap, TileMode::Blend, TileMode::Clip, TileMode::ClipBlend] {
            let set = split_tiles(source.clone(), 3).unwrap();
            let joined = values(join_tiles(set, mode).unwrap());
            for (a, b) in joined.iter().zip(&expected) {
                assert!((a - b).abs() < 1e-5, "{mode:?}");
            }
        }
    }

    fn constant_tiles(levels: [f32; 4], tile: [usize; 4], overlap: usize) -> TileSet<TestBackend> {
        let device = Default::default();
        let tiles = levels.map(|v| Tensor::<TestBackend, 4>::full(tile, v, &device));
        TileSet::new(tiles, overlap).unwrap()
    }

    #[test]
    fn test_blend_averages_shared_pixels() {
        // 8x8 output, overlap 2: tiles are 6x6, T1/T2 share columns 2..6 in rows 0..2
        let set = constant_tiles([1.0, 3.0, 10.0, 20.0], [1, 1, 6, 6], 2);
        let joined = values(join_tiles(set, TileMode::Blend).unwrap());
        let at = |y: usize, x: usize| joined[y * 8 + x];

        assert_eq!(at(0, 0), 1.0); // T1 only
        assert_eq!(at(0, 7), 3.0); // T2 only
        assert_eq!(at(0, 4), 2.0); // T1 and T2
        assert_eq!(at(7, 0), 10.0); // T3 only
        assert_eq!(at(7, 4), 15.0); // T3 and T4
        assert_eq!(at(4, 0), 5.5); // T1 and T3
    }

    #[test]
    fn test_overlap_later_tiles_win() {
        let set = constant_tiles([1.0, 2.0, 3.0, 4.0], [1, 1, 6, 6], 2);
        let joined = values(join_tiles(set, TileMode::Overlap).unwrap());
        // Centre pixel is covered by all four; T4 is written last
        assert_eq!(joined[4 * 8 + 4], 4.0);
        assert_eq!(joined[4], 2.0);
        assert_eq!(joined[4 * 8], 3.0);
    }

    #[test]
    fn test_clip_cuts_at_centre_lines() {
        let set = constant_tiles([1.0, 2.0, 3.0, 4.0], [1, 1, 6, 6], 2);
        let joined = values(join_tiles(set, TileMode::Clip).unwrap());
        for y in 0..8 {
            for x in 0..8 {
                let expected = match (y < 4, x < 4) {
                    (true, true) => 1.0,
                    (true, false) => 2.0,
                    (false, true) => 3.0,
                    (false, false) => 4.0,
                };
                assert_eq!(joined[y * 8 + x], expected, "({y}, {x})");
            }
        }
    }

    #[test]
    fn test_clip_blend_averages_narrow_band() {
        // overlap 2 trims 1: T1 covers columns 0..5, T2 covers 3..8
        let set = constant_tiles([2.0, 4.0, 2.0, 4.0], [1, 1, 6, 6], 2);
        let joined = values(join_tiles(set, TileMode::ClipBlend).unwrap());
        let row: Vec<f32> = joined[0..8].to_vec();
        assert_eq!(row, vec![2.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_tile_config() {
        let config = TileConfig::default();
        assert!(!config.should_tile(128, 128));
        let config = TileConfig::enabled();
        assert!(config.should_tile(128, 64));
        assert!(!config.should_tile(64, 64));
        assert_eq!(config.mode, TileMode::ClipBlend);
    }
}
