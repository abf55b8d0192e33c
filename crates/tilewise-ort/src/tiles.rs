//! Tiled inference driver, independent of the runtime.
//!
//! The image is cut into a grid of `tile_size` squares (edge tiles may be
//! smaller). Each tile is read with `prepadding` extra pixels on every side,
//! replicating the image border where the pad runs off the edge, converted
//! to a `[1, 3, H, W]` f32 tensor in `0..=1`, and handed to the model. The
//! model's output is cropped by `prepadding × scale` on every side and
//! written into the output at the tile's scaled position.
//!
//! With TTA, each tile is run through all eight flip/transpose variants and
//! the inverted outputs are averaged.

use ndarray::{Array4, ArrayView4, Axis};
use tracing::debug;

use tilewise_core::image::{MatView, MatViewMut};

/// Failure while driving tiles through a model.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("unsupported channel count {0} (expected 3 or 4)")]
    UnsupportedChannels(usize),

    #[error("output is {actual:?}, expected {expected:?} for scale {scale}")]
    Geometry {
        expected: (u32, u32),
        actual: (u32, u32),
        scale: usize,
    },

    #[error("model output shape {actual:?} is smaller than {needed:?}")]
    OutputShape {
        actual: Vec<usize>,
        needed: [usize; 4],
    },

    #[error("model run failed: {0}")]
    Model(String),
}

/// One tile of the grid, in input pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRect {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

/// Row-major grid of tiles covering `width × height` exactly once.
pub fn tile_grid(width: usize, height: usize, tile_size: usize) -> Vec<TileRect> {
    let tile = tile_size.max(1);
    let mut tiles = Vec::with_capacity(width.div_ceil(tile) * height.div_ceil(tile));
    for y in (0..height).step_by(tile) {
        for x in (0..width).step_by(tile) {
            tiles.push(TileRect {
                x,
                y,
                w: tile.min(width - x),
                h: tile.min(height - y),
            });
        }
    }
    tiles
}

/// Read `rect` plus `pad` pixels on every side as a `[1, 3, h+2p, w+2p]`
/// tensor, replicating edge pixels outside the image.
///
/// The image must be non-empty.
pub fn extract_padded(input: &MatView<'_>, rect: TileRect, pad: usize) -> Array4<f32> {
    let max_x = input.width() as usize - 1;
    let max_y = input.height() as usize - 1;
    let shape = (1, 3, rect.h + 2 * pad, rect.w + 2 * pad);
    Array4::from_shape_fn(shape, |(_, c, ty, tx)| {
        let sy = (rect.y + ty).saturating_sub(pad).min(max_y);
        let sx = (rect.x + tx).saturating_sub(pad).min(max_x);
        f32::from(input.pixel(sx, sy)[c]) / 255.0
    })
}

#[inline]
pub fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Crop `prepadding × scale` off a model output and write the RGB channels
/// into `output` at the tile's scaled position.
pub fn write_tile(
    output: &mut MatViewMut<'_>,
    tile: ArrayView4<'_, f32>,
    rect: TileRect,
    pad: usize,
    scale: usize,
) -> Result<(), TileError> {
    let off = pad * scale;
    let (out_h, out_w) = (rect.h * scale, rect.w * scale);
    let needed = [1, 3, off + out_h, off + out_w];
    let shape = tile.shape();
    if shape[0] < 1 || shape[1] < 3 || shape[2] < needed[2] || shape[3] < needed[3] {
        return Err(TileError::OutputShape {
            actual: shape.to_vec(),
            needed,
        });
    }
    for oy in 0..out_h {
        for ox in 0..out_w {
            let px = output.pixel_mut(rect.x * scale + ox, rect.y * scale + oy);
            for c in 0..3 {
                px[c] = to_u8(tile[[0, c, off + oy, off + ox]]);
            }
        }
    }
    Ok(())
}

/// Nearest-neighbour upscale of channel 3 (alpha).
pub fn upscale_alpha_nearest(input: &MatView<'_>, output: &mut MatViewMut<'_>, scale: usize) {
    for oy in 0..output.height() as usize {
        for ox in 0..output.width() as usize {
            output.pixel_mut(ox, oy)[3] = input.pixel(ox / scale, oy / scale)[3];
        }
    }
}

// ─── TTA ─────────────────────────────────────────────────────────────────────

/// One of the eight symmetries of the square, acting on the H/W axes of an
/// NCHW tensor: optional flips followed by an optional transpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dihedral {
    pub flip_v: bool,
    pub flip_h: bool,
    pub transpose: bool,
}

impl Dihedral {
    pub const IDENTITY: Self = Self {
        flip_v: false,
        flip_h: false,
        transpose: false,
    };

    pub fn all() -> impl Iterator<Item = Self> {
        (0u8..8).map(|bits| Self {
            flip_v: bits & 1 != 0,
            flip_h: bits & 2 != 0,
            transpose: bits & 4 != 0,
        })
    }

    pub fn apply(self, a: ArrayView4<'_, f32>) -> Array4<f32> {
        let mut v = a;
        if self.flip_v {
            v.invert_axis(Axis(2));
        }
        if self.flip_h {
            v.invert_axis(Axis(3));
        }
        if self.transpose {
            v = v.permuted_axes([0, 1, 3, 2]);
        }
        v.as_standard_layout().into_owned()
    }

    pub fn invert(self, a: ArrayView4<'_, f32>) -> Array4<f32> {
        let mut v = a;
        if self.transpose {
            v = v.permuted_axes([0, 1, 3, 2]);
        }
        if self.flip_v {
            v.invert_axis(Axis(2));
        }
        if self.flip_h {
            v.invert_axis(Axis(3));
        }
        v.as_standard_layout().into_owned()
    }
}

/// Run one padded tile through `run`, averaging over all symmetries when
/// `tta` is set.
pub fn infer_tile<F>(tile: Array4<f32>, tta: bool, run: &mut F) -> Result<Array4<f32>, TileError>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>, TileError>,
{
    if !tta {
        return run(tile);
    }
    let mut acc: Option<Array4<f32>> = None;
    let mut n = 0.0f32;
    for sym in Dihedral::all() {
        let out = run(sym.apply(tile.view()))?;
        let restored = sym.invert(out.view());
        match acc.as_mut() {
            Some(sum) if sum.shape() == restored.shape() => *sum += &restored,
            Some(sum) => {
                return Err(TileError::OutputShape {
                    actual: restored.shape().to_vec(),
                    needed: [
                        sum.shape()[0],
                        sum.shape()[1],
                        sum.shape()[2],
                        sum.shape()[3],
                    ],
                });
            }
            None => acc = Some(restored),
        }
        n += 1.0;
    }
    Ok(acc.map(|sum| sum / n).unwrap_or_default())
}

/// Upscale `input` into `output` tile by tile.
///
/// `output` must be exactly `scale ×` the input in width and height with the
/// same channel count (3 or 4). An empty image is a no-op.
pub fn upscale_tiled<F>(
    input: MatView<'_>,
    mut output: MatViewMut<'_>,
    tile_size: usize,
    pad: usize,
    scale: usize,
    tta: bool,
    mut run: F,
) -> Result<(), TileError>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>, TileError>,
{
    let channels = input.elem_size();
    if !matches!(channels, 3 | 4) {
        return Err(TileError::UnsupportedChannels(channels));
    }
    let expected = (input.width() * scale as u32, input.height() * scale as u32);
    let actual = (output.width(), output.height());
    if expected != actual || output.elem_size() != channels {
        return Err(TileError::Geometry {
            expected,
            actual,
            scale,
        });
    }
    if input.width() == 0 || input.height() == 0 {
        return Ok(());
    }

    let grid = tile_grid(input.width() as usize, input.height() as usize, tile_size);
    debug!(
        tiles = grid.len(),
        tile_size,
        pad,
        scale,
        tta,
        "Starting tiled inference"
    );
    for rect in grid {
        let tile = extract_padded(&input, rect, pad);
        let out = infer_tile(tile, tta, &mut run)?;
        write_tile(&mut output, out.view(), rect, pad, scale)?;
    }
    if channels == 4 {
        upscale_alpha_nearest(&input, &mut output, scale);
    }
    Ok(())
}
