//! Tile partitioning: grid geometry for overlapping tiles.
//!
//! A [`Partitioner`] turns an image size into a [`TileGeometry`]. Tile size
//! comes either from the fixed constant or from a pluggable [`TilePolicy`];
//! overlap and tile counts are always derived the same way so that the grid
//! covers every pixel at least once.

use serde::{Deserialize, Serialize};

/// Tile edge used when adaptive tiling is off.
pub const FIXED_TILE_SIZE: u32 = 1024;

/// Upper bound on the overlap between neighbouring tiles.
pub const MAX_OVERLAP: u32 = 64;

/// Adaptive tile sizes are rounded up to a multiple of this.
const ADAPTIVE_ALIGN: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGeometry {
    pub image_width: u32,
    pub image_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub overlap: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

/// Sub-rectangle of the canvas covered by one tile. `right`/`bottom` are
/// exclusive and clamped to the image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWindow {
    pub row: u32,
    pub col: u32,
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl TileWindow {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

impl TileGeometry {
    /// Derive overlap and tile counts for a `width`×`height` image tiled with
    /// `tile_width`×`tile_height` tiles.
    pub fn new(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        let tile_width = tile_width.max(1);
        let tile_height = tile_height.max(1);
        let overlap = MAX_OVERLAP.min(tile_width / 8).min(tile_height / 8);

        Self {
            image_width: width,
            image_height: height,
            tile_width,
            tile_height,
            overlap,
            tiles_x: tiles_along(width, tile_width, overlap),
            tiles_y: tiles_along(height, tile_height, overlap),
        }
    }

    pub fn total_tiles(&self) -> u32 {
        self.tiles_x * self.tiles_y
    }

    /// Kernel edge length: the larger of the two tile dimensions.
    pub fn kernel_size(&self) -> u32 {
        self.tile_width.max(self.tile_height)
    }

    pub fn window(&self, row: u32, col: u32) -> TileWindow {
        let left = col * (self.tile_width - self.overlap);
        let top = row * (self.tile_height - self.overlap);
        TileWindow {
            row,
            col,
            left,
            top,
            right: (left + self.tile_width).min(self.image_width),
            bottom: (top + self.tile_height).min(self.image_height),
        }
    }

    /// All tile windows in row-major order.
    pub fn windows(&self) -> impl Iterator<Item = TileWindow> + '_ {
        (0..self.tiles_y).flat_map(move |row| (0..self.tiles_x).map(move |col| self.window(row, col)))
    }

    /// True when the grid reaches the right and bottom image edges.
    pub fn covers_image(&self) -> bool {
        let stride_x = (self.tile_width - self.overlap) as u64;
        let stride_y = (self.tile_height - self.overlap) as u64;
        self.tiles_x as u64 * stride_x + self.overlap as u64 >= self.image_width as u64
            && self.tiles_y as u64 * stride_y + self.overlap as u64 >= self.image_height as u64
    }
}

fn tiles_along(extent: u32, tile: u32, overlap: u32) -> u32 {
    let stride = tile - overlap;
    extent.saturating_sub(overlap).div_ceil(stride).max(1)
}

/// Chooses `(tile_width, tile_height)` for an image of the given size.
pub trait TilePolicy: Send + Sync {
    fn tile_size(&self, width: u32, height: u32) -> (u32, u32);
}

impl<F> TilePolicy for F
where
    F: Fn(u32, u32) -> (u32, u32) + Send + Sync,
{
    fn tile_size(&self, width: u32, height: u32) -> (u32, u32) {
        self(width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTilePolicy {
    pub size: u32,
}

impl Default for FixedTilePolicy {
    fn default() -> Self {
        Self {
            size: FIXED_TILE_SIZE,
        }
    }
}

impl TilePolicy for FixedTilePolicy {
    fn tile_size(&self, _width: u32, _height: u32) -> (u32, u32) {
        (self.size, self.size)
    }
}

/// Smaller tiles for smaller images, capped at `max_tile`.
///
/// Each axis gets the fewest tiles of at most `max_tile` pixels that still
/// cover it once overlap is accounted for; the tile is then shrunk to split
/// the axis evenly, rounded up to a multiple of 64 and clamped to
/// `[min_tile, max_tile]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveTilePolicy {
    min_tile: u32,
    max_tile: u32,
}

impl AdaptiveTilePolicy {
    pub fn new(min_tile: u32, max_tile: u32) -> Self {
        let max_tile = max_tile.max(8);
        Self {
            min_tile: min_tile.clamp(1, max_tile),
            max_tile,
        }
    }

    fn axis(&self, extent: u32) -> u32 {
        let overlap = MAX_OVERLAP.min(self.max_tile / 8);
        let count = tiles_along(extent, self.max_tile, overlap);
        let span = extent as u64 + (count as u64 - 1) * overlap as u64;
        let even = span.div_ceil(count as u64) as u32;
        even.next_multiple_of(ADAPTIVE_ALIGN)
            .clamp(self.min_tile, self.max_tile)
    }
}

impl Default for AdaptiveTilePolicy {
    fn default() -> Self {
        Self::new(512, FIXED_TILE_SIZE)
    }
}

impl TilePolicy for AdaptiveTilePolicy {
    fn tile_size(&self, width: u32, height: u32) -> (u32, u32) {
        (self.axis(width), self.axis(height))
    }
}

/// Computes grid geometry, either with the fixed tile size or with the
/// adaptive policy. The adaptive policy defaults to the fixed one.
pub struct Partitioner {
    fixed: FixedTilePolicy,
    adaptive: Box<dyn TilePolicy>,
}

impl Partitioner {
    pub fn new(fixed_tile_size: u32) -> Self {
        let fixed = FixedTilePolicy {
            size: fixed_tile_size.max(1),
        };
        Self {
            fixed,
            adaptive: Box::new(fixed),
        }
    }

    pub fn with_adaptive_policy(mut self, policy: impl TilePolicy + 'static) -> Self {
        self.adaptive = Box::new(policy);
        self
    }

    pub fn partition(&self, width: u32, height: u32, adaptive: bool) -> TileGeometry {
        let (tile_width, tile_height) = if adaptive {
            self.adaptive.tile_size(width, height)
        } else {
            self.fixed.tile_size(width, height)
        };
        TileGeometry::new(width, height, tile_width, tile_height)
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(FIXED_TILE_SIZE)
    }
}
