//! Toroidal texel-grid storage backing the simulation's data textures.

use glam::Vec4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted when constructing grid storage.
#[derive(Debug, Error)]
pub enum GridError {
    /// Indicates dimensions that cannot back a texel image.
    #[error("invalid grid dimensions: {0}")]
    InvalidDimensions(&'static str),
}

/// Dense `width × height` image of RGBA32F texels with toroidal addressing.
///
/// One texel holds one sample: an agent's position or velocity (xyz plus a
/// constant 1.0 in w), or one baked animation displacement. Reads that fall
/// outside the image wrap on both axes, so texel `(−1, 0)` is texel
/// `(width−1, 0)` — a torus, not a clamped rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TexelGrid {
    width: u32,
    height: u32,
    texels: Vec<Vec4>,
}

impl TexelGrid {
    /// Create a grid with every texel initialised to zero.
    pub fn zeroed(width: u32, height: u32) -> Result<Self, GridError> {
        if width == 0 || height == 0 {
            return Err(GridError::InvalidDimensions(
                "texel grid dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width,
            height,
            texels: vec![Vec4::ZERO; (width as usize) * (height as usize)],
        })
    }

    /// Create a grid by evaluating `f` at every texel coordinate.
    pub fn from_fn(
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> Vec4,
    ) -> Result<Self, GridError> {
        let mut grid = Self::zeroed(width, height)?;
        for y in 0..height {
            for x in 0..width {
                let idx = grid.offset(x, y);
                grid.texels[idx] = f(x, y);
            }
        }
        Ok(grid)
    }

    /// Width in texels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in texels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Total texel count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.texels.len()
    }

    /// Returns true when the grid holds no texels (never, post-construction).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.texels.is_empty()
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Read the texel at `(x, y)`. Coordinates must be in range.
    #[must_use]
    pub fn texel(&self, x: u32, y: u32) -> Vec4 {
        self.texels[self.offset(x, y)]
    }

    /// Overwrite the texel at `(x, y)`.
    pub fn set_texel(&mut self, x: u32, y: u32, value: Vec4) {
        let idx = self.offset(x, y);
        self.texels[idx] = value;
    }

    /// Read the texel at signed coordinates, wrapping on both axes.
    #[must_use]
    pub fn texel_wrapped(&self, x: i64, y: i64) -> Vec4 {
        let wx = x.rem_euclid(self.width as i64) as u32;
        let wy = y.rem_euclid(self.height as i64) as u32;
        self.texel(wx, wy)
    }

    /// Nearest-texel lookup for normalized coordinates with repeat wrap.
    ///
    /// `(u, v)` in `[0, 1)` address the full image; values outside that range
    /// wrap. Non-finite coordinates read as zero rather than poisoning the
    /// caller with NaN.
    #[must_use]
    pub fn sample_uv(&self, u: f32, v: f32) -> Vec4 {
        if !u.is_finite() || !v.is_finite() {
            return Vec4::ZERO;
        }
        let x = (u * self.width as f32).floor() as i64;
        let y = (v * self.height as f32).floor() as i64;
        self.texel_wrapped(x, y)
    }

    /// Flat texel slice in row-major order.
    #[must_use]
    pub fn texels(&self) -> &[Vec4] {
        &self.texels
    }

    /// Mutable flat texel slice in row-major order.
    #[must_use]
    pub fn texels_mut(&mut self) -> &mut [Vec4] {
        &mut self.texels
    }
}

/// A ping-pong pair of identically shaped grids.
///
/// One grid is the readable front, the other the writable back; `swap` flips
/// the roles. `split` lends both at once with the front immutable, so a
/// compute pass cannot read the buffer it is writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPong {
    grids: [TexelGrid; 2],
    front: usize,
}

impl PingPong {
    /// Build a pair whose front starts as `initial` and whose back is a copy.
    #[must_use]
    pub fn new(initial: TexelGrid) -> Self {
        Self {
            grids: [initial.clone(), initial],
            front: 0,
        }
    }

    /// The readable front grid.
    #[must_use]
    pub fn front(&self) -> &TexelGrid {
        &self.grids[self.front]
    }

    /// The writable back grid.
    #[must_use]
    pub fn back_mut(&mut self) -> &mut TexelGrid {
        &mut self.grids[self.front ^ 1]
    }

    /// Mutable access to the front grid, for seeding scenarios between
    /// ticks. Compute passes use `split` instead.
    #[must_use]
    pub fn front_mut(&mut self) -> &mut TexelGrid {
        &mut self.grids[self.front]
    }

    /// Borrow `(front, back)` simultaneously for a read-old/write-new pass.
    #[must_use]
    pub fn split(&mut self) -> (&TexelGrid, &mut TexelGrid) {
        let (left, right) = self.grids.split_at_mut(1);
        if self.front == 0 {
            (&left[0], &mut right[0])
        } else {
            (&right[0], &mut left[0])
        }
    }

    /// Flip front and back roles.
    pub fn swap(&mut self) {
        self.front ^= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(TexelGrid::zeroed(0, 4).is_err());
        assert!(TexelGrid::zeroed(4, 0).is_err());
    }

    #[test]
    fn from_fn_fills_row_major() {
        let grid = TexelGrid::from_fn(4, 2, |x, y| Vec4::new(x as f32, y as f32, 0.0, 1.0))
            .expect("grid");
        assert_eq!(grid.texel(3, 1), Vec4::new(3.0, 1.0, 0.0, 1.0));
        assert_eq!(grid.texels()[7], Vec4::new(3.0, 1.0, 0.0, 1.0));
    }

    #[test]
    fn wrapped_reads_are_toroidal() {
        let grid = TexelGrid::from_fn(4, 4, |x, y| Vec4::new(x as f32, y as f32, 0.0, 1.0))
            .expect("grid");
        assert_eq!(grid.texel_wrapped(-1, 0), grid.texel(3, 0));
        assert_eq!(grid.texel_wrapped(4, -1), grid.texel(0, 3));
        assert_eq!(grid.texel_wrapped(9, 9), grid.texel(1, 1));
    }

    #[test]
    fn sample_uv_wraps_and_guards_nan() {
        let grid = TexelGrid::from_fn(4, 4, |x, y| Vec4::new(x as f32, y as f32, 0.0, 1.0))
            .expect("grid");
        assert_eq!(grid.sample_uv(0.0, 0.0), grid.texel(0, 0));
        assert_eq!(grid.sample_uv(0.75, 0.25), grid.texel(3, 1));
        assert_eq!(grid.sample_uv(1.75, -0.25), grid.texel(3, 3));
        assert_eq!(grid.sample_uv(f32::NAN, 0.0), Vec4::ZERO);
    }

    #[test]
    fn ping_pong_split_reads_front_writes_back() {
        let front = TexelGrid::from_fn(2, 2, |x, y| Vec4::new(x as f32, y as f32, 0.0, 1.0))
            .expect("grid");
        let mut pair = PingPong::new(front.clone());

        let (read, write) = pair.split();
        let doubled: Vec<Vec4> = read.texels().iter().map(|t| *t * 2.0).collect();
        write.texels_mut().copy_from_slice(&doubled);

        // Front is untouched until the swap makes the new data current.
        assert_eq!(pair.front(), &front);
        pair.swap();
        assert_eq!(pair.front().texel(1, 1), Vec4::new(2.0, 2.0, 0.0, 2.0));
    }

    #[test]
    fn swap_alternates_roles() {
        let grid = TexelGrid::zeroed(2, 2).expect("grid");
        let mut pair = PingPong::new(grid);
        pair.back_mut().set_texel(0, 0, Vec4::ONE);
        pair.swap();
        assert_eq!(pair.front().texel(0, 0), Vec4::ONE);
        pair.swap();
        assert_eq!(pair.front().texel(0, 0), Vec4::ZERO);
    }
}
