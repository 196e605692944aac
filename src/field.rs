//! Host side mirror of the trail field.
//!
//! The field is a `width * height` grid of RGBA f32 cells, one channel per
//! species. `diffuse_into` performs exactly what the `diffuse_decay` compute
//! pass does, which makes it the reference for the GPU pass.

use crate::constants::CELL_BYTES;
use crate::error::{Error, Result};
use crate::layout::{AgentData, Float2, ShaderOptions};

pub type Cell = [f32; 4];

/// Dimensions a trail buffer was allocated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldExtent {
    pub width: u32,
    pub height: u32,
}

impl FieldExtent {
    pub fn new(width: u32, height: u32) -> Self {
        FieldExtent { width, height }
    }

    pub fn of(data: &AgentData) -> Self {
        FieldExtent {
            width: data.width.max(0) as u32,
            height: data.height.max(0) as u32,
        }
    }

    pub fn cells(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn byte_len(&self) -> u64 {
        (self.width as u64 * self.height as u64).saturating_mul(CELL_BYTES)
    }

    /// Must pass before any dispatch that maps agent positions into the field.
    pub fn check(&self, data: &AgentData) -> Result<()> {
        if data.width < 0
            || data.height < 0
            || data.width as u32 != self.width
            || data.height as u32 != self.height
        {
            return Err(Error::FieldSizeMismatch {
                allocated_width: self.width,
                allocated_height: self.height,
                width: data.width,
                height: data.height,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrailField {
    extent: FieldExtent,
    cells: Vec<Cell>,
}

impl TrailField {
    pub fn new(extent: FieldExtent) -> Self {
        TrailField {
            extent,
            cells: vec![[0.0; 4]; extent.cells()],
        }
    }

    pub fn for_agent_data(data: &AgentData) -> Self {
        Self::new(FieldExtent::of(data))
    }

    pub fn extent(&self) -> FieldExtent {
        self.extent
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.cells)
    }

    pub fn cell(&self, x: u32, y: u32) -> Option<&Cell> {
        if x >= self.extent.width || y >= self.extent.height {
            return None;
        }
        self.cells.get(self.linear(x, y))
    }

    pub fn cell_mut(&mut self, x: u32, y: u32) -> Option<&mut Cell> {
        if x >= self.extent.width || y >= self.extent.height {
            return None;
        }
        let i = self.linear(x, y);
        self.cells.get_mut(i)
    }

    /// Cell under a continuous position, `None` outside the field.
    pub fn cell_index(&self, position: Float2) -> Option<usize> {
        if !(position.x >= 0.0 && position.y >= 0.0) {
            return None;
        }
        let x = position.x as u64;
        let y = position.y as u64;
        if x >= self.extent.width as u64 || y >= self.extent.height as u64 {
            return None;
        }
        Some(self.linear(x as u32, y as u32))
    }

    /// Wraps a position onto the torus spanned by the field.
    pub fn wrap(&self, position: Float2) -> Float2 {
        let w = self.extent.width as f32;
        let h = self.extent.height as f32;
        let x = position.x.rem_euclid(w);
        let y = position.y.rem_euclid(h);
        // rem_euclid can round up to the modulus for tiny negative inputs
        Float2::new(
            if x >= w { 0.0 } else { x },
            if y >= h { 0.0 } else { y },
        )
    }

    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = [0.0; 4]);
    }

    /// Fades every channel by `reduce_amount`, never below zero.
    pub fn decay(&mut self, options: &ShaderOptions) {
        let reduce = options.reduce_amount;
        if reduce == 0.0 {
            return;
        }
        for cell in &mut self.cells {
            for v in cell.iter_mut() {
                *v = (*v - reduce).max(0.0);
            }
        }
    }

    /// Blends `deposits` in, blurs over the `max_blur_distance` window, then decays.
    /// The result is written to `out`, which must share this field's extent.
    pub fn diffuse_into(
        &self,
        deposits: &TrailField,
        options: &ShaderOptions,
        out: &mut TrailField,
    ) -> Result<()> {
        for other in [deposits.extent, out.extent] {
            if other != self.extent {
                return Err(Error::FieldSizeMismatch {
                    allocated_width: self.extent.width,
                    allocated_height: self.extent.height,
                    width: other.width as i32,
                    height: other.height as i32,
                });
            }
        }

        let width = self.extent.width as i64;
        let height = self.extent.height as i64;
        let radius = options.max_blur_distance.max(0) as i64;
        let t = options.diffusion_amount;
        let reduce = options.reduce_amount;

        let sample = |i: usize| -> Cell {
            let mut c = self.cells[i];
            for (v, d) in c.iter_mut().zip(deposits.cells[i].iter()) {
                *v = (*v + d).min(1.0);
            }
            c
        };

        for y in 0..height {
            for x in 0..width {
                let mut sum = [0.0f32; 4];
                let mut count = 0.0f32;
                for sy in (y - radius).max(0)..=(y + radius).min(height - 1) {
                    for sx in (x - radius).max(0)..=(x + radius).min(width - 1) {
                        let s = sample((sy * width + sx) as usize);
                        for (acc, v) in sum.iter_mut().zip(s.iter()) {
                            *acc += v;
                        }
                        count += 1.0;
                    }
                }

                let i = (y * width + x) as usize;
                let original = sample(i);
                let target = &mut out.cells[i];
                for c in 0..4 {
                    let mean = sum[c] / count;
                    let blurred = original[c] * (1.0 - t) + mean * t;
                    target[c] = (blurred - reduce).max(0.0);
                }
            }
        }
        Ok(())
    }

    fn linear(&self, x: u32, y: u32) -> usize {
        y as usize * self.extent.width as usize + x as usize
    }
}
