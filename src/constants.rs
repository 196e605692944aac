use std::f32::consts::PI;

use crate::layout::{Float2, Vertex};

pub const WIDTH: u32 = 1280;
pub const HEIGHT: u32 = 960;

pub const NUM_AGENTS: u32 = 1_000_000;

pub const REDUCE_AMOUNT: f32 = 0.01;
pub const DIFFUSION_AMOUNT: f32 = 0.2;
pub const DRAW_STRENGTH: f32 = 0.1;
pub const MAX_BLUR_DISTANCE: i32 = 1;

pub const SENSOR_DISTANCE: f32 = 40.0;
pub const SENSOR_ANGLE: f32 = PI / 6.0;
pub const MAX_TURN: f32 = PI / 12.0;
pub const VELOCITY: f32 = 1.0;

/// One trail channel per species, so a cell holds at most four.
pub const MAX_SPECIES: usize = 4;

pub const SPECIES_COLOURS: [[f32; 3]; 3] = [
    [0.0, 0.0, 1.0],
    [0.0, 1.0, 0.0],
    [1.0, 0.0, 0.0],
];

/// RGBA f32 per trail cell
pub const CELL_BYTES: u64 = 4 * 4;

pub const AGENT_WORKGROUP_SIZE: u32 = 64;
pub const FIELD_WORKGROUP_SIZE: u32 = 8;

pub const DEFAULT_FRAMES: u32 = 60;

/// Full screen quad, drawn as a triangle strip.
pub const QUAD: [Vertex; 4] = [
    Vertex {
        position: Float2::new(-1.0, -1.0),
        texture_coord: Float2::new(0.0, 1.0),
    },
    Vertex {
        position: Float2::new(1.0, -1.0),
        texture_coord: Float2::new(1.0, 1.0),
    },
    Vertex {
        position: Float2::new(-1.0, 1.0),
        texture_coord: Float2::new(0.0, 0.0),
    },
    Vertex {
        position: Float2::new(1.0, 1.0),
        texture_coord: Float2::new(1.0, 0.0),
    },
];
