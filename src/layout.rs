//! Records exchanged between the host and the compute/render shaders.
//!
//! Each struct in this module is the only definition of its layout. The WGSL
//! side is generated from [`GpuRecord::FIELDS`] by [`wgsl_declarations`] and
//! every shader module is prefixed with that text. [`verify_wgsl_layouts`]
//! parses the generated WGSL with naga and checks that the offsets it computes
//! are the ones `#[repr(C)]` gave us.
//!
//! Which revision of the schema is built is decided by [`SCHEMA_REVISION`]
//! alone (cargo feature `per-agent-velocity`).

use std::fmt::Write;
use std::mem::{offset_of, size_of};

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};

/// Revision 1 keeps `velocity` in [`AgentData`] and ships [`Options`].
#[cfg(not(feature = "per-agent-velocity"))]
pub const SCHEMA_REVISION: u32 = 1;
/// Revision 2 stores `velocity` on every [`Agent`] and has no `Options` record.
#[cfg(feature = "per-agent-velocity")]
pub const SCHEMA_REVISION: u32 = 2;

/// `vec2<f32>`: two floats with the 8 byte alignment the GPU expects.
#[repr(C, align(8))]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Float2 {
    pub x: f32,
    pub y: f32,
}

impl Float2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Float2 { x, y }
    }
}

impl From<[f32; 2]> for Float2 {
    fn from([x, y]: [f32; 2]) -> Self {
        Float2 { x, y }
    }
}

impl From<cgmath::Vector2<f32>> for Float2 {
    fn from(v: cgmath::Vector2<f32>) -> Self {
        Float2 { x: v.x, y: v.y }
    }
}

unsafe impl bytemuck::Zeroable for Float2 {}
unsafe impl bytemuck::Pod for Float2 {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vertex {
    pub position: Float2,
    pub texture_coord: Float2,
}

unsafe impl bytemuck::Zeroable for Vertex {}
unsafe impl bytemuck::Pod for Vertex {}

/// One simulated particle. `index` always equals the agent's slot in the
/// agent buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Agent {
    pub position: Float2,
    pub angle: f32,
    pub index: i32,
    #[cfg(feature = "per-agent-velocity")]
    pub velocity: f32,
    #[cfg(feature = "per-agent-velocity")]
    #[doc(hidden)]
    pub _padding: u32,
}

unsafe impl bytemuck::Zeroable for Agent {}
unsafe impl bytemuck::Pod for Agent {}

impl Agent {
    /// Species are assigned round robin over the agent buffer.
    pub fn species(&self, number_species: i32) -> u32 {
        if number_species <= 0 {
            return 0;
        }
        self.index.rem_euclid(number_species) as u32
    }
}

/// Trail tuning, read only on the GPU. The host may rewrite it every frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderOptions {
    pub reduce_amount: f32,
    pub diffusion_amount: f32,
    pub draw_strength: f32,
    pub max_blur_distance: i32,
}

impl Default for ShaderOptions {
    fn default() -> Self {
        ShaderOptions {
            reduce_amount: REDUCE_AMOUNT,
            diffusion_amount: DIFFUSION_AMOUNT,
            draw_strength: DRAW_STRENGTH,
            max_blur_distance: MAX_BLUR_DISTANCE,
        }
    }
}

unsafe impl bytemuck::Zeroable for ShaderOptions {}
unsafe impl bytemuck::Pod for ShaderOptions {}

/// Session flags as they cross the boundary; `draw_trails` and `paused` are 0 or 1.
#[cfg(not(feature = "per-agent-velocity"))]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Options {
    pub number_agents: i32,
    pub draw_trails: i32,
    pub paused: i32,
    pub shader_options: ShaderOptions,
}

#[cfg(not(feature = "per-agent-velocity"))]
unsafe impl bytemuck::Zeroable for Options {}
#[cfg(not(feature = "per-agent-velocity"))]
unsafe impl bytemuck::Pod for Options {}

/// Simulation wide constants for the agent update. `width` and `height` must
/// match the allocated trail field.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AgentData {
    pub number_species: i32,
    pub max_turn: f32,
    pub sensor_angle: f32,
    pub sensor_distance: f32,
    pub width: i32,
    pub height: i32,
    #[cfg(not(feature = "per-agent-velocity"))]
    pub velocity: f32,
}

unsafe impl bytemuck::Zeroable for AgentData {}
unsafe impl bytemuck::Pod for AgentData {}

// The Pod impls above are only sound without implicit padding.
const _: () = assert!(size_of::<Float2>() == 8);
const _: () = assert!(size_of::<Vertex>() == 16);
#[cfg(not(feature = "per-agent-velocity"))]
const _: () = assert!(size_of::<Agent>() == 16);
#[cfg(feature = "per-agent-velocity")]
const _: () = assert!(size_of::<Agent>() == 24);
const _: () = assert!(size_of::<ShaderOptions>() == 16);
#[cfg(not(feature = "per-agent-velocity"))]
const _: () = assert!(size_of::<Options>() == 28);
#[cfg(not(feature = "per-agent-velocity"))]
const _: () = assert!(size_of::<AgentData>() == 28);
#[cfg(feature = "per-agent-velocity")]
const _: () = assert!(size_of::<AgentData>() == 24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: &'static str,
    pub wgsl_type: &'static str,
    pub offset: usize,
}

impl FieldLayout {
    const fn new(name: &'static str, wgsl_type: &'static str, offset: usize) -> Self {
        FieldLayout {
            name,
            wgsl_type,
            offset,
        }
    }
}

/// A record with a mirrored WGSL struct. Padding fields are not listed.
pub trait GpuRecord: bytemuck::Pod {
    const WGSL_NAME: &'static str;
    const FIELDS: &'static [FieldLayout];

    fn size() -> usize {
        size_of::<Self>()
    }

    fn wgsl_struct() -> String {
        let mut out = format!("struct {} {{\n", Self::WGSL_NAME);
        for field in Self::FIELDS {
            let _ = writeln!(out, "    {}: {},", field.name, field.wgsl_type);
        }
        out.push_str("}\n");
        out
    }
}

impl GpuRecord for Vertex {
    const WGSL_NAME: &'static str = "Vertex";
    const FIELDS: &'static [FieldLayout] = &[
        FieldLayout::new("position", "vec2<f32>", offset_of!(Vertex, position)),
        FieldLayout::new("texture_coord", "vec2<f32>", offset_of!(Vertex, texture_coord)),
    ];
}

impl GpuRecord for Agent {
    const WGSL_NAME: &'static str = "Agent";
    #[cfg(not(feature = "per-agent-velocity"))]
    const FIELDS: &'static [FieldLayout] = &[
        FieldLayout::new("position", "vec2<f32>", offset_of!(Agent, position)),
        FieldLayout::new("angle", "f32", offset_of!(Agent, angle)),
        FieldLayout::new("index", "i32", offset_of!(Agent, index)),
    ];
    #[cfg(feature = "per-agent-velocity")]
    const FIELDS: &'static [FieldLayout] = &[
        FieldLayout::new("position", "vec2<f32>", offset_of!(Agent, position)),
        FieldLayout::new("angle", "f32", offset_of!(Agent, angle)),
        FieldLayout::new("index", "i32", offset_of!(Agent, index)),
        FieldLayout::new("velocity", "f32", offset_of!(Agent, velocity)),
    ];
}

impl GpuRecord for ShaderOptions {
    const WGSL_NAME: &'static str = "ShaderOptions";
    const FIELDS: &'static [FieldLayout] = &[
        FieldLayout::new("reduce_amount", "f32", offset_of!(ShaderOptions, reduce_amount)),
        FieldLayout::new(
            "diffusion_amount",
            "f32",
            offset_of!(ShaderOptions, diffusion_amount),
        ),
        FieldLayout::new("draw_strength", "f32", offset_of!(ShaderOptions, draw_strength)),
        FieldLayout::new(
            "max_blur_distance",
            "i32",
            offset_of!(ShaderOptions, max_blur_distance),
        ),
    ];
}

#[cfg(not(feature = "per-agent-velocity"))]
impl GpuRecord for Options {
    const WGSL_NAME: &'static str = "Options";
    const FIELDS: &'static [FieldLayout] = &[
        FieldLayout::new("number_agents", "i32", offset_of!(Options, number_agents)),
        FieldLayout::new("draw_trails", "i32", offset_of!(Options, draw_trails)),
        FieldLayout::new("paused", "i32", offset_of!(Options, paused)),
        FieldLayout::new(
            "shader_options",
            "ShaderOptions",
            offset_of!(Options, shader_options),
        ),
    ];
}

impl GpuRecord for AgentData {
    const WGSL_NAME: &'static str = "AgentData";
    #[cfg(not(feature = "per-agent-velocity"))]
    const FIELDS: &'static [FieldLayout] = &[
        FieldLayout::new("number_species", "i32", offset_of!(AgentData, number_species)),
        FieldLayout::new("max_turn", "f32", offset_of!(AgentData, max_turn)),
        FieldLayout::new("sensor_angle", "f32", offset_of!(AgentData, sensor_angle)),
        FieldLayout::new("sensor_distance", "f32", offset_of!(AgentData, sensor_distance)),
        FieldLayout::new("width", "i32", offset_of!(AgentData, width)),
        FieldLayout::new("height", "i32", offset_of!(AgentData, height)),
        FieldLayout::new("velocity", "f32", offset_of!(AgentData, velocity)),
    ];
    #[cfg(feature = "per-agent-velocity")]
    const FIELDS: &'static [FieldLayout] = &[
        FieldLayout::new("number_species", "i32", offset_of!(AgentData, number_species)),
        FieldLayout::new("max_turn", "f32", offset_of!(AgentData, max_turn)),
        FieldLayout::new("sensor_angle", "f32", offset_of!(AgentData, sensor_angle)),
        FieldLayout::new("sensor_distance", "f32", offset_of!(AgentData, sensor_distance)),
        FieldLayout::new("width", "i32", offset_of!(AgentData, width)),
        FieldLayout::new("height", "i32", offset_of!(AgentData, height)),
    ];
}

/// WGSL declarations of every record in the active revision, in dependency order.
pub fn wgsl_declarations() -> String {
    let mut structs = vec![
        Vertex::wgsl_struct(),
        Agent::wgsl_struct(),
        ShaderOptions::wgsl_struct(),
    ];
    #[cfg(not(feature = "per-agent-velocity"))]
    structs.push(Options::wgsl_struct());
    structs.push(AgentData::wgsl_struct());

    let mut out = format!("const SCHEMA_REVISION: u32 = {}u;\n", SCHEMA_REVISION);
    for s in structs {
        out.push('\n');
        out.push_str(&s);
    }
    out
}

/// Size and member offsets of a struct as the shader compiler lays it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub size: u32,
    pub members: Vec<(String, u32)>,
}

pub(crate) fn parse_wgsl(name: &'static str, source: &str) -> Result<naga::Module> {
    naga::front::wgsl::parse_str(source).map_err(|err| Error::Shader {
        name,
        message: err.emit_to_string(source),
    })
}

fn find_struct(module: &naga::Module, name: &str) -> Option<RecordLayout> {
    module.types.iter().find_map(|(_, ty)| match &ty.inner {
        naga::TypeInner::Struct { members, span } if ty.name.as_deref() == Some(name) => {
            Some(RecordLayout {
                size: *span,
                members: members
                    .iter()
                    .map(|m| (m.name.clone().unwrap_or_default(), m.offset))
                    .collect(),
            })
        }
        _ => None,
    })
}

/// Reflects the struct `name` out of WGSL `source`.
pub fn reflect(source: &str, name: &str) -> Result<Option<RecordLayout>> {
    let module = parse_wgsl("reflect", source)?;
    Ok(find_struct(&module, name))
}

fn check_record<T: GpuRecord>(module: &naga::Module) -> Result<()> {
    let mismatch = |detail: String| Error::LayoutMismatch {
        record: T::WGSL_NAME,
        detail,
    };

    let shader = find_struct(module, T::WGSL_NAME)
        .ok_or_else(|| mismatch("struct is missing from the shader".to_string()))?;

    if shader.size as usize != T::size() {
        return Err(mismatch(format!(
            "host size {} bytes, shader size {} bytes",
            T::size(),
            shader.size
        )));
    }
    if shader.members.len() != T::FIELDS.len() {
        return Err(mismatch(format!(
            "host has {} fields, shader has {}",
            T::FIELDS.len(),
            shader.members.len()
        )));
    }
    for (field, (name, offset)) in T::FIELDS.iter().zip(&shader.members) {
        if field.name != name || field.offset != *offset as usize {
            return Err(mismatch(format!(
                "host `{}` at {}, shader `{}` at {}",
                field.name, field.offset, name, offset
            )));
        }
    }
    Ok(())
}

/// Checks one record against a shader source that declares it.
pub fn verify_record<T: GpuRecord>(source: &str) -> Result<()> {
    let module = parse_wgsl("layout", source)?;
    check_record::<T>(&module)
}

/// Checks every record of the active revision against its generated WGSL.
pub fn verify_wgsl_layouts() -> Result<()> {
    let source = wgsl_declarations();
    let module = parse_wgsl("layout", &source)?;

    check_record::<Vertex>(&module)?;
    check_record::<Agent>(&module)?;
    check_record::<ShaderOptions>(&module)?;
    #[cfg(not(feature = "per-agent-velocity"))]
    check_record::<Options>(&module)?;
    check_record::<AgentData>(&module)?;

    log::debug!(
        "schema revision {} verified: Vertex {}B, Agent {}B, ShaderOptions {}B, AgentData {}B",
        SCHEMA_REVISION,
        Vertex::size(),
        Agent::size(),
        ShaderOptions::size(),
        AgentData::size()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::mem::align_of;

    use super::*;

    #[test]
    fn vectors_are_eight_byte_aligned() {
        assert_eq!(align_of::<Float2>(), 8);
        assert_eq!(align_of::<Vertex>(), 8);
        assert_eq!(align_of::<Agent>(), 8);
        assert_eq!(offset_of!(Vertex, texture_coord), 8);
    }

    #[test]
    fn generated_wgsl_matches_host_layout() {
        verify_wgsl_layouts().unwrap();
    }

    #[test]
    fn declarations_carry_the_schema_revision() {
        let source = wgsl_declarations();
        assert!(source.contains(&format!("const SCHEMA_REVISION: u32 = {}u;", SCHEMA_REVISION)));
        assert!(source.contains("struct AgentData {"));
    }

    #[cfg(not(feature = "per-agent-velocity"))]
    #[test]
    fn nested_shader_options_follow_the_flags() {
        let layout = reflect(&wgsl_declarations(), "Options").unwrap().unwrap();
        assert_eq!(layout.size, 28);
        assert_eq!(layout.members[3], ("shader_options".to_string(), 12));
    }

    #[cfg(not(feature = "per-agent-velocity"))]
    #[test]
    fn other_revision_agent_is_rejected() {
        let drifted = "
struct Agent {
    position: vec2<f32>,
    angle: f32,
    index: i32,
    velocity: f32,
}
";
        match verify_record::<Agent>(drifted) {
            Err(Error::LayoutMismatch { record, detail }) => {
                assert_eq!(record, "Agent");
                assert!(detail.contains("shader size 24"), "{}", detail);
            }
            other => panic!("expected a layout mismatch, got {:?}", other),
        }
    }

    #[cfg(feature = "per-agent-velocity")]
    #[test]
    fn other_revision_agent_is_rejected() {
        let drifted = "
struct Agent {
    position: vec2<f32>,
    angle: f32,
    index: i32,
}
";
        assert!(matches!(
            verify_record::<Agent>(drifted),
            Err(Error::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn reordered_fields_are_rejected() {
        let swapped = "
struct ShaderOptions {
    diffusion_amount: f32,
    reduce_amount: f32,
    draw_strength: f32,
    max_blur_distance: i32,
}
";
        assert!(matches!(
            verify_record::<ShaderOptions>(swapped),
            Err(Error::LayoutMismatch { .. })
        ));
    }

    fn round_trip<T: GpuRecord>(record: &T) -> T {
        let bytes = bytemuck::bytes_of(record).to_vec();
        assert_eq!(bytes.len(), T::size());
        let back: T = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(bytemuck::bytes_of(&back), &bytes[..]);
        back
    }

    #[test]
    fn records_survive_the_byte_boundary() {
        let vertex = round_trip(&Vertex {
            position: Float2::new(-1.0, f32::MAX),
            texture_coord: Float2::new(0.5, -0.0),
        });
        assert_eq!(vertex.position.y.to_bits(), f32::MAX.to_bits());
        assert_eq!(vertex.texture_coord.y.to_bits(), (-0.0f32).to_bits());

        let agent = round_trip(&Agent {
            position: Float2::new(12.25, 3.5),
            angle: -std::f32::consts::FRAC_PI_2,
            index: 41,
            ..Default::default()
        });
        assert_eq!(agent.angle.to_bits(), (-std::f32::consts::FRAC_PI_2).to_bits());
        assert_eq!(agent.index, 41);

        let options = ShaderOptions {
            reduce_amount: f32::MIN_POSITIVE,
            diffusion_amount: 1.0,
            draw_strength: 0.1,
            max_blur_distance: -3,
        };
        let back = round_trip(&options);
        assert_eq!(back.reduce_amount.to_bits(), f32::MIN_POSITIVE.to_bits());
        assert_eq!(back.draw_strength.to_bits(), 0.1f32.to_bits());
        assert_eq!(back.max_blur_distance, -3);

        #[cfg(not(feature = "per-agent-velocity"))]
        {
            let flags = round_trip(&Options {
                number_agents: 1000,
                draw_trails: 1,
                paused: 0,
                shader_options: options,
            });
            assert_eq!(flags.number_agents, 1000);
            assert_eq!(flags.draw_trails, 1);
            assert_eq!(flags.shader_options, options);
        }

        let data = round_trip(&AgentData {
            number_species: 3,
            max_turn: std::f32::consts::PI / 12.0,
            sensor_angle: -0.0,
            sensor_distance: f32::MIN_POSITIVE,
            width: 512,
            height: 384,
            ..Default::default()
        });
        assert_eq!(data.sensor_angle.to_bits(), (-0.0f32).to_bits());
        assert_eq!(data.max_turn.to_bits(), (std::f32::consts::PI / 12.0).to_bits());
        assert_eq!(data.width, 512);
    }

    #[test]
    fn species_wrap_over_the_buffer() {
        let agent = Agent {
            index: 7,
            ..Default::default()
        };
        assert_eq!(agent.species(3), 1);
        assert_eq!(agent.species(1), 0);
        assert_eq!(agent.species(0), 0);
    }
}
