//! Session configuration owned by the host.
//!
//! `SessionConfig` is created once per session and handed by reference to
//! every stage that needs it. The GPU records are derived from it on demand.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};
#[cfg(not(feature = "per-agent-velocity"))]
use crate::layout::Options;
use crate::layout::{AgentData, ShaderOptions};

/// A two state switch. Encoded as 0/1 only where a record needs an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "bool", into = "bool")]
pub enum Toggle {
    #[default]
    Off,
    On,
}

impl Toggle {
    /// Any non-zero value is on.
    pub fn from_raw(raw: i32) -> Self {
        if raw == 0 {
            Toggle::Off
        } else {
            Toggle::On
        }
    }

    pub fn is_on(self) -> bool {
        self == Toggle::On
    }

    pub fn flip(self) -> Self {
        match self {
            Toggle::Off => Toggle::On,
            Toggle::On => Toggle::Off,
        }
    }
}

impl From<bool> for Toggle {
    fn from(on: bool) -> Self {
        if on {
            Toggle::On
        } else {
            Toggle::Off
        }
    }
}

impl From<Toggle> for bool {
    fn from(toggle: Toggle) -> Self {
        toggle.is_on()
    }
}

impl From<Toggle> for i32 {
    fn from(toggle: Toggle) -> Self {
        toggle.is_on() as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentParams {
    pub max_turn: f32,
    pub sensor_angle: f32,
    pub sensor_distance: f32,
    pub velocity: f32,
    pub width: u32,
    pub height: u32,
}

impl Default for AgentParams {
    fn default() -> Self {
        AgentParams {
            max_turn: MAX_TURN,
            sensor_angle: SENSOR_ANGLE,
            sensor_distance: SENSOR_DISTANCE,
            velocity: VELOCITY,
            width: WIDTH,
            height: HEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed for the session; changing it means reallocating the agent buffer.
    pub number_agents: u32,
    pub draw_trails: Toggle,
    pub paused: Toggle,
    pub shader_options: ShaderOptions,
    pub agents: AgentParams,
    /// Display colour of each species.
    pub species: Vec<[f32; 3]>,
    pub seed: Option<u64>,
    /// WGSL file providing the `update_agents` entry point.
    pub agent_kernel: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            number_agents: NUM_AGENTS,
            draw_trails: Toggle::On,
            paused: Toggle::Off,
            shader_options: ShaderOptions::default(),
            agents: AgentParams::default(),
            species: SPECIES_COLOURS.to_vec(),
            seed: None,
            agent_kernel: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        log::info!("loaded session config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        let max = i32::MAX as u32;

        if self.number_agents == 0 || self.number_agents > max {
            return invalid(format!("number_agents must be in 1..={}", max));
        }
        if self.agents.width == 0 || self.agents.height == 0 {
            return invalid("trail field must be at least 1x1".to_string());
        }
        if self.agents.width > max || self.agents.height > max {
            return invalid(format!("trail field dimensions must not exceed {}", max));
        }
        let field_bytes = (self.agents.width as u64)
            .checked_mul(self.agents.height as u64)
            .and_then(|cells| cells.checked_mul(CELL_BYTES));
        if !matches!(field_bytes, Some(bytes) if bytes <= isize::MAX as u64) {
            return invalid(format!(
                "a {}x{} trail field does not fit in memory",
                self.agents.width, self.agents.height
            ));
        }
        if self.species.is_empty() || self.species.len() > MAX_SPECIES {
            return invalid(format!("between 1 and {} species are supported", MAX_SPECIES));
        }

        let opts = &self.shader_options;
        let floats = [
            ("reduce_amount", opts.reduce_amount),
            ("diffusion_amount", opts.diffusion_amount),
            ("draw_strength", opts.draw_strength),
            ("max_turn", self.agents.max_turn),
            ("sensor_angle", self.agents.sensor_angle),
            ("sensor_distance", self.agents.sensor_distance),
            ("velocity", self.agents.velocity),
        ];
        if let Some((name, _)) = floats.iter().find(|(_, v)| !v.is_finite()) {
            return invalid(format!("{} must be finite", name));
        }
        if !(0.0..=1.0).contains(&opts.reduce_amount) {
            return invalid("reduce_amount must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&opts.diffusion_amount) {
            return invalid("diffusion_amount must be in [0, 1]".to_string());
        }
        if opts.draw_strength < 0.0 {
            return invalid("draw_strength must not be negative".to_string());
        }
        if opts.max_blur_distance < 0 {
            return invalid("max_blur_distance must not be negative".to_string());
        }
        check_agent_data(&self.agent_data(), self.species.len())
    }

    /// Copies a live `AgentData` edit back into the host parameters.
    /// `number_species` stays derived from `species`.
    pub fn apply_agent_data(&mut self, data: &AgentData) {
        self.agents.max_turn = data.max_turn;
        self.agents.sensor_angle = data.sensor_angle;
        self.agents.sensor_distance = data.sensor_distance;
        self.agents.width = data.width.max(0) as u32;
        self.agents.height = data.height.max(0) as u32;
        #[cfg(not(feature = "per-agent-velocity"))]
        {
            self.agents.velocity = data.velocity;
        }
    }

    pub fn agent_data(&self) -> AgentData {
        AgentData {
            number_species: self.species.len() as i32,
            max_turn: self.agents.max_turn,
            sensor_angle: self.agents.sensor_angle,
            sensor_distance: self.agents.sensor_distance,
            width: self.agents.width as i32,
            height: self.agents.height as i32,
            #[cfg(not(feature = "per-agent-velocity"))]
            velocity: self.agents.velocity,
        }
    }

    #[cfg(not(feature = "per-agent-velocity"))]
    pub fn options(&self) -> Options {
        Options {
            number_agents: self.number_agents as i32,
            draw_trails: self.draw_trails.into(),
            paused: self.paused.into(),
            shader_options: self.shader_options,
        }
    }

    /// Species colours padded to `vec4<f32>` stride.
    pub fn palette(&self) -> Vec<[f32; 4]> {
        self.species.iter().map(|&[r, g, b]| [r, g, b, 1.0]).collect()
    }
}

/// Checks an `AgentData` record before it reaches an agent step.
/// `palette_len` is the number of species colours, one trail channel each.
pub fn check_agent_data(data: &AgentData, palette_len: usize) -> Result<()> {
    let species = data.number_species;
    if species < 1 || species as usize > palette_len.min(MAX_SPECIES) {
        return Err(Error::InvalidConfig(format!(
            "number_species {} outside 1..={}",
            species,
            palette_len.min(MAX_SPECIES)
        )));
    }
    if data.width < 1 || data.height < 1 {
        return Err(Error::InvalidConfig(format!(
            "agent data field {}x{} must be at least 1x1",
            data.width, data.height
        )));
    }

    #[allow(unused_mut)]
    let mut floats = vec![
        ("max_turn", data.max_turn),
        ("sensor_angle", data.sensor_angle),
        ("sensor_distance", data.sensor_distance),
    ];
    #[cfg(not(feature = "per-agent-velocity"))]
    floats.push(("velocity", data.velocity));
    if let Some((name, _)) = floats.iter().find(|(_, v)| !v.is_finite()) {
        return Err(Error::InvalidConfig(format!("agent data {} must be finite", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.agent_data().number_species, 3);
        assert_eq!(config.agent_data().width, WIDTH as i32);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{ "number_agents": 1000, "paused": true, "agents": { "width": 512, "height": 512 } }"#,
        )
        .unwrap();
        assert_eq!(config.number_agents, 1000);
        assert_eq!(config.paused, Toggle::On);
        assert_eq!(config.draw_trails, Toggle::On);
        assert_eq!(config.agents.width, 512);
        assert_eq!(config.agents.sensor_distance, SENSOR_DISTANCE);
        assert_eq!(config.shader_options, ShaderOptions::default());
    }

    #[test]
    fn toggles_encode_as_zero_or_one() {
        assert_eq!(i32::from(Toggle::On), 1);
        assert_eq!(i32::from(Toggle::Off), 0);
        assert_eq!(Toggle::from_raw(7), Toggle::On);
        assert_eq!(Toggle::On.flip(), Toggle::Off);
    }

    #[cfg(not(feature = "per-agent-velocity"))]
    #[test]
    fn options_record_mirrors_flags() {
        let config = SessionConfig {
            paused: Toggle::On,
            draw_trails: Toggle::Off,
            ..Default::default()
        };
        let options = config.options();
        assert_eq!(options.paused, 1);
        assert_eq!(options.draw_trails, 0);
        assert_eq!(options.number_agents, NUM_AGENTS as i32);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = SessionConfig::default();
        config.number_agents = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = SessionConfig::default();
        config.shader_options.reduce_amount = 1.5;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.shader_options.max_blur_distance = -1;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.species = vec![[1.0, 1.0, 1.0]; MAX_SPECIES + 1];
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.agents.sensor_angle = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.agents.width = i32::MAX as u32;
        config.agents.height = i32::MAX as u32;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn agent_data_needs_a_colour_per_species() {
        let config = SessionConfig::default();
        let mut data = config.agent_data();
        check_agent_data(&data, 3).unwrap();

        data.number_species = 9;
        assert!(matches!(check_agent_data(&data, 3), Err(Error::InvalidConfig(_))));
        data.number_species = 4;
        assert!(check_agent_data(&data, 4).is_ok());
        assert!(check_agent_data(&data, 3).is_err());
        data.number_species = 0;
        assert!(check_agent_data(&data, 3).is_err());

        let mut data = config.agent_data();
        data.max_turn = f32::NAN;
        assert!(check_agent_data(&data, 3).is_err());
        let mut data = config.agent_data();
        data.height = -4;
        assert!(check_agent_data(&data, 3).is_err());
    }

    #[test]
    fn applied_agent_data_reaches_the_params() {
        let mut config = SessionConfig::default();
        let mut data = config.agent_data();
        data.width = 640;
        data.max_turn = 0.5;
        config.apply_agent_data(&data);
        assert_eq!(config.agents.width, 640);
        assert_eq!(config.agent_data(), data);
    }

    #[test]
    fn zero_reduce_amount_is_allowed() {
        let mut config = SessionConfig::default();
        config.shader_options.reduce_amount = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn palette_pads_to_vec4() {
        let palette = SessionConfig::default().palette();
        assert_eq!(palette[0], [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(palette.len(), 3);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SessionConfig::load("/nonexistent/slime.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/slime.json"));
    }
}
