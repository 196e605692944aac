//! Per-frame pass planning, and a host side session that runs the plan.
//!
//! A frame is an ordered list of stages. Each stage only starts once the one
//! before it has completed: agents deposit before the trail pass reads the
//! deposits, and the trail pass finishes before anything is drawn.

use crate::agents;
use crate::config::{self, SessionConfig, Toggle};
use crate::error::Result;
use crate::field::{FieldExtent, TrailField};
use crate::layout::{Agent, AgentData, ShaderOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderSource {
    /// The accumulated, diffused trail field.
    Trails,
    /// Only what agents deposited during the last simulated frame.
    Deposits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    UpdateAgents,
    DiffuseTrails,
    Render(RenderSource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    stages: Vec<Stage>,
}

impl FramePlan {
    pub fn for_config(config: &SessionConfig) -> Self {
        let mut stages = Vec::with_capacity(3);
        if !config.paused.is_on() {
            stages.push(Stage::UpdateAgents);
            stages.push(Stage::DiffuseTrails);
        }
        let source = if config.draw_trails.is_on() {
            RenderSource::Trails
        } else {
            RenderSource::Deposits
        };
        stages.push(Stage::Render(source));
        FramePlan { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn steps_simulation(&self) -> bool {
        self.stages.contains(&Stage::UpdateAgents)
    }

    pub fn render_source(&self) -> Option<RenderSource> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Render(source) => Some(*source),
            _ => None,
        })
    }
}

/// What an agent update sees during one step.
pub struct StepContext<'a> {
    pub agent_data: &'a AgentData,
    pub shader_options: &'a ShaderOptions,
    pub palette: &'a [[f32; 4]],
    pub trail: &'a TrailField,
    /// Cleared before every step.
    pub deposits: &'a mut TrailField,
}

/// The movement, sensing and deposition rule. One call advances every agent by one step.
pub trait AgentStep {
    fn step(&mut self, agents: &mut [Agent], ctx: StepContext<'_>);
}

impl<F> AgentStep for F
where
    F: FnMut(&mut [Agent], StepContext<'_>),
{
    fn step(&mut self, agents: &mut [Agent], ctx: StepContext<'_>) {
        self(agents, ctx)
    }
}

/// Leaves agents where they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct Frozen;

impl AgentStep for Frozen {
    fn step(&mut self, _agents: &mut [Agent], _ctx: StepContext<'_>) {}
}

pub struct Simulation<S> {
    config: SessionConfig,
    agent_data: AgentData,
    palette: Vec<[f32; 4]>,
    agents: Vec<Agent>,
    trail: TrailField,
    scratch: TrailField,
    deposits: TrailField,
    stepper: S,
    last_render: Option<RenderSource>,
    frame_num: u64,
}

impl<S: AgentStep> Simulation<S> {
    pub fn new(config: SessionConfig, stepper: S) -> Result<Self> {
        config.validate()?;
        let agent_data = config.agent_data();
        let extent = FieldExtent::of(&agent_data);
        let agents = agents::spawn(&config, &mut agents::session_rng(&config));

        Ok(Simulation {
            palette: config.palette(),
            config,
            agent_data,
            agents,
            trail: TrailField::new(extent),
            scratch: TrailField::new(extent),
            deposits: TrailField::new(extent),
            stepper,
            last_render: None,
            frame_num: 0,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn agent_data(&self) -> &AgentData {
        &self.agent_data
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn trail(&self) -> &TrailField {
        &self.trail
    }

    pub fn trail_mut(&mut self) -> &mut TrailField {
        &mut self.trail
    }

    pub fn frame_num(&self) -> u64 {
        self.frame_num
    }

    /// The field the last render stage showed.
    pub fn displayed(&self) -> Option<&TrailField> {
        self.last_render.map(|source| match source {
            RenderSource::Trails => &self.trail,
            RenderSource::Deposits => &self.deposits,
        })
    }

    pub fn set_paused(&mut self, paused: Toggle) {
        self.config.paused = paused;
    }

    pub fn set_draw_trails(&mut self, draw_trails: Toggle) {
        self.config.draw_trails = draw_trails;
    }

    pub fn set_shader_options(&mut self, options: ShaderOptions) {
        self.config.shader_options = options;
    }

    /// Takes effect at the next frame, which fails if the record is invalid.
    /// Dimensions that no longer match the field fail frames until
    /// [`Simulation::resize_field`] is called.
    pub fn set_agent_data(&mut self, agent_data: AgentData) {
        self.config.apply_agent_data(&agent_data);
        self.agent_data = agent_data;
    }

    /// Reallocates the trail buffers to the current agent data dimensions.
    pub fn resize_field(&mut self) {
        let extent = FieldExtent::of(&self.agent_data);
        log::info!("reallocating trail field to {}x{}", extent.width, extent.height);
        self.trail = TrailField::new(extent);
        self.scratch = TrailField::new(extent);
        self.deposits = TrailField::new(extent);
        self.last_render = None;
    }

    /// Starts over with a new config, reallocating the agent buffer and field.
    pub fn restart(&mut self, config: SessionConfig) -> Result<()> {
        config.validate()?;
        self.agent_data = config.agent_data();
        self.palette = config.palette();
        self.agents = agents::spawn(&config, &mut agents::session_rng(&config));
        self.config = config;
        self.frame_num = 0;
        self.resize_field();
        Ok(())
    }

    pub fn frame(&mut self) -> Result<FramePlan> {
        config::check_agent_data(&self.agent_data, self.palette.len())?;
        self.trail.extent().check(&self.agent_data)?;

        let plan = FramePlan::for_config(&self.config);
        log::trace!("frame {}: {:?}", self.frame_num, plan.stages());

        for stage in plan.stages() {
            match *stage {
                Stage::UpdateAgents => {
                    self.deposits.clear();
                    self.stepper.step(
                        &mut self.agents,
                        StepContext {
                            agent_data: &self.agent_data,
                            shader_options: &self.config.shader_options,
                            palette: &self.palette,
                            trail: &self.trail,
                            deposits: &mut self.deposits,
                        },
                    );
                }
                Stage::DiffuseTrails => {
                    self.trail.diffuse_into(
                        &self.deposits,
                        &self.config.shader_options,
                        &mut self.scratch,
                    )?;
                    std::mem::swap(&mut self.trail, &mut self.scratch);
                }
                Stage::Render(source) => self.last_render = Some(source),
            }
        }

        self.frame_num += 1;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn small_config() -> SessionConfig {
        let mut config = SessionConfig {
            number_agents: 1000,
            seed: Some(11),
            ..Default::default()
        };
        config.agents.width = 512;
        config.agents.height = 512;
        config
    }

    fn drift(agents: &mut [Agent], ctx: StepContext<'_>) {
        for agent in agents.iter_mut() {
            agent.position.x += 1.0;
            agent.angle += ctx.agent_data.max_turn;
        }
    }

    fn deposit_in_place(agents: &mut [Agent], mut ctx: StepContext<'_>) {
        let width = ctx.trail.extent().width as usize;
        for agent in agents.iter() {
            if let Some(i) = ctx.trail.cell_index(agent.position) {
                let channel = agent.species(ctx.agent_data.number_species) as usize;
                assert!(channel < ctx.palette.len());
                if let Some(cell) = ctx.deposits.cell_mut((i % width) as u32, (i / width) as u32) {
                    cell[channel] = 1.0;
                }
            }
        }
    }

    #[test]
    fn plans_follow_the_flags() {
        let mut config = small_config();
        let plan = FramePlan::for_config(&config);
        assert_eq!(
            plan.stages(),
            &[
                Stage::UpdateAgents,
                Stage::DiffuseTrails,
                Stage::Render(RenderSource::Trails)
            ]
        );

        config.paused = Toggle::On;
        let plan = FramePlan::for_config(&config);
        assert_eq!(plan.stages(), &[Stage::Render(RenderSource::Trails)]);
        assert!(!plan.steps_simulation());

        config.draw_trails = Toggle::Off;
        assert_eq!(
            FramePlan::for_config(&config).render_source(),
            Some(RenderSource::Deposits)
        );
    }

    #[test]
    fn session_allocates_agents_and_field() {
        let sim = Simulation::new(small_config(), Frozen).unwrap();
        assert_eq!(sim.agents().len(), 1000);
        assert_eq!(sim.trail().cells().len(), 512 * 512);
        agents::verify(sim.agents(), 1000).unwrap();
    }

    #[test]
    fn paused_frame_only_renders() {
        let mut sim = Simulation::new(small_config(), drift).unwrap();
        sim.frame().unwrap();
        let before = sim.agents().to_vec();

        sim.set_paused(Toggle::On);
        let plan = sim.frame().unwrap();

        assert_eq!(plan.render_source(), Some(RenderSource::Trails));
        assert!(sim.displayed().is_some());
        for (a, b) in before.iter().zip(sim.agents()) {
            assert_eq!(a.position.x.to_bits(), b.position.x.to_bits());
            assert_eq!(a.position.y.to_bits(), b.position.y.to_bits());
            assert_eq!(a.angle.to_bits(), b.angle.to_bits());
        }

        sim.set_paused(Toggle::Off);
        sim.frame().unwrap();
        assert_ne!(sim.agents()[0].position, before[0].position);
    }

    #[test]
    fn zero_reduce_keeps_a_still_field() {
        let mut config = small_config();
        config.agents.width = 16;
        config.agents.height = 8;
        config.shader_options.reduce_amount = 0.0;
        config.shader_options.diffusion_amount = 0.0;
        let mut sim = Simulation::new(config, Frozen).unwrap();
        for (i, cell) in sim.trail_mut().cells_mut().iter_mut().enumerate() {
            *cell = [(i % 5) as f32 / 5.0; 4];
        }
        let before = sim.trail().clone();
        for _ in 0..5 {
            sim.frame().unwrap();
        }
        assert_eq!(sim.trail(), &before);
    }

    #[test]
    fn deposits_reach_the_trail() {
        let mut config = small_config();
        config.agents.width = 8;
        config.agents.height = 8;
        config.shader_options.reduce_amount = 0.0;
        config.shader_options.diffusion_amount = 0.0;
        let mut sim = Simulation::new(config, deposit_in_place).unwrap();
        sim.frame().unwrap();
        let lit = sim.trail().cells().iter().filter(|c| c.iter().any(|v| *v > 0.0)).count();
        assert!(lit > 0);

        sim.set_draw_trails(Toggle::Off);
        sim.frame().unwrap();
        assert!(std::ptr::eq(sim.displayed().unwrap(), &sim.deposits));
    }

    #[test]
    fn stale_dimensions_stop_the_frame() {
        let mut sim = Simulation::new(small_config(), Frozen).unwrap();
        let mut data = *sim.agent_data();
        data.width = 1024;
        sim.set_agent_data(data);
        assert!(matches!(sim.frame(), Err(Error::FieldSizeMismatch { .. })));

        sim.resize_field();
        sim.frame().unwrap();
        assert_eq!(sim.trail().cells().len(), 1024 * 512);
    }

    #[test]
    fn invalid_live_agent_data_stops_the_frame() {
        let mut config = small_config();
        config.number_agents = 8;
        config.agents.width = 8;
        config.agents.height = 8;
        let mut sim = Simulation::new(config, deposit_in_place).unwrap();

        let mut data = *sim.agent_data();
        data.number_species = 9;
        sim.set_agent_data(data);
        assert!(matches!(sim.frame(), Err(Error::InvalidConfig(_))));

        data.number_species = 3;
        data.max_turn = f32::NAN;
        sim.set_agent_data(data);
        assert!(matches!(sim.frame(), Err(Error::InvalidConfig(_))));

        data.max_turn = 0.25;
        sim.set_agent_data(data);
        sim.frame().unwrap();
        assert_eq!(sim.config().agents.max_turn, 0.25);
        assert_eq!(&sim.config().agent_data(), sim.agent_data());
    }

    #[test]
    fn restart_reallocates_agents() {
        let mut sim = Simulation::new(small_config(), Frozen).unwrap();
        sim.frame().unwrap();
        let mut config = small_config();
        config.number_agents = 250;
        sim.restart(config).unwrap();
        assert_eq!(sim.frame_num(), 0);
        agents::verify(sim.agents(), 250).unwrap();
    }
}
