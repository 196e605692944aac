use std::f32::consts::FRAC_PI_2;

use cgmath::{InnerSpace, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::layout::Agent;

/// Rng for a new session; seeded when the config asks for reproducible runs.
pub fn session_rng(config: &SessionConfig) -> StdRng {
    match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Creates the whole agent buffer. Agents start uniformly inside the largest
/// disc centred on the field, heading along the tangent of that disc.
pub fn spawn<R: Rng + ?Sized>(config: &SessionConfig, rng: &mut R) -> Vec<Agent> {
    let width = config.agents.width;
    let height = config.agents.height;

    let radius = (width.min(height) / 2) as f32;
    let centre = Vector2::new((width / 2) as f32, (height / 2) as f32);
    let field_centre = Vector2::new(width as f32 / 2.0, height as f32 / 2.0);

    let agents: Vec<Agent> = (0..config.number_agents)
        .map(|i| {
            let offset = loop {
                let candidate = Vector2::new(
                    rng.gen_range(-radius..=radius),
                    rng.gen_range(-radius..=radius),
                );
                if candidate.magnitude() <= radius {
                    break candidate;
                }
            };
            let position = centre + offset;
            let heading = position - field_centre;

            Agent {
                position: position.into(),
                angle: heading.y.atan2(heading.x) - FRAC_PI_2,
                index: i as i32,
                #[cfg(feature = "per-agent-velocity")]
                velocity: config.agents.velocity,
                #[cfg(feature = "per-agent-velocity")]
                _padding: 0,
            }
        })
        .collect();

    log::info!(
        "spawned {} agents in a disc of radius {} on a {}x{} field",
        agents.len(),
        radius,
        width,
        height
    );
    agents
}

/// Checks the buffer length and that every agent sits in the slot its index names.
pub fn verify(agents: &[Agent], expected: usize) -> Result<()> {
    if agents.len() != expected {
        return Err(Error::AgentCountMismatch {
            expected,
            actual: agents.len(),
        });
    }
    match agents
        .iter()
        .enumerate()
        .find(|(slot, agent)| agent.index as i64 != *slot as i64)
    {
        Some((slot, agent)) => Err(Error::AgentIndexMismatch {
            slot,
            index: agent.index,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(number_agents: u32, width: u32, height: u32) -> SessionConfig {
        let mut config = SessionConfig {
            number_agents,
            seed: Some(7),
            ..Default::default()
        };
        config.agents.width = width;
        config.agents.height = height;
        config
    }

    #[test]
    fn index_matches_slot() {
        let config = config(1000, 512, 512);
        let agents = spawn(&config, &mut session_rng(&config));
        assert_eq!(agents.len(), 1000);
        for (i, agent) in agents.iter().enumerate() {
            assert_eq!(agent.index, i as i32);
        }
        verify(&agents, 1000).unwrap();
    }

    #[test]
    fn agents_start_inside_the_disc() {
        let config = config(500, 300, 200);
        let agents = spawn(&config, &mut session_rng(&config));
        for agent in &agents {
            let dx = agent.position.x - 150.0;
            let dy = agent.position.y - 100.0;
            assert!((dx * dx + dy * dy).sqrt() <= 100.0 + 1e-3);
        }
    }

    #[test]
    fn heading_is_tangential() {
        let config = config(50, 400, 400);
        for agent in spawn(&config, &mut session_rng(&config)) {
            let dx = agent.position.x - 200.0;
            let dy = agent.position.y - 200.0;
            if dx.hypot(dy) < 1.0 {
                continue;
            }
            // heading is perpendicular to the radius
            let dot = dx * agent.angle.cos() + dy * agent.angle.sin();
            assert!(dot.abs() / dx.hypot(dy) < 1e-3, "dot {}", dot);
        }
    }

    #[test]
    fn seeded_sessions_repeat() {
        let config = config(64, 128, 128);
        let a = spawn(&config, &mut session_rng(&config));
        let b = spawn(&config, &mut session_rng(&config));
        assert_eq!(a, b);
    }

    #[test]
    fn single_cell_field_spawns_at_origin() {
        let config = config(3, 1, 1);
        let agents = spawn(&config, &mut session_rng(&config));
        assert!(agents.iter().all(|a| a.position.x == 0.0 && a.position.y == 0.0));
    }

    #[test]
    fn verify_catches_drift() {
        let config = config(10, 64, 64);
        let mut agents = spawn(&config, &mut session_rng(&config));
        assert!(matches!(
            verify(&agents, 11),
            Err(Error::AgentCountMismatch { expected: 11, actual: 10 })
        ));
        agents.swap(2, 5);
        assert!(matches!(
            verify(&agents, 10),
            Err(Error::AgentIndexMismatch { slot: 2, index: 5 })
        ));
    }

    #[cfg(feature = "per-agent-velocity")]
    #[test]
    fn velocity_is_per_agent() {
        let mut config = config(4, 64, 64);
        config.agents.velocity = 2.5;
        let agents = spawn(&config, &mut session_rng(&config));
        assert!(agents.iter().all(|a| a.velocity == 2.5));
    }
}
