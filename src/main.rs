use std::{env, process};

use slime_layout::constants::DEFAULT_FRAMES;
use slime_layout::{shader, SessionConfig, SCHEMA_REVISION};

fn run() -> slime_layout::Result<()> {
    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let frames = match args.next() {
        Some(raw) => raw.parse().map_err(|_| {
            slime_layout::Error::InvalidConfig(format!("frame count `{}` is not a number", raw))
        })?,
        None => DEFAULT_FRAMES,
    };

    config.validate()?;
    log::info!(
        "schema revision {}: {} agents on a {}x{} field, {} species",
        SCHEMA_REVISION,
        config.number_agents,
        config.agents.width,
        config.agents.height,
        config.species.len()
    );

    pollster::block_on(shader::run_headless(&config, frames))
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        log::error!("{}", err);
        process::exit(1);
    }
}
