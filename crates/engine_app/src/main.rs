//! # engine_app
//!
//! Runs an engine server on a fixed-rate frame loop until the tick limit is
//! reached, a feature requests quit, or a frame fails fatally.

mod demo;
mod tick;

use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use engine_component::Runtime;
use engine_server::{Server, ServerConfig, TimerFeature};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::tick::{TickConfig, TickLoop};

#[derive(Debug, Parser)]
#[command(name = "engine_app", about = "Run an engine server frame loop")]
struct Args {
    /// JSON server config. Falls back to `ENGINE_CONFIG`, then defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target frames per second.
    #[arg(long, default_value_t = 60.0)]
    tick_rate: f64,

    /// Stop after this many frames (0 = run until quit is requested).
    #[arg(long, default_value_t = 0)]
    ticks: u64,

    /// Start without the demo scene.
    #[arg(long)]
    no_demo: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("engine_app=info".parse()?)
                .add_directive("engine_server=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(args.config.as_deref()).context("loading server config")?;

    let runtime = Runtime::new()?;
    demo::register(&runtime)?;
    let server = Server::new(&runtime, config)?;
    if server.get_feature::<TimerFeature>().is_none() {
        server.add_feature(TimerFeature::default())?;
    }
    if !args.no_demo {
        demo::populate(&server)?;
    }

    info!(
        server = server.name(),
        features = server.features().len(),
        scenes = server.scenes().len(),
        "server starting"
    );
    server.set_active(true)?;

    let mut tick_loop = TickLoop::new(TickConfig {
        tick_rate: args.tick_rate,
        max_ticks: args.ticks,
    });
    let result = tick_loop.run(|_| {
        server.update()?;
        Ok(if server.is_quit_requested() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    });

    server.shutdown();
    let ticks = result?;
    info!(ticks, "server stopped");
    Ok(())
}
