use anyhow::Result;
use depth_spade::{common::*, config};
use std::env;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Builds the depth-conditioned generators and runs them on a random input.
pub struct Args {
    #[structopt(long, default_value = "config.json5")]
    pub config: PathBuf,
    /// Save the initialized weights to this file.
    #[structopt(long)]
    pub output: Option<PathBuf>,
}

fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        let filter = if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        };
        filter
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse config
    let Args { config, output } = Args::from_args();
    let config = config::Config::load(&config)?;

    depth_spade::start(config, output.as_deref())?;

    Ok(())
}
