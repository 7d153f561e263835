use anyhow::{Context, Result};
use clap::Parser;

use prism_arena::cli::{self, App, Cli};
use prism_arena::{logging, AppConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path()?,
    };
    let config = AppConfig::load(&config_path)?;
    logging::init(config.log_level());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("创建 tokio 运行时失败")?;

    let app = App::open(config)?;
    runtime.block_on(cli::run(cli, &app))
}
