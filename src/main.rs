use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use shadow_stream::{
    app::{load_config, Config},
    cli::{apply_overrides, handle_command, Cli},
    utils::init_logger,
};

// No #[tokio::main]: the worker runtime owns its own event loop thread
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        // An explicitly named file must load
        Err(e) if cli.config.is_some() => return Err(e),
        Err(e) => {
            eprintln!("{} Failed to load config: {}. Using defaults.", "[WARNING]".yellow(), e);
            Config::default()
        }
    };
    apply_overrides(&mut config, &cli);

    handle_command(&cli, config)
}
