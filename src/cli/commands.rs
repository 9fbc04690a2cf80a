use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

use crate::{
    app::{get_config_dir, init_config, save_config, Config},
    backend::{DirectoryConnector, ObjectRef},
    cache::{self, CacheSettings, CacheStore},
    constants::GIB,
    proxy::is_gateway_running,
    runtime::{Operation, OperationOutput, WorkerRuntime},
    utils::{format_retention, format_size},
};

use super::{CacheAction, Cli, Commands};

/// Fold command line flags over the loaded configuration
pub fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(root) = &cli.media_root {
        config.backend.media_root = root.clone();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache.directory = Some(dir.clone());
    }
}

/// Handle CLI subcommands
pub fn handle_command(cli: &Cli, config: Config) -> Result<()> {
    match &cli.command {
        None | Some(Commands::Serve) => serve(&config, None),
        Some(Commands::Url {
            chat_id,
            message_id,
        }) => serve(&config, Some(ObjectRef::new(*chat_id, *message_id))),
        Some(Commands::Cache { action }) => handle_cache(action, config, cli.config.as_deref()),
        Some(Commands::Init) => {
            println!("Initializing shadow-stream configuration...");
            let (path, created) = init_config(cli.config.clone())?;
            if created {
                println!("Created default configuration at: {}", path.display());
            } else {
                println!("Configuration already exists at: {}", path.display());
            }
            Ok(())
        }
        Some(Commands::Status) => show_status(&config),
        Some(Commands::Version) => {
            show_version();
            Ok(())
        }
    }
}

/// Show version information
pub fn show_version() {
    println!("shadow-stream v{}", env!("CARGO_PKG_VERSION"));
    println!("   Pull-through streaming cache for chat media");
}

/// Start the runtime, optionally print one stream URL, then block until Ctrl-C
fn serve(config: &Config, object: Option<ObjectRef>) -> Result<()> {
    let cache = Arc::new(cache::init(&config.cache).context("Failed to open cache")?);
    let connector = Arc::new(DirectoryConnector::new(
        config.backend.media_root.clone(),
        config.backend.session_path.clone(),
    ));
    let runtime = WorkerRuntime::new(config, connector, cache);

    let base_url = runtime.start().context("Failed to start streaming runtime")?;
    println!("{} Gateway listening on {}", "[OK]".green(), base_url.cyan());
    println!("   Media root: {}", config.backend.media_root.display());

    if let Some(object) = object {
        match runtime.call(Operation::PrepareStream { object }, config.runtime.startup_timeout()) {
            Ok(OperationOutput::Stream(handle)) => {
                println!("{}", handle.url);
                if !handle.front_loaded {
                    println!(
                        "{} Metadata is at the end of the file; playback may take a moment to start",
                        "[WARNING]".yellow()
                    );
                }
            }
            Ok(other) => anyhow::bail!("Unexpected result: {:?}", other),
            Err(e) => {
                runtime.stop();
                anyhow::bail!("Failed to prepare stream for {}: {}", object, e);
            }
        }
    }

    println!("Press Ctrl-C to stop");
    wait_for_ctrl_c()?;

    println!("Stopping...");
    runtime.stop();
    Ok(())
}

fn wait_for_ctrl_c() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(tokio::signal::ctrl_c())
        .context("Failed to listen for Ctrl-C")
}

fn handle_cache(action: &CacheAction, mut config: Config, config_path: Option<&Path>) -> Result<()> {
    let store = cache::init(&config.cache).context("Failed to open cache")?;

    match action {
        CacheAction::Stats => print_stats(&store)?,
        CacheAction::Cleanup => {
            let freed = store.cleanup()?;
            println!("Freed {}", format_size(freed as i64).green());
        }
        CacheAction::Clear => {
            let freed = store.clear_all()?;
            println!("Cleared cache, freed {}", format_size(freed as i64).green());
        }
        CacheAction::Limits => print_limits(&store)?,
        CacheAction::Set {
            limit_gb,
            retention,
            auto_cleanup,
        } => {
            let current = store.settings();
            let size_limit_bytes = match limit_gb {
                Some(gb) => gb
                    .checked_mul(GIB)
                    .with_context(|| format!("Size limit of {} GB is too large", gb))?,
                None => current.size_limit_bytes,
            };
            let settings = CacheSettings {
                size_limit_bytes,
                retention_seconds: retention
                    .map(|r| r.seconds())
                    .unwrap_or(current.retention_seconds),
                auto_cleanup_enabled: auto_cleanup.unwrap_or(current.auto_cleanup_enabled),
            };
            let freed = store.update_settings(settings)?;

            config.cache.size_limit_bytes = settings.size_limit_bytes;
            config.cache.retention_seconds = settings.retention_seconds;
            config.cache.auto_cleanup_enabled = settings.auto_cleanup_enabled;
            save_config(&config, config_path.map(Path::to_path_buf))?;

            println!("{} Cache settings updated", "[OK]".green());
            println!("   Limit:     {}", format_size(settings.size_limit_bytes as i64));
            println!("   Retention: {}", format_retention(settings.retention_seconds));
            if freed > 0 {
                println!("   Freed:     {}", format_size(freed as i64));
            }
        }
    }
    Ok(())
}

fn print_stats(store: &CacheStore) -> Result<()> {
    let stats = store.stats()?;
    let settings = store.settings();

    println!("Cache: {}", store.root().display());
    println!("  Files:     {}", stats.file_count);
    println!(
        "  Used:      {} of {} ({:.1}%)",
        format_size(stats.total_size as i64),
        format_size(stats.size_limit as i64),
        stats.usage_percent
    );
    println!("  Retention: {}", format_retention(settings.retention_seconds));
    println!(
        "  Cleanup:   {}",
        if settings.auto_cleanup_enabled { "automatic" } else { "manual" }
    );
    Ok(())
}

fn print_limits(store: &CacheStore) -> Result<()> {
    let disk = store.get_disk_info()?;
    println!(
        "Disk: {} free of {} ({:.1}% free), {} usable for cache",
        format_size(disk.free as i64),
        format_size(disk.total as i64),
        disk.free_percent(),
        format_size(disk.available_for_cache() as i64)
    );

    for tier in store.get_available_size_limits()? {
        if tier.enabled {
            println!("  {} {}", "•".green(), tier.label);
        } else {
            println!("  {} {} (not enough space)", "•".dimmed(), tier.label.dimmed());
        }
    }
    Ok(())
}

/// Show configuration, cache and gateway status
fn show_status(config: &Config) -> Result<()> {
    println!("shadow-stream Status:");
    println!();

    match get_config_dir() {
        Ok(dir) => {
            let path = dir.join("config.toml");
            if path.exists() {
                println!("  [OK] Configuration: {}", path.display());
            } else {
                println!("  [WARNING] Configuration: Not found (using defaults)");
            }
        }
        Err(e) => println!("  [WARNING] Configuration: {}", e),
    }

    let root = &config.backend.media_root;
    if root.is_dir() {
        println!("  [OK] Media root: {}", root.display());
    } else {
        println!("  [ERROR] Media root: {} is not a directory", root.display());
    }

    match cache::init(&config.cache) {
        Ok(store) => {
            let stats = store.stats()?;
            println!(
                "  [OK] Cache: {} files, {} of {}",
                stats.file_count,
                format_size(stats.total_size as i64),
                format_size(stats.size_limit as i64)
            );
        }
        Err(e) => println!("  [ERROR] Cache: {}", e),
    }

    let base_url = format!("http://{}:{}", config.gateway.host, config.gateway.port);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if config.gateway.port != 0 && rt.block_on(is_gateway_running(&base_url)) {
        println!("  [OK] Gateway: Running at {}", base_url);
    } else {
        println!("  [WARNING] Gateway: Not running");
    }

    println!();
    Ok(())
}
