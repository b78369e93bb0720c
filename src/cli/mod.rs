//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the
//! appropriate commands. `serve` is the default and runs an MCP session
//! over stdin/stdout.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::core::config::Config;
use crate::engine::process::ProcessEngine;
use crate::engine::BuildEngine;
use crate::logging;
use crate::mcp::registry::CapabilityRegistry;
use crate::mcp::server::run_stdio;

#[derive(Parser)]
#[command(name = "chantier")]
#[command(about = "Expose a build tool's goals and targets to MCP clients")]
#[command(
    long_about = "Chantier speaks the Model Context Protocol over stdin/stdout and adapts a \
build tool behind it: configured goals become callable tools, discovered \
targets become readable resources.\n\n\
Environment Variables:\n\
  CHANTIER_LOG      Log filter for diagnostics on stderr (default: info)\n\n\
Configuration lives in config.toml in the platform config directory; see\n\
the [engine] table for the build tool command and goal list."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to an alternate configuration file
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve MCP over stdin/stdout (default)
    Serve,
    /// Print the tools the server would expose, then exit
    Goals,
    /// Print the resources the server would expose, then exit
    Targets,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    logging::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let config = Arc::new(config);
    let engine: Arc<dyn BuildEngine> = Arc::new(ProcessEngine::from_config(&config.engine));

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            run_stdio(engine, config).await;
            Ok(())
        }
        Commands::Goals => {
            let registry =
                CapabilityRegistry::build(engine.as_ref(), config.tool_prefix()).await?;
            if registry.tools().is_empty() {
                println!("No goals configured.");
            } else {
                println!("Tools:");
                for tool in registry.tools() {
                    match &tool.descriptor.description {
                        Some(description) => {
                            println!("- {} ({description})", tool.descriptor.name)
                        }
                        None => println!("- {}", tool.descriptor.name),
                    }
                }
            }
            Ok(())
        }
        Commands::Targets => {
            let registry =
                CapabilityRegistry::build(engine.as_ref(), config.tool_prefix()).await?;
            if registry.resources().is_empty() {
                println!("No targets discovered.");
            } else {
                println!("Resources:");
                for resource in registry.resources() {
                    println!("- {}", resource.descriptor.uri);
                }
            }
            Ok(())
        }
    }
}
