// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the main CLI structure and subcommands for agentflow

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(about = "Run declarative agent workflows: compile step graphs and drive them to completion")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow definition with the built-in echo executors
    Run {
        #[arg(help = "Path to workflow JSON or YAML file")]
        workflow: PathBuf,

        #[arg(long, help = "File holding the run input as JSON", conflicts_with = "input_json")]
        input: Option<PathBuf>,

        #[arg(long, help = "Run input as an inline JSON document")]
        input_json: Option<String>,

        #[arg(
            short = 'V',
            long = "var",
            help = "Override workflow variables (key=value)"
        )]
        vars: Vec<String>,

        #[arg(long, help = "Compile and validate without executing")]
        dry_run: bool,

        #[arg(short, long, help = "Write the final execution snapshot to this file")]
        output: Option<PathBuf>,

        #[arg(long, help = "Maximum number of concurrently running steps")]
        max_concurrent: Option<usize>,
    },

    /// Validate a workflow file without executing
    Validate {
        #[arg(help = "Path to workflow JSON or YAML file")]
        workflow: PathBuf,

        #[arg(long, help = "Treat expression syntax problems as errors")]
        strict: bool,
    },

    /// Print the compiled step graph as tagged edges
    Graph {
        #[arg(help = "Path to workflow JSON or YAML file")]
        workflow: PathBuf,
    },

    /// Initialize a new workflow file
    Init {
        #[arg(help = "Name of the workflow to create")]
        name: String,

        #[arg(short, long, help = "Output directory", default_value = ".")]
        output_dir: PathBuf,
    },
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parse variables from key=value format; values that parse as JSON keep their type
    pub fn parse_variables(vars: &[String]) -> anyhow::Result<Map<String, Value>> {
        let mut variables = Map::new();

        for var in vars {
            if let Some((key, value)) = var.split_once('=') {
                let value = serde_json::from_str(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                variables.insert(key.to_string(), value);
            } else {
                return Err(anyhow::anyhow!(
                    "Invalid variable format '{}'. Expected 'key=value'",
                    var
                ));
            }
        }

        Ok(variables)
    }
}
