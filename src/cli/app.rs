// ABOUTME: Main application orchestration for the agentflow CLI
// ABOUTME: Coordinates between CLI arguments, configuration, logging and command execution

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use super::commands;
use super::{Args, Commands, Config};

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self, verbose: bool, no_color: bool) -> Result<()> {
        let log_level = if verbose {
            "debug"
        } else {
            &self.config.logging.level
        };

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let installed = match self.config.logging.format.as_str() {
            "compact" => tracing_subscriber::fmt()
                .compact()
                .with_env_filter(env_filter)
                .with_ansi(!no_color)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init(),
            _ => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(!no_color)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init(),
        };
        installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

        debug!("Logging initialized with level: {}", log_level);
        Ok(())
    }

    /// Run the application with parsed arguments
    pub async fn run(&mut self, args: Args) -> Result<()> {
        self.init_logging(args.verbose, args.no_color)?;

        info!("Starting agentflow v{}", env!("CARGO_PKG_VERSION"));
        debug!("Configuration loaded from: {:?}", args.config);

        match args.command {
            Commands::Run {
                workflow,
                input,
                input_json,
                vars,
                dry_run,
                output,
                max_concurrent,
            } => {
                let overrides = Args::parse_variables(&vars)?;
                if let Some(max) = max_concurrent {
                    self.config.max_concurrent_steps = max;
                }
                let input = commands::load_input(input, input_json).await?;
                commands::run_workflow(workflow, input, overrides, dry_run, output, &self.config)
                    .await
            }

            Commands::Validate { workflow, strict } => {
                commands::validate_workflow(workflow, strict, &self.config).await
            }

            Commands::Graph { workflow } => commands::print_graph(workflow, &self.config).await,

            Commands::Init { name, output_dir } => commands::init_workflow(name, output_dir).await,
        }
    }

    /// Create application and parse arguments from the command line
    pub fn from_args() -> Result<(Self, Args)> {
        let args = Args::parse_args();
        let config = Config::load(args.config.clone())?;
        Ok((Self::new(config), args))
    }
}
