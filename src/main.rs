use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gbos::commands;
use gbos::config::Config;
use gbos::driver::DriverOptions;
use gbos::logging;

#[derive(Parser)]
#[command(name = "gbos")]
#[command(about = "Autonomous coding-agent orchestrator for the gbos control plane")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new orchestration run
    Start {
        /// Agent to drive (claude-code, codex, gemini)
        #[arg(long)]
        agent: Option<String>,

        /// Skip the agent's interactive confirmations
        #[arg(long, overrides_with = "no_auto_approve")]
        auto_approve: bool,
        #[arg(long, hide = true)]
        no_auto_approve: bool,

        /// Open a merge request after pushing
        #[arg(long = "mr", overrides_with = "no_mr")]
        mr: bool,
        #[arg(long = "no-mr", hide = true)]
        no_mr: bool,

        /// Keep fetching tasks until the queue is empty
        #[arg(long)]
        continuous: bool,

        /// Stop after this many tasks
        #[arg(long)]
        max_tasks: Option<u32>,

        /// Explicit working directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Fetch this specific task first
        #[arg(long)]
        task_id: Option<String>,

        /// Skip test verification
        #[arg(long)]
        skip_verification: bool,

        /// Skip commit/push/MR
        #[arg(long)]
        skip_git: bool,

        /// Print the rendered prompt before the agent starts
        #[arg(long)]
        show_prompt: bool,

        /// Model override passed to the agent
        #[arg(long)]
        model: Option<String>,
    },

    /// Continue a paused or interrupted run
    Resume {
        /// Run to resume (defaults to the newest non-terminal run)
        #[arg(long)]
        run_id: Option<String>,

        /// Open a merge request after pushing
        #[arg(long = "mr", overrides_with = "no_mr")]
        mr: bool,
        #[arg(long = "no-mr", hide = true)]
        no_mr: bool,

        /// Print the rendered prompt before the agent starts
        #[arg(long)]
        show_prompt: bool,
    },

    /// Close an open run
    Stop {
        /// Run to stop (defaults to the newest non-terminal run)
        #[arg(long)]
        run_id: Option<String>,

        /// Mark the run failed instead of paused
        #[arg(long)]
        force: bool,
    },

    /// List recent runs
    Runs {
        /// Number of runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn driver_options(
    config: &Config,
    agent: Option<String>,
    auto_approve: bool,
    no_auto_approve: bool,
    mr: bool,
    no_mr: bool,
) -> DriverOptions {
    DriverOptions {
        agent: agent.unwrap_or_else(|| config.agent.vendor.clone()),
        auto_approve: if auto_approve {
            true
        } else if no_auto_approve {
            false
        } else {
            config.agent.auto_approve
        },
        create_merge_request: if mr {
            true
        } else if no_mr {
            false
        } else {
            config.git.create_merge_request
        },
        model: config.agent.model.clone(),
        max_turns: config.agent.max_turns,
        ..DriverOptions::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    // Driver commands log to file so the terminal carries agent output
    let is_driver = matches!(cli.command, Commands::Start { .. } | Commands::Resume { .. });
    let _logging = logging::init_logging(&config, is_driver, cli.debug)?;

    let exit_code = match cli.command {
        Commands::Start {
            agent,
            auto_approve,
            no_auto_approve,
            mr,
            no_mr,
            continuous,
            max_tasks,
            dir,
            task_id,
            skip_verification,
            skip_git,
            show_prompt,
            model,
        } => {
            let mut options =
                driver_options(&config, agent, auto_approve, no_auto_approve, mr, no_mr);
            options.continuous = continuous;
            if let Some(max_tasks) = max_tasks {
                options.max_tasks = max_tasks;
            }
            options.explicit_dir = dir;
            options.task_id = task_id;
            options.skip_verification = skip_verification;
            options.skip_git = skip_git;
            if model.is_some() {
                options.model = model;
            }
            commands::cmd_start(config, options, show_prompt).await?
        }

        Commands::Resume {
            run_id,
            mr,
            no_mr,
            show_prompt,
        } => {
            let options = driver_options(&config, None, false, false, mr, no_mr);
            commands::cmd_resume(config, options, run_id.as_deref(), show_prompt).await?
        }

        Commands::Stop { run_id, force } => {
            commands::cmd_stop(&config, run_id.as_deref(), force).await?
        }

        Commands::Runs { limit } => commands::cmd_runs(&config, limit)?,
    };

    std::process::exit(exit_code);
}
