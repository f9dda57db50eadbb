//! Rein CLI — run, inspect and control workflow tasks.
//!
//! All engine behavior lives in rein-core; this binary parses arguments,
//! loads configuration and prints results.

use clap::{Parser, Subcommand};
use rein_cli::commands;

/// Rein — multi-agent workflow runner
#[derive(Parser)]
#[command(name = "rein", version, about = "Rein — multi-agent workflow runner")]
pub struct Cli {
    /// Directory holding specialists/, teams/ and tasks/
    #[arg(long, global = true, env = "REIN_AGENTS_DIR")]
    agents_dir: Option<String>,

    /// Directory for task directories (default: <agents-dir>/tasks)
    #[arg(long, global = true, env = "REIN_TASKS_DIR")]
    tasks_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow, or resume an earlier task
    Run {
        /// Path to the workflow YAML file
        workflow: String,
        /// Task input as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Read the task input from a JSON file
        #[arg(long)]
        input_file: Option<String>,
        /// Maximum number of blocks running at once
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Resume the given task id instead of starting a new task
        #[arg(long)]
        resume: Option<String>,
        /// What to do with blocks interrupted mid-run: rerun, mark-failed, manual
        #[arg(long)]
        resume_policy: Option<String>,
        /// Do not open a control socket
        #[arg(long)]
        no_socket: bool,
        /// Print the last block's result when the task completes
        #[arg(long)]
        print_final: bool,
    },

    /// Validate a workflow file and show its phases
    Validate {
        /// Path to the workflow YAML file
        workflow: String,
    },

    /// Show a task's block states from its database
    Status {
        /// Task id
        task_id: String,
    },

    /// Send a control command to a running task
    Control {
        /// Task id
        task_id: String,
        /// status | list | pause | resume | cancel | pause <block> | resume <block> | cancel <block> | log <block>
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// List task directories, newest first
    Tasks,

    /// List available specialists
    Specialists,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rein_core=warn,rein_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Some(command) => {
            match commands::load_config(cli.agents_dir.as_deref(), cli.tasks_dir.as_deref()) {
                Ok(config) => match command {
                    Commands::Run {
                        workflow,
                        input,
                        input_file,
                        max_parallel,
                        resume,
                        resume_policy,
                        no_socket,
                        print_final,
                    } => {
                        let opts = commands::run::RunOptions {
                            workflow,
                            input,
                            input_file,
                            max_parallel,
                            resume,
                            resume_policy,
                            no_socket,
                            print_final,
                        };
                        commands::run::run(config, opts).await
                    }
                    Commands::Validate { workflow } => {
                        commands::workflow::validate(&config, &workflow)
                    }
                    Commands::Status { task_id } => {
                        commands::status::status(&config, &task_id).await
                    }
                    Commands::Control { task_id, command } => {
                        commands::control::control(&config, &task_id, &command).await
                    }
                    Commands::Tasks => commands::status::tasks(&config),
                    Commands::Specialists => commands::workflow::specialists(&config),
                },
                Err(e) => Err(e),
            }
        }
        None => {
            // No subcommand: show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
