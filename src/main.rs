use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Drives a code-editing worker CLI across git worktrees")]
pub struct Cli {
    /// Tee worker output to the terminal as well as the job log.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one job for a user task.
    Run {
        /// The user task, in natural language.
        task: String,

        /// Repository to operate on (default: ORCHESTRATOR_BASE_DIR or cwd).
        #[arg(long)]
        repo_root: Option<PathBuf>,

        /// Base branch to plan and branch from.
        #[arg(long)]
        base_branch: Option<String>,

        /// Explicit job id (default: job-YYYYMMDD-HHMMSS).
        #[arg(long)]
        job_id: Option<String>,

        /// Push the result branch to origin after a successful merge.
        #[arg(long)]
        push_result: bool,

        /// Run the analyze + refactor pair before planning.
        #[arg(long)]
        prefactor: bool,
    },
    /// Serve the dashboard snapshot and stream API.
    Serve {
        /// Port to listen on (default: DASHBOARD_PORT or 4179).
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a queue of tasks, one job each, in order.
    Dispatch {
        /// Tasks to run, in order.
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Repository to operate on.
        #[arg(long)]
        repo_root: Option<PathBuf>,

        /// Base branch to plan and branch from.
        #[arg(long)]
        base_branch: Option<String>,

        /// Push each result branch to origin on success.
        #[arg(long)]
        push_result: bool,

        /// Run the analyze + refactor pair before planning.
        #[arg(long)]
        prefactor: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run {
            task,
            repo_root,
            base_branch,
            job_id,
            push_result,
            prefactor,
        } => {
            cmd::run::execute(
                &task,
                conductor::JobOptions {
                    repo_root,
                    base_branch,
                    job_id,
                    push_result,
                    enable_prefactor: prefactor,
                    verbose_log: cli.verbose,
                },
            )
            .await
        }
        Commands::Serve { port } => cmd::serve::execute(port).await,
        Commands::Dispatch {
            tasks,
            repo_root,
            base_branch,
            push_result,
            prefactor,
        } => {
            cmd::dispatch::execute(
                tasks,
                conductor::JobOptions {
                    repo_root,
                    base_branch,
                    job_id: None,
                    push_result,
                    enable_prefactor: prefactor,
                    verbose_log: cli.verbose,
                },
            )
            .await
        }
    }
}
