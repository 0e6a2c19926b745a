use clap::Parser;
use foreman::cli::{Cli, Command};
use foreman::commands;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("FOREMAN_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Start {
            spec_path,
            checkpoint_every,
            max_hours,
            config,
            reviewers,
            no_review,
            review_block_high,
            swarm,
            max_agents,
            min_tasks,
            dry_run,
        } => {
            commands::start(commands::StartOpts {
                spec_path,
                checkpoint_every,
                max_hours,
                config,
                reviewers,
                no_review,
                review_block_high,
                swarm,
                max_agents,
                min_tasks,
                dry_run,
            })
            .await
        }
        Command::Work {
            issue_id,
            create,
            model,
            config,
            full_context,
            dry_run,
        } => {
            commands::work(commands::WorkOpts {
                issue_id,
                create,
                model,
                config,
                full_context,
                dry_run,
            })
            .await
        }
        Command::Pause { reason, run_id } => commands::pause(reason, run_id),
        Command::Resume { run_id, dry_run } => commands::resume(run_id, dry_run).await,
        Command::Status { run_id } => commands::status(run_id),
        Command::Stop => commands::stop(),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}
