use anyhow::Result;
use clap::{Parser, Subcommand};
use hookpoll_core::SourceType;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hookpoll")]
#[command(about = "Poll webhook deliveries and forward new ones to the manager")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "HOOKPOLL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one poll-and-publish tick for every enabled target (or just one).
    Tick {
        #[arg(long)]
        target: Option<String>,
    },
    /// Poll every enabled target on its interval until ctrl-c.
    Run,
    /// List source types and whether a built-in implementation exists.
    Sources,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command.unwrap_or(Commands::Tick { target: None }) {
        Commands::Tick { target } => {
            let outcomes = hookpoll_executor::tick_once_from_env(target.as_deref()).await?;
            let mut failed = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(result) => println!(
                        "{}: {} {}",
                        outcome.target_id, result.status_code, result.message
                    ),
                    Err(err) => {
                        failed += 1;
                        println!("{}: error {}", outcome.target_id, err);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} targets could not be polled", outcomes.len());
            }
        }
        Commands::Run => {
            hookpoll_executor::run_from_env().await?;
        }
        Commands::Sources => {
            for source_type in SourceType::ALL {
                let builtin = hookpoll_sources::has_builtin_source(source_type);
                println!(
                    "{source_type}\t{}",
                    if builtin { "built-in" } else { "unsupported" }
                );
            }
        }
    }

    Ok(())
}
