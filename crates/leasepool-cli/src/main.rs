use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "leasepool",
    about = "leasepool — fixed-size database connection pool",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a leasepool.toml and print the resolved settings
    Check {
        #[arg(short, long, default_value = "leasepool.toml")]
        config: String,
    },
    /// Write a scaffold leasepool.toml
    Init {
        #[arg(short, long, default_value = "leasepool.toml")]
        path: String,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Drive the pool with concurrent workers against a live server.
    ///
    /// Each worker loops acquire → probe → hold → release until the
    /// duration elapses. Final pool statistics are printed as JSON.
    Soak {
        #[arg(short, long, default_value = "leasepool.toml")]
        config: String,
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        /// How long to run, e.g. "10s"
        #[arg(short, long, default_value = "10s")]
        duration: String,
        /// How long each worker keeps a lease, e.g. "50ms"
        #[arg(long, default_value = "50ms")]
        hold: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("leasepool=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => commands::check::check(&config),
        Commands::Init { path, force } => commands::init::init(&path, force),
        Commands::Soak {
            config,
            workers,
            duration,
            hold,
        } => commands::soak::soak(&config, workers, &duration, &hold),
    }
}
