use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "calbridge",
    version,
    about = "Two-way task and routine sync with Google Calendar"
)]
struct Cli {
    /// User whose link and data the command acts on
    #[arg(long, global = true, env = "CALBRIDGE_USER", default_value = "default")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calendar connection management
    Auth {
        #[command(subcommand)]
        action: commands::auth::AuthAction,
    },
    /// Run or inspect synchronization
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },
    /// Push individual tasks
    Task {
        #[command(subcommand)]
        action: commands::task::TaskAction,
    },
    /// Push or refresh routines
    Routine {
        #[command(subcommand)]
        action: commands::task::RoutineAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Run the background sync loops until interrupted
    Daemon,
    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("calbridge=info,calbridge_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let user = cli.user;
    let result = match cli.command {
        Commands::Auth { action } => commands::auth::run(&user, action),
        Commands::Sync { action } => commands::sync::run(&user, action),
        Commands::Task { action } => commands::task::run(&user, action),
        Commands::Routine { action } => commands::task::run_routine(&user, action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Daemon => commands::sync::daemon(),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "calbridge", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
