//! dlq CLI - download queue manager
//!
//! Enqueue, inspect and remove downloads, run the transfer engine in the
//! foreground, or make raw bridge calls with JSON arguments.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// dlq - Download Queue Manager
#[derive(Parser)]
#[command(name = "dlq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for dlq
    #[arg(long, env = "DLQ_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Notification behaviour of a download
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum NotifyArg {
    /// While running only
    Visible,
    /// While running and after completion
    VisibleNotifyCompleted,
    /// Never
    Hidden,
    /// After completion only
    OnlyCompletion,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a new download
    #[command(group(ArgGroup::new("destination").args(["files_dir", "public_dir", "dest"])))]
    #[command(group(ArgGroup::new("directory").args(["files_dir", "public_dir"])))]
    Add {
        /// URL to download
        url: String,

        /// Title shown in listings and notifications
        #[arg(short, long)]
        title: Option<String>,

        /// Description
        #[arg(short, long)]
        description: Option<String>,

        /// MIME type to record
        #[arg(long)]
        mime_type: Option<String>,

        /// Save under the app files directory, in this directory type
        #[arg(long, value_name = "DIR_TYPE")]
        files_dir: Option<String>,

        /// Save under the public downloads directory, in this directory type
        #[arg(long, value_name = "DIR_TYPE")]
        public_dir: Option<String>,

        /// Relative file path under the chosen directory
        #[arg(long, requires = "directory")]
        sub_path: Option<String>,

        /// Explicit destination file (path or file:// URI)
        #[arg(long)]
        dest: Option<String>,

        /// Hide from the downloads listing of host UIs
        #[arg(long)]
        hidden: bool,

        /// Notification behaviour
        #[arg(long, value_enum)]
        notify: Option<NotifyArg>,
    },

    /// List downloads
    List {
        /// Filter by status (pending, running, paused, successful, failed); repeatable
        #[arg(short, long)]
        status: Vec<String>,

        /// Only these ids
        #[arg(long = "id")]
        ids: Vec<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download ID
        id: String,
    },

    /// Remove downloads and their files
    Remove {
        /// Download IDs
        #[arg(required = true)]
        ids: Vec<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Run the transfer engine in the foreground
    Run {
        /// Exit once nothing is left to transfer
        #[arg(long)]
        until_idle: bool,

        /// Start with connectivity marked offline
        #[arg(long)]
        offline: bool,
    },

    /// Make a raw bridge call, e.g. `dlq exec query '[{"status": 8}]'`
    Exec {
        /// Bridge action (enqueue, query, remove)
        action: String,

        /// JSON arguments array
        #[arg(default_value = "[]")]
        args: String,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "dlq_core=debug,dlq=debug" } else { "warn" })
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "dlq", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("dlq"))
            .unwrap_or_else(|| PathBuf::from(".dlq"))
    });

    // Initialize core
    let core = dlq_core::DlqCore::new(data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Add {
            url,
            title,
            description,
            mime_type,
            files_dir,
            public_dir,
            sub_path,
            dest,
            hidden,
            notify,
        } => {
            let request = commands::AddArgs {
                url,
                title,
                description,
                mime_type,
                files_dir,
                public_dir,
                sub_path,
                dest,
                hidden,
                notify,
            };
            commands::add_download(&core, request, cli.output).await?
        }

        Commands::List { status, ids, all } => {
            commands::list_downloads(&core, status, ids, all, cli.output)?
        }

        Commands::Info { id } => commands::show_info(&core, &id, cli.output)?,

        Commands::Remove { ids, yes } => {
            commands::remove_downloads(&core, ids, yes, cli.output).await?
        }

        Commands::Run {
            until_idle,
            offline,
        } => commands::run_engine(&core, until_idle, offline, cli.output).await?,

        Commands::Exec { action, args } => commands::exec(&core, &action, &args).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    core.engine().store().close().await;
    Ok(())
}
