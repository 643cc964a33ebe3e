use clap::{Parser, Subcommand};

mod commands;
mod config;
mod output;
mod storage;

use commands::recipient::AddressArgs;
use output::Output;

#[derive(Parser)]
#[command(name = "recipientctl")]
#[command(version)]
#[command(about = "Inspect and resolve the recipients of a local messaging account")]
#[command(long_about = "Inspect and resolve the recipients of a local messaging account.\n\nTrusted resolution merges recipients that turn out to be the same peer and moves their sessions, identities, profiles and cached messages along.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Debug logging (overrides the configured log level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (default: platform data dir/recipientctl)
    #[arg(long, global = true, env = "RECIPIENTCTL_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve identifiers proven to belong to one peer, merging recipients if needed
    Resolve(AddressArgs),

    /// Find or create a recipient without merging anything
    Lookup(AddressArgs),

    /// Show a recipient
    Show {
        /// Recipient ID
        id: String,
    },

    /// List all recipients
    List,

    /// Set the phone number of the local account
    SetAccount {
        /// Phone number in E.164 format
        number: String,
    },

    /// Show the local account
    Whoami,
}

fn main() {
    let cli = Cli::parse();
    let output = Output::new(cli.json);

    if let Err(e) = run(cli, &output) {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?
            .join("recipientctl"),
    };

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let config = config::Config::load(&data_dir)?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            config.log_level()
        })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let storage = storage::Storage::open(&data_dir)?;

    match cli.command {
        Commands::Resolve(args) => commands::recipient::resolve(&args, &storage, output),
        Commands::Lookup(args) => commands::recipient::lookup(&args, &storage, output),
        Commands::Show { id } => commands::recipient::show(&id, &storage, output),
        Commands::List => commands::recipient::list(&storage, output),
        Commands::SetAccount { number } => {
            commands::account::set_account(&number, &config, &storage, output)
        }
        Commands::Whoami => commands::account::whoami(&config, &storage, output),
    }
}
