use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vigil_store::{pending, Store};

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil attendance store inspection CLI")]
struct Cli {
    /// Path to the SQLite database (defaults to VIGIL_DB_PATH).
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show recent attendance records
    Attendance {
        /// Maximum rows to print
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// List registered guests
    Guests,
    /// List pending registration artifacts in a videos directory
    Pending {
        /// Directory holding the pending JSON artifacts
        dir: PathBuf,
    },
    /// Set a guest's status (active, inactive, leave)
    SetStatus {
        guest_id: String,
        status: String,
    },
}

fn db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.db {
        return Ok(path.clone());
    }
    std::env::var("VIGIL_DB_PATH")
        .map(PathBuf::from)
        .context("no database given; pass --db or set VIGIL_DB_PATH")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Attendance { limit } => {
            let store = Store::open(&db_path(&cli)?)?;
            let rows = store.recent_attendance(*limit)?;
            if rows.is_empty() {
                println!("No attendance recorded");
            }
            for row in rows {
                println!(
                    "{}  {:<20} {:<8} {}",
                    row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    row.guest_id,
                    row.device_id,
                    row.method
                );
            }
        }
        Commands::Guests => {
            let store = Store::open(&db_path(&cli)?)?;
            let guests = store.guests()?;
            if guests.is_empty() {
                println!("No guests registered");
            }
            for g in guests {
                println!("{:<20} {:<10} {:<10} {}", g.guest_id, g.status, g.guest_type, g.name);
            }
        }
        Commands::Pending { dir } => {
            let artifacts = pending::scan_dir(dir);
            if artifacts.is_empty() {
                println!("No pending registrations");
            }
            for (path, reg) in artifacts {
                println!(
                    "{:<20} confirmed={:<5} encodings={}/{}  {}",
                    reg.guest_id,
                    reg.confirmed,
                    reg.valid_count(),
                    pending::MAX_ENCODINGS,
                    path.display()
                );
            }
        }
        Commands::SetStatus { guest_id, status } => {
            let store = Store::open(&db_path(&cli)?)?;
            store.set_guest_status(guest_id, status)?;
            println!("{guest_id}: status set to {status}");
        }
    }

    Ok(())
}
