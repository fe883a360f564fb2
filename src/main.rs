use clap::Parser;
use kvlite::repl;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "kvlite",
    version = VERSION,
    about = "Tiny single-file key-value store."
)]
struct Cli {
    /// Path to the database file.
    file: Option<PathBuf>,
}

fn main() {
    // Logs go to a file so stdout stays clean for the command loop.
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open("kvlite.log")
        .expect("Failed to open log file");

    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let Some(path) = cli.file else {
        println!("Must supply a database filename.");
        process::exit(1);
    };

    if let Err(e) = repl::run(&path) {
        println!("Error: {}", e);
        process::exit(1);
    }
}
