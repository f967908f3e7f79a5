use adb_freeze::{client, AdbConfig, AdbKeyPair, AppKiller};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "adb-freeze", version, about = "Force-stop apps through the local adbd")]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// adbd host
    #[arg(long)]
    host: Option<String>,

    /// adbd port
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding adb_key / adb_key.pub
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Give up on the handshake after this many milliseconds
    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Force-stop the given packages
    Stop {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Run a shell command and print its output
    Shell {
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Check that adbd accepts our key and runs commands
    Check,
    /// Load or create the key files and print the public key line
    Keygen,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<AdbConfig> {
    let mut config = match &cli.config {
        Some(path) => AdbConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AdbConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dir) = &cli.key_dir {
        config.private_key_path = dir.join("adb_key");
        config.public_key_path = dir.join("adb_key.pub");
    }
    if cli.handshake_timeout_ms.is_some() {
        config.handshake_timeout_ms = cli.handshake_timeout_ms;
    }

    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    match cli.command {
        Cmd::Stop { packages } => {
            let killer = AppKiller::from_config(config).context("preparing ADB key")?;
            let count = killer.kill_apps(&packages);
            println!("{}/{} stopped", count, packages.len());
            Ok(if count == packages.len() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Cmd::Shell { command } => {
            let keypair =
                AdbKeyPair::load_or_generate(&config.private_key_path, &config.public_key_path)?;
            let connection = client::connect(&config, Arc::new(keypair))
                .with_context(|| format!("connecting to {}:{}", config.host, config.port))?;
            let output = client::shell(&connection, &command.join(" "))?;
            connection.close();
            std::io::stdout().write_all(&output)?;
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Check => {
            let killer = AppKiller::from_config(config).context("preparing ADB key")?;
            if killer.test_connection() {
                println!("adb ok");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("adb unavailable");
                Ok(ExitCode::FAILURE)
            }
        }
        Cmd::Keygen => {
            let keypair =
                AdbKeyPair::load_or_generate(&config.private_key_path, &config.public_key_path)?;
            let line = keypair.get_public_key(&config.key_label)?;
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            println!("{}", line);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
