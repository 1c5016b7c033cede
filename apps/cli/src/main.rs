use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use snflash_core::audit::AuditLog;
use snflash_core::config::SessionConfig;
use snflash_core::crypto::{self, Prf};
use snflash_core::events::{ChannelObserver, SessionEvent};
use snflash_core::payload::DirectoryPayloadProvider;
use snflash_core::serial_number::{self, GeneratePolicy, SerialNumber};
use snflash_core::session::{DeviceSession, SessionController, SessionOutcome};
use snflash_core::state::AbortReason;
use snflash_core::transport::{
    PortDescriptor, SerialPortTransport, available_ports, select_port,
};
use snflash_core::vault::{EncryptedImageAsset, IvPolicy, ModelAsset};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Controller serial-number reprogramming tool",
    long_about = None
)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports
    Ports,

    /// Run a full session: detect, deliver diagnostics, rewrite the serial
    Run {
        /// Port name; overrides the config
        #[arg(short, long)]
        port: Option<String>,

        /// Replacement serial. Prompted for when omitted.
        #[arg(long, conflicts_with = "generate")]
        serial: Option<String>,

        /// Keep the manufacturing fields and randomize the unit identifier
        #[arg(long)]
        generate: bool,
    },

    /// Stop after reading the current serial
    ReadSerial {
        #[arg(short, long)]
        port: Option<String>,
    },

    /// Sanitize and validate a candidate serial without touching a device
    CheckSerial { candidate: String },

    /// Decrypt the configured diagnostics image for a model
    DecryptAsset {
        model: String,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Encrypt an image as a vault asset and print its config entry
    SealAsset {
        model: String,
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        passphrase: String,
        #[arg(long, default_value_t = snflash_core::vault::DEFAULT_ASSET_ITERATIONS)]
        iterations: u32,
        /// Use HMAC-SHA1 key derivation for older tooling
        #[arg(long)]
        legacy_prf: bool,
    },

    /// Seal any file into a self-describing passphrase container
    SealFile {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        passphrase: String,
        #[arg(long, default_value_t = crypto::seal::STRING_ITERATIONS)]
        iterations: u32,
    },

    /// Open a container written by seal-file
    OpenFile {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        passphrase: String,
    },

    /// Print the audit log
    Audit,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: tracing subscriber already set");
    }

    if let Err(e) = dispatch(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn dispatch(args: Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    match args.command {
        Cmd::Ports => list_ports(),
        Cmd::Run {
            port,
            serial,
            generate,
        } => {
            let supply = match (serial, generate) {
                (Some(s), _) => SerialSupply::Given(s),
                (None, true) => SerialSupply::Generate,
                (None, false) => SerialSupply::Prompt,
            };
            run_session(config, port, supply)
        }
        Cmd::ReadSerial { port } => run_session(config, port, SerialSupply::ReadOnly),
        Cmd::CheckSerial { candidate } => check_serial(&candidate),
        Cmd::DecryptAsset { model, output } => {
            let image = config.build_vault().decrypt_asset(&model)?;
            std::fs::copy(image.path(), &output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("{} bytes -> {}", image.len(), output.display());
            Ok(())
        }
        Cmd::SealAsset {
            model,
            input,
            output,
            passphrase,
            iterations,
            legacy_prf,
        } => seal_asset(model, &input, output, passphrase, iterations, legacy_prf),
        Cmd::SealFile {
            input,
            output,
            passphrase,
            iterations,
        } => {
            let plain = read(&input)?;
            let sealed = crypto::seal_with_passphrase(&plain, &passphrase, iterations)?;
            write(&output, &sealed)
        }
        Cmd::OpenFile {
            input,
            output,
            passphrase,
        } => {
            let plain = crypto::open_with_passphrase(&read(&input)?, &passphrase)?;
            write(&output, &plain)
        }
        Cmd::Audit => {
            let log = AuditLog::new(config.audit_log_path.clone());
            for record in log.read_all()? {
                println!("{}", record.to_line());
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(p) => SessionConfig::load_from_file(p),
        None => Ok(SessionConfig::default()),
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn write(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    println!("{} bytes -> {}", data.len(), path.display());
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        println!("{}", port);
    }
    Ok(())
}

fn check_serial(candidate: &str) -> Result<()> {
    let cleaned = serial_number::sanitize(candidate);
    println!("sanitized: {}", cleaned);
    let serial = serial_number::parse(&cleaned)?;
    println!(
        "valid: {} (location {}, year {}, week {}, unit {}, config {})",
        serial_number::format(&serial),
        serial.location(),
        serial.year(),
        serial.week(),
        serial.unit(),
        serial.config()
    );
    Ok(())
}

fn seal_asset(
    model: String,
    input: &Path,
    output: PathBuf,
    passphrase: String,
    iterations: u32,
    legacy_prf: bool,
) -> Result<()> {
    let asset = EncryptedImageAsset {
        path: output,
        passphrase,
        salt: hex::encode(crypto::random_bytes(16)),
        iterations,
        prf: if legacy_prf { Prf::HmacSha1 } else { Prf::HmacSha256 },
        iv: IvPolicy::Prepended,
    };
    let sealed = asset.seal(&read(input)?)?;
    write(&asset.path, &sealed)?;

    #[derive(Serialize)]
    struct Entry<'a> {
        assets: [&'a ModelAsset; 1],
    }
    let entry = ModelAsset { model, asset };
    println!("{}", toml::to_string_pretty(&Entry { assets: [&entry] })?);
    Ok(())
}

enum SerialSupply {
    Given(String),
    Generate,
    Prompt,
    ReadOnly,
}

fn resolve_port(config: &SessionConfig, flag: Option<String>) -> Result<PortDescriptor> {
    let preferred = flag.or_else(|| config.port.clone());
    let ports = available_ports()?;
    match select_port(&ports, preferred.as_deref()) {
        Some(p) => Ok(p.clone()),
        // Not enumerable (e.g. a pty); trust the name.
        None => match preferred {
            Some(name) => Ok(PortDescriptor::new(name)),
            None => bail!("no USB serial port found; pass --port"),
        },
    }
}

fn run_session(config: SessionConfig, port: Option<String>, supply: SerialSupply) -> Result<()> {
    let port = resolve_port(&config, port)?;
    let payload_dir = config
        .payload_dir
        .clone()
        .ok_or_else(|| anyhow!("payload_dir is not set in the config"))?;
    info!(port = %port, "Starting session");

    let (tx, rx) = mpsc::channel();
    let transport =
        SerialPortTransport::new(config.baud_rate).with_write_timeout(config.ack_timeout());
    let session = DeviceSession::with_observer(
        config,
        port,
        transport,
        Arc::new(DirectoryPayloadProvider::new(payload_dir)),
        Arc::new(ChannelObserver::new(tx)),
    );
    let handle = session.spawn()?;
    let controller = handle.controller();

    for event in rx.iter() {
        match event {
            SessionEvent::ModelDetected { model } => println!("Model: {}", model),
            SessionEvent::Progress {
                operation,
                current,
                total,
                ..
            } if total > 0 => {
                eprint!("\r{}: {:>3}%", operation, current * 100 / total);
                if current == total {
                    eprintln!();
                }
            }
            SessionEvent::OldSerial { serial } => {
                println!("Current serial: {}", serial);
                supply_serial(&controller, &supply, &serial)?;
            }
            SessionEvent::SerialRejected { candidate, error } => {
                println!("Rejected {:?}: {}", candidate, error);
                if matches!(supply, SerialSupply::Prompt) {
                    prompt_serial(&controller)?;
                } else {
                    controller.cancel();
                }
            }
            SessionEvent::Completed { old, new } => println!("Serial changed: {} -> {}", old, new),
            SessionEvent::Aborted { .. } => break,
            _ => {}
        }
    }

    let report = handle.join()?;
    if let Some(e) = &report.audit_error {
        error!("Audit record not written: {}", e);
    }
    match report.outcome {
        SessionOutcome::Completed { .. } => Ok(()),
        SessionOutcome::Aborted(AbortReason::UserCancelled)
            if matches!(supply, SerialSupply::ReadOnly) =>
        {
            Ok(())
        }
        SessionOutcome::Aborted(reason) => bail!("{} [{}]", reason, reason.code()),
    }
}

fn supply_serial(
    controller: &SessionController,
    supply: &SerialSupply,
    current: &SerialNumber,
) -> Result<()> {
    match supply {
        SerialSupply::ReadOnly => controller.cancel(),
        SerialSupply::Given(raw) => {
            // The session reports the rejection; the event loop cancels.
            let _ = controller.submit_serial(&serial_number::sanitize(raw));
        }
        SerialSupply::Generate => {
            let new = serial_number::generate(
                current,
                GeneratePolicy::default(),
                &mut rand::thread_rng(),
            );
            println!("Generated serial: {}", new);
            let _ = controller.submit_serial(new.as_str());
        }
        SerialSupply::Prompt => prompt_serial(controller)?,
    }
    Ok(())
}

fn prompt_serial(controller: &SessionController) -> Result<()> {
    print!("New serial: ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        controller.cancel();
        return Ok(());
    }
    let _ = controller.submit_serial(&serial_number::sanitize(&line));
    Ok(())
}
