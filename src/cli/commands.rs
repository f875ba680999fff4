use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    card::Card,
    commands::{CommandExecutor, ScriptCommand},
    config::ClientConfig,
    context::Context,
    fake::FakeResourceManager,
    monitor::{ReaderMonitor, ReaderState, Timeout},
    native::ResourceManager,
    types::{Attrib, ShareMode, StateFlags},
    utils::{format_ascii, format_hex_spaced, parse_u32},
};

#[derive(Parser)]
#[command(name = "scard-client")]
#[command(about = "Talk to smart card readers through the PC/SC resource manager")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// JSON file with connection defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the built-in simulated readers instead of the PC/SC service
    #[arg(long, global = true)]
    pub simulate: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// List reader groups
    Groups,

    /// Show reader name, card state, protocol and ATR
    Status {
        /// Reader name or index (use 'list' to see available readers)
        reader: String,
    },

    /// Watch readers for card insertion and removal
    Monitor {
        /// Stop after this many events
        #[arg(short = 'n', long)]
        events: Option<usize>,

        /// Stop after this many polling rounds
        #[arg(short, long)]
        rounds: Option<usize>,

        /// Per-round wait in milliseconds; negative waits forever
        #[arg(short, long, allow_negative_numbers = true)]
        timeout_ms: Option<i64>,
    },

    /// Send APDU command via transmit
    Transmit {
        /// Reader name or index (use 'list' to see available readers)
        reader: String,

        /// APDU command in hex format (e.g., "00A40400")
        apdu: String,

        /// Connection share mode
        #[arg(short, long)]
        mode: Option<ShareModeArg>,

        /// Show response in different formats
        #[arg(short, long)]
        format: Option<ResponseFormat>,
    },

    /// Send control command to reader
    Control {
        /// Reader name or index
        reader: String,

        /// Control code (decimal or hex with 0x prefix)
        code: String,

        /// Data to send in hex format (optional)
        #[arg(default_value = "")]
        data: String,

        /// Connection share mode (use 'direct' for reader control)
        #[arg(short, long, default_value = "direct")]
        mode: ShareModeArg,

        /// Show response in different formats
        #[arg(short, long)]
        format: Option<ResponseFormat>,
    },

    /// Read or write a reader/card attribute
    Attr {
        /// Reader name or index
        reader: String,

        /// Attribute id (decimal or hex with 0x prefix)
        id: String,

        /// Write this hex value instead of reading
        #[arg(long)]
        set: Option<String>,

        /// Connection share mode
        #[arg(short, long)]
        mode: Option<ShareModeArg>,
    },

    /// Execute commands from a script file
    Script {
        /// Script file path
        file: PathBuf,

        /// Reader name or index to use for all commands
        reader: String,

        /// Connection share mode
        #[arg(short, long)]
        mode: Option<ShareModeArg>,

        /// Continue on errors
        #[arg(short, long)]
        continue_on_error: bool,

        /// Write the command history as JSON to this file
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug)]
pub enum ShareModeArg {
    Shared,
    Exclusive,
    Direct,
}

impl std::str::FromStr for ShareModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(ShareModeArg::Shared),
            "exclusive" => Ok(ShareModeArg::Exclusive),
            "direct" => Ok(ShareModeArg::Direct),
            _ => Err(format!("Invalid share mode: {s}")),
        }
    }
}

impl From<ShareModeArg> for ShareMode {
    fn from(mode: ShareModeArg) -> Self {
        match mode {
            ShareModeArg::Shared => ShareMode::Shared,
            ShareModeArg::Exclusive => ShareMode::Exclusive,
            ShareModeArg::Direct => ShareMode::Direct,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ResponseFormat {
    Hex,
    HexSpaced,
    Ascii,
    All,
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(ResponseFormat::Hex),
            "spaced" => Ok(ResponseFormat::HexSpaced),
            "ascii" => Ok(ResponseFormat::Ascii),
            "all" => Ok(ResponseFormat::All),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

/// Resource manager context plus the defaults it was opened with.
struct Session {
    config: ClientConfig,
    ctx: Context,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => ClientConfig::from_json_file(path)?,
            None => ClientConfig::default(),
        };

        let api: Arc<dyn ResourceManager> = if cli.simulate {
            log::info!("Using simulated readers");
            Arc::new(FakeResourceManager::demo())
        } else {
            system_resource_manager()?
        };

        let ctx = Context::establish(api, config.scope).context("Failed to initialize PCSC")?;
        Ok(Self { config, ctx })
    }

    fn connect(&self, name_or_index: &str, mode: Option<ShareModeArg>) -> Result<Card<'_>> {
        let reader_name = resolve_reader_name(&self.ctx, name_or_index)?;
        let share_mode = mode.map_or(self.config.share_mode, ShareMode::from);
        self.ctx
            .connect(&reader_name, share_mode, self.config.protocols)
            .with_context(|| format!("Failed to connect to reader: {reader_name}"))
    }

    fn finish(&self, card: Card<'_>) -> Result<()> {
        card.disconnect(self.config.disposition)
            .context("Failed to disconnect")
    }
}

#[cfg(feature = "native")]
fn system_resource_manager() -> Result<Arc<dyn ResourceManager>> {
    Ok(Arc::new(crate::core::pcsc_lite::PcscLite))
}

#[cfg(not(feature = "native"))]
fn system_resource_manager() -> Result<Arc<dyn ResourceManager>> {
    bail!("Built without PC/SC support; use --simulate")
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let session = Session::open(&cli)?;

    match cli.command {
        Commands::List { detailed } => cmd_list(&session, detailed),
        Commands::Groups => cmd_groups(&session),
        Commands::Status { reader } => cmd_status(&session, &reader),
        Commands::Monitor {
            events,
            rounds,
            timeout_ms,
        } => cmd_monitor(&session, events, rounds, timeout_ms),
        Commands::Transmit {
            reader,
            apdu,
            mode,
            format,
        } => cmd_transmit(&session, &reader, &apdu, mode, format),
        Commands::Control {
            reader,
            code,
            data,
            mode,
            format,
        } => cmd_control(&session, &reader, &code, &data, mode, format),
        Commands::Attr {
            reader,
            id,
            set,
            mode,
        } => cmd_attr(&session, &reader, &id, set.as_deref(), mode),
        Commands::Script {
            file,
            reader,
            mode,
            continue_on_error,
            history,
        } => cmd_script(
            &session,
            &file,
            &reader,
            mode,
            continue_on_error,
            history.as_deref(),
        ),
    }
}

fn cmd_list(session: &Session, detailed: bool) -> Result<()> {
    let readers = session
        .ctx
        .list_readers()
        .context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    // An unaware query returns at once with the current state of every reader.
    let mut states: Vec<ReaderState> = readers
        .iter()
        .map(|name| ReaderState::new(name.as_str(), StateFlags::UNAWARE))
        .collect();
    let known = match session.ctx.get_status_change(&mut states, Duration::ZERO) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Could not read reader states: {e}");
            false
        }
    };

    println!("Available PCSC readers:");
    for (i, state) in states.iter().enumerate() {
        let present = known && state.event_state().contains(StateFlags::PRESENT);
        if detailed {
            println!("  [{}] {}", i, state.name());
            if known {
                println!("      State: {}", state.event_state().flags());
            }
            println!(
                "      Status: {}",
                if present { "Card present" } else { "No card" }
            );
            if present {
                println!("      ATR: {}", format_hex_spaced(state.atr()));
            }
        } else if present {
            println!(
                "  [{}] {} [CARD - ATR: {}]",
                i,
                state.name(),
                format_hex_spaced(state.atr())
            );
        } else {
            println!("  [{}] {}", i, state.name());
        }
    }

    Ok(())
}

fn cmd_groups(session: &Session) -> Result<()> {
    let groups = session
        .ctx
        .list_reader_groups()
        .context("Failed to list reader groups")?;

    if groups.is_empty() {
        println!("No reader groups found.");
        return Ok(());
    }

    println!("Reader groups:");
    for group in groups {
        println!("  {group}");
    }
    Ok(())
}

fn cmd_status(session: &Session, reader_name: &str) -> Result<()> {
    let card = session.connect(reader_name, None)?;
    let status = card.status().context("Failed to read card status")?;

    println!("Reader: {}", status.reader);
    println!("State: {:?}", status.state);
    println!("Protocol: {}", status.protocol);
    println!("ATR: {}", format_hex_spaced(&status.atr));

    session.finish(card)
}

fn cmd_monitor(
    session: &Session,
    max_events: Option<usize>,
    max_rounds: Option<usize>,
    timeout_ms: Option<i64>,
) -> Result<()> {
    let timeout = timeout_ms
        .map(Timeout::from_millis_signed)
        .unwrap_or_else(|| session.config.poll_timeout().into());
    let mut monitor =
        ReaderMonitor::for_all_readers(&session.ctx).context("Failed to list readers")?;

    println!(
        "Monitoring {} reader(s)...",
        monitor.readers().count()
    );

    let mut seen = 0;
    let mut rounds = 0;
    loop {
        let events = monitor
            .poll(&session.ctx, timeout)
            .context("Failed to wait for reader changes")?;
        rounds += 1;

        for event in events {
            println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), event);
            seen += 1;
            if max_events.is_some_and(|max| seen >= max) {
                return Ok(());
            }
        }
        if max_rounds.is_some_and(|max| rounds >= max) {
            return Ok(());
        }
    }
}

fn cmd_transmit(
    session: &Session,
    reader_name: &str,
    apdu_hex: &str,
    mode: Option<ShareModeArg>,
    format: Option<ResponseFormat>,
) -> Result<()> {
    let card = session.connect(reader_name, mode)?;

    let mut executor = CommandExecutor::new();
    let result = executor
        .transmit(&card, apdu_hex)
        .context("Failed to execute transmit command")?;

    println!("APDU: {}", format_hex_spaced(&result.apdu));

    let format = format.unwrap_or(ResponseFormat::HexSpaced);
    print_response(&result.response, format);

    println!("Status: {:02X} {:02X}", result.sw1, result.sw2);
    println!("Duration: {}ms", result.duration_ms);

    session.finish(card)
}

fn cmd_control(
    session: &Session,
    reader_name: &str,
    code_str: &str,
    data_hex: &str,
    mode: ShareModeArg,
    format: Option<ResponseFormat>,
) -> Result<()> {
    let code = parse_u32(code_str).context("Failed to parse control code")?;
    let card = session.connect(reader_name, Some(mode))?;

    let mut executor = CommandExecutor::new();
    let result = executor
        .control(&card, code, data_hex)
        .context("Failed to execute control command")?;

    println!("Control Code: 0x{:X} ({})", result.code, result.code);
    if !result.input.is_empty() {
        println!("Input: {}", format_hex_spaced(&result.input));
    }

    let format = format.unwrap_or(ResponseFormat::HexSpaced);
    print_response(&result.output, format);

    println!("Duration: {}ms", result.duration_ms);

    session.finish(card)
}

fn cmd_attr(
    session: &Session,
    reader_name: &str,
    id_str: &str,
    value_hex: Option<&str>,
    mode: Option<ShareModeArg>,
) -> Result<()> {
    let id = Attrib(parse_u32(id_str).context("Failed to parse attribute id")?);
    let card = session.connect(reader_name, mode)?;
    let mut executor = CommandExecutor::new();

    match value_hex {
        Some(value) => {
            executor.set_attrib(&card, id, value)?;
            println!("Attribute {id} set");
        }
        None => {
            let value = executor.get_attrib(&card, id)?;
            println!("Attribute {id} ({} bytes)", value.len());
            print_response(&value, ResponseFormat::All);
        }
    }

    session.finish(card)
}

fn cmd_script(
    session: &Session,
    file_path: &Path,
    reader_name: &str,
    mode: Option<ShareModeArg>,
    continue_on_error: bool,
    history_path: Option<&Path>,
) -> Result<()> {
    let file = File::open(file_path)
        .with_context(|| format!("Failed to open script file: {}", file_path.display()))?;
    let card = session.connect(reader_name, mode)?;

    let mut executor = CommandExecutor::new();
    if let Some(path) = history_path {
        load_history(&mut executor, path)?;
    }
    let mut line_number = 0;
    let mut errors = 0;

    println!("Executing script: {}", file_path.display());
    println!("Reader: {}", card.reader());
    println!();

    for line in BufReader::new(file).lines() {
        line_number += 1;
        let line = line.context("Failed to read line from script")?;

        let result = match ScriptCommand::parse(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => {
                println!("Line {line_number}: {}", line.trim());
                executor.execute(&card, &command)
            }
            Err(e) => {
                println!("Line {line_number}: {}", line.trim());
                Err(e)
            }
        };

        match result {
            Ok((response, duration)) => {
                println!(
                    "  Response: {} ({}ms)",
                    format_hex_spaced(&response),
                    duration
                );
            }
            Err(e) => {
                errors += 1;
                println!("  ERROR: {e:#}");
                if !continue_on_error {
                    bail!("Script execution stopped due to error on line {line_number}");
                }
            }
        }
        println!();
    }

    println!("Script execution completed.");
    println!("Total lines processed: {line_number}");
    if errors > 0 {
        println!("Errors encountered: {errors}");
    }

    let stats = executor.get_statistics();
    println!(
        "Commands in history: {} (succeeded: {}, failed: {}, average: {}ms)",
        stats.total_commands,
        stats.successful_commands,
        stats.failed_commands,
        stats.average_duration_ms
    );

    if let Some(path) = history_path {
        std::fs::write(path, executor.export_history()?)
            .with_context(|| format!("Failed to write history: {}", path.display()))?;
        println!("History written to {}", path.display());
    }

    session.finish(card)
}

/// Appends to an existing history file instead of overwriting it.
fn load_history(executor: &mut CommandExecutor, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history: {}", path.display()))?;
    if json.trim().is_empty() {
        return Ok(());
    }
    executor.import_history(&json)
}

fn resolve_reader_name(ctx: &Context, name_or_index: &str) -> Result<String> {
    // Try to parse as index first
    if let Ok(index) = name_or_index.parse::<usize>() {
        let readers = ctx.list_readers().context("Failed to list readers")?;
        return match readers.get(index) {
            Some(name) => Ok(name.clone()),
            None if readers.is_empty() => bail!("No PCSC readers found"),
            None => bail!(
                "Reader index {} out of range (0-{})",
                index,
                readers.len() - 1
            ),
        };
    }

    // Use as reader name directly
    Ok(name_or_index.to_string())
}

fn print_response(data: &[u8], format: ResponseFormat) {
    if data.is_empty() {
        println!("Response: (empty)");
        return;
    }

    match format {
        ResponseFormat::Hex => {
            println!("Response: {}", hex::encode_upper(data));
        }
        ResponseFormat::HexSpaced => {
            println!("Response: {}", format_hex_spaced(data));
        }
        ResponseFormat::Ascii => {
            println!("Response (ASCII): {}", format_ascii(data));
        }
        ResponseFormat::All => {
            println!("Response (Hex): {}", format_hex_spaced(data));
            println!("Response (ASCII): {}", format_ascii(data));
        }
    }
}
