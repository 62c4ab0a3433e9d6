use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use xlat::config::{CONFIG_FILE_NAME, EngineConfig};
use xlat::decode::{self, ControlAction, I386Decoder, Instruction};
use xlat::jit::listing::{self, HexListing};
use xlat::jit::memory::page_size;
use xlat::jit::{Fragment, GuestRegion, OutputPage, Translator};
use xlat::vm::ContextBlock;

const DEFAULT_GUEST_BASE: u32 = 0x0804_8000;
const DEFAULT_CONTEXT_BASE: u32 = 0x6000_0000;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "xlat")]
#[command(about = "i386 fragment translator", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to ./xlat.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a fragment given as hex bytes ('&' marks the entry)
    Translate {
        /// Guest bytes, e.g. "90&70 FE"
        hex: String,

        /// Guest address of the first byte
        #[arg(long, value_parser = parse_addr, default_value_t = DEFAULT_GUEST_BASE)]
        base: u32,

        /// Address of the context block the generated code refers to
        #[arg(long, value_parser = parse_addr, default_value_t = DEFAULT_CONTEXT_BASE)]
        context_base: u32,

        /// Address the fragment page is mapped at (defaults to the context's fragment page)
        #[arg(long, value_parser = parse_addr)]
        page_base: Option<u32>,

        /// Entry offset (overrides the '&' marker)
        #[arg(long)]
        entry: Option<usize>,

        /// Output format
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// List the instructions in a hex string
    Decode {
        hex: String,

        /// Guest address of the first byte
        #[arg(long, value_parser = parse_addr, default_value_t = DEFAULT_GUEST_BASE)]
        base: u32,

        /// Output format
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Write a default configuration file
    InitConfig {
        /// Where to write it (defaults to ./xlat.toml)
        path: Option<PathBuf>,
    },
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, String> {
    let result = match path {
        Some(p) => EngineConfig::load(p),
        None => EngineConfig::load_or_default(Path::new(CONFIG_FILE_NAME)),
    };
    result.map_err(|e| format!("error: {}", e))
}

fn parse_listing(hex: &str) -> Result<HexListing, String> {
    let listing = listing::parse_hex(hex).map_err(|e| format!("error: {}", e))?;
    if listing.bytes.is_empty() {
        return Err("error: no guest bytes given".to_string());
    }
    Ok(listing)
}

#[derive(Serialize)]
struct TranslateReport<'a> {
    guest_base: u32,
    guest: String,
    entry_offset: usize,
    page_base: u32,
    code: String,
    #[serde(flatten)]
    fragment: &'a Fragment,
}

fn run_translate(
    config: &EngineConfig,
    hex: &str,
    base: u32,
    context_base: u32,
    page_base: Option<u32>,
    entry: Option<usize>,
    format: OutputFormat,
) -> Result<(), String> {
    let listing = parse_listing(hex)?;
    let entry = entry.unwrap_or(listing.entry);
    let page_len = page_size();
    let page_base = page_base.unwrap_or_else(|| {
        let layout = xlat::vm::RegionLayout::new(config.threads.signal_stack_pages);
        context_base.wrapping_add(layout.fragment_offset() as u32)
    });

    let translator = Translator::new(&config.translator).with_trace(config.trace);
    let mut page = vec![0u8; page_len];
    let mut out = OutputPage::new(&mut page, page_base, ContextBlock::cells_at(context_base));
    let region = GuestRegion::new(&listing.bytes, base);
    let fragment = translator
        .try_translate(&region, entry, &mut out)
        .map_err(|e| format!("error: {}", e))?;
    let code = &page[..fragment.code_len];

    match format {
        OutputFormat::Json => {
            let report = TranslateReport {
                guest_base: base,
                guest: listing::hex_line(&listing.bytes),
                entry_offset: entry,
                page_base,
                code: listing::hex_line(code),
                fragment: &fragment,
            };
            let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        OutputFormat::Human => {
            println!("entry: +{} -> {:#010x}", entry, fragment.entry);
            println!("guest ({} bytes):", listing.bytes.len());
            print!("{}", listing::hexdump(&listing.bytes, base));
            println!("generated ({} bytes):", fragment.code_len);
            print!("{}", listing::hexdump(code, page_base));
            println!("mapping:");
            for (off, addr) in fragment.mapping.iter().enumerate() {
                if let Some(addr) = addr {
                    println!("  +{:<4} -> {:#010x}", off, addr);
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct DecodedLine {
    offset: usize,
    addr: u32,
    bytes: String,
    #[serde(flatten)]
    instruction: Instruction,
}

fn run_decode(hex: &str, base: u32, format: OutputFormat) -> Result<(), String> {
    let listing = parse_listing(hex)?;
    let decoded = decode::decode_all(&I386Decoder, &listing.bytes)
        .map_err(|(off, e)| format!("error: at offset {}: {}", off, e))?;

    let lines: Vec<DecodedLine> = decoded
        .into_iter()
        .map(|(offset, instruction)| DecodedLine {
            offset,
            addr: base.wrapping_add(offset as u32),
            bytes: listing::hex_line(&listing.bytes[offset..offset + instruction.len]),
            instruction,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&lines).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        OutputFormat::Human => {
            for line in &lines {
                let action = match line.instruction.action {
                    ControlAction::None => String::new(),
                    action => format!("{:?}", action),
                };
                println!("{:08x}  {:<30} {}", line.addr, line.bytes, action);
            }
        }
    }
    Ok(())
}

fn run_init_config(path: Option<PathBuf>) -> Result<(), String> {
    let path = path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    EngineConfig::default()
        .save_new(&path)
        .map_err(|e| format!("error: {}", e))?;
    println!("Created {}", path.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Translate {
            hex,
            base,
            context_base,
            page_base,
            entry,
            format,
        } => load_config(cli.config.as_deref()).and_then(|config| {
            run_translate(&config, &hex, base, context_base, page_base, entry, format)
        }),
        Commands::Decode { hex, base, format } => run_decode(&hex, base, format),
        Commands::InitConfig { path } => run_init_config(path),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
