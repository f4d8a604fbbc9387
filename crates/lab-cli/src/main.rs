use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lab",
    version = "0.3.0",
    about = "Benchmark statistics reduction CLI"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VariantArg {
    #[value(name = "replica")]
    Replica,
    #[value(name = "client")]
    Client,
}

impl From<VariantArg> for lab_stats::Variant {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::Replica => lab_stats::Variant::Replica,
            VariantArg::Client => lab_stats::Variant::Client,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce every experiment directory under ROOT into one report on stdout.
    Process {
        #[arg(default_value = ".")]
        root: PathBuf,
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        /// Exit with an error if any directory had to be skipped.
        #[arg(long)]
        strict: bool,
    },
    /// Print the per-participant and combining field tables.
    Fields {
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

// Diagnostics go to stderr so stdout stays a clean report.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Process {
            root,
            variant,
            config,
            json,
            strict,
        } => {
            let profile = resolve_profile(variant, config.as_deref())?;
            let format = if json {
                lab_stats::ReportFormat::JsonLines
            } else {
                lab_stats::ReportFormat::Csv
            };
            let stdout = io::stdout();
            let mut writer = lab_stats::ReportWriter::new(
                BufWriter::new(stdout.lock()),
                profile.columns.iter().copied(),
                profile.index_column(),
                format,
            );
            let summary = lab_stats::process_root(&root, &profile, &mut writer)?;
            if strict && !summary.skipped.is_empty() {
                let names: Vec<&str> = summary.skipped.iter().map(|s| s.name.as_str()).collect();
                return Err(anyhow::anyhow!(
                    "{} experiment directories skipped: {}",
                    names.len(),
                    names.join(", ")
                ));
            }
        }
        Commands::Fields {
            variant,
            config,
            json,
        } => {
            let profile = resolve_profile(variant, config.as_deref())?;
            if json {
                return Ok(Some(fields_to_json(&profile)));
            }
            print_fields(&profile);
        }
    }
    Ok(None)
}

fn resolve_profile(
    variant: Option<VariantArg>,
    config_path: Option<&Path>,
) -> Result<lab_stats::Profile> {
    let mut config = match config_path {
        Some(path) => lab_stats::StatsConfig::load(path)?,
        None => lab_stats::StatsConfig::default(),
    };
    if let Some(variant) = variant {
        config.variant = variant.into();
    }
    Ok(lab_stats::Profile::from_config(&config)?)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Process { json, .. } | Commands::Fields { json, .. } => *json,
    }
}

fn fields_to_json(profile: &lab_stats::Profile) -> Value {
    json!({
        "variant": profile.variant,
        "participant": profile.participant,
        "combined": profile.combined,
        "window": profile.window,
        "load_start": profile.load_start,
        "columns": profile.columns,
    })
}

fn print_fields(profile: &lab_stats::Profile) {
    println!("variant: {}", profile.variant.as_str());
    println!(
        "window: cut_start={}% cut_end={}% ticks_per_second={}",
        profile.window.cut_start_percent,
        profile.window.cut_end_percent,
        profile.window.ticks_per_second
    );
    if let Some(detector) = &profile.load_start {
        println!(
            "load_start: column={} canary_count={} idle_count={}",
            detector.column, detector.canary_count, detector.idle_count
        );
    }
    println!("participant fields:");
    for spec in profile.participant.fields() {
        println!("  {:<30} {:<22} {}", spec.name, spec.source, spec.strategy);
    }
    println!("combined fields:");
    for spec in profile.combined.fields() {
        println!("  {:<30} {}", spec.name, spec.strategy);
    }
    println!("columns: {}", profile.columns.join(","));
}
