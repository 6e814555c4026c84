//! Power market simulator entry point: CLI wiring and checkpointed runs.

mod cli;

use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use power_market_sim::config::ScenarioConfig;
use power_market_sim::io::checkpoint::read_snapshot;
use power_market_sim::error::CheckpointError;
use power_market_sim::io::export::{export_flow_csv, export_report, export_trace_csv};
use power_market_sim::io::{CheckpointReader, CheckpointWriter, TypeRegistry};
use power_market_sim::sim::kpi::{RunReport, TraceRecorder};
use power_market_sim::sim::{Event, Listener, Market};
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_with(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {message}");
    process::exit(1);
}

fn default_output_dir(name: &str) -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    PathBuf::from(format!("{name}-{secs}-network"))
}

/// Loads the scenario (`--scenario`, then `--preset`, then the default preset)
/// and applies overrides.
fn load_scenario(args: &Args) -> ScenarioConfig {
    let loaded = if let Some(path) = &args.scenario {
        ScenarioConfig::from_toml_file(path)
    } else if let Some(name) = &args.preset {
        ScenarioConfig::from_preset(name)
    } else {
        Ok(ScenarioConfig::supply_and_load())
    };
    let mut scenario = loaded.unwrap_or_else(|e| exit_with(e));
    args.apply_to_scenario(&mut scenario);

    let errors = scenario.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }
    scenario
}

fn restore(args: &Args, path: &Path) -> Market {
    let mut snapshot =
        read_snapshot(path, &TypeRegistry::with_defaults()).unwrap_or_else(|e| exit_with(e));
    args.apply_to_params(&mut snapshot.params);
    let errors = snapshot.params.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }
    snapshot.into_market().unwrap_or_else(|e| exit_with(e))
}

/// Offline replay of a finished run's checkpoint directory.
fn report(dir: &Path, out_dir: &Path) -> Result<usize, CheckpointError> {
    let reader = CheckpointReader::open(dir, TypeRegistry::with_defaults())?;
    if reader.is_empty() {
        return Err(CheckpointError::Invalid(format!(
            "no records in {}",
            dir.display()
        )));
    }
    println!("{}", reader.first()?.into_market()?);
    println!("{}", reader.last()?.into_market()?);
    export_report(&reader, out_dir)
}

fn main() {
    let args = Args::parse();
    init_logging();

    if let (Some(dir), Some(out_dir)) = (&args.report, args.report_dir()) {
        match report(dir, &out_dir) {
            Ok(files) => eprintln!("{files} flow reports written to {}", out_dir.display()),
            Err(e) => exit_with(e),
        }
        return;
    }

    let dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(&args.run_name()));

    let mut trace = TraceRecorder::new();
    let mut print = |market: &Market, event: Event| {
        if event == Event::AfterStep {
            println!("{market}");
        }
    };

    let (market, result) = if let Some(path) = &args.resume {
        let mut market = restore(&args, path);
        let mut writer = CheckpointWriter::new(&dir).unwrap_or_else(|e| exit_with(e));
        // The restored state is the first record of the new directory.
        if let Err(e) = writer.write(&market) {
            exit_with(e);
        }
        let mut listeners: Vec<&mut dyn Listener> = vec![&mut writer, &mut trace];
        if args.verbose {
            listeners.push(&mut print);
        }
        let result = market.resume(&mut listeners);
        (market, result)
    } else {
        let scenario = load_scenario(&args);
        let meta = scenario.meta_json().unwrap_or_else(|e| exit_with(e));
        let mut market = scenario.build_market().unwrap_or_else(|e| exit_with(e));
        let mut writer =
            CheckpointWriter::with_meta(&dir, &meta).unwrap_or_else(|e| exit_with(e));
        let mut listeners: Vec<&mut dyn Listener> = vec![&mut writer, &mut trace];
        if args.verbose {
            listeners.push(&mut print);
        }
        let result = market.run(&mut listeners);
        (market, result)
    };

    if let Err(e) = result {
        exit_with(e);
    }

    println!("{}", RunReport::from_market(&market));
    eprintln!("Checkpoints written to {}", dir.display());

    if let Some(path) = &args.trace_out {
        if let Err(e) = export_trace_csv(trace.records(), path) {
            exit_with(format_args!("failed to write CSV: {e}"));
        }
        eprintln!("Trace written to {}", path.display());
    }

    if let Some(path) = &args.flow_out {
        if let Err(e) = export_flow_csv(market.deviceset(), market.flow(), path) {
            exit_with(format_args!("failed to write CSV: {e}"));
        }
        eprintln!("Flows written to {}", path.display());
    }

    #[cfg(feature = "api")]
    if args.serve {
        use std::net::SocketAddr;
        use std::sync::Arc;

        let state = Arc::new(power_market_sim::api::AppState::from_market(
            &market,
            trace.into_records(),
        ));
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
            exit_with(format_args!("failed to create tokio runtime: {e}"))
        });
        if let Err(e) = rt.block_on(power_market_sim::api::serve(state, addr)) {
            exit_with(e);
        }
    }
}
