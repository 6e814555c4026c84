//! Command-line arguments and scenario overrides.

use std::path::PathBuf;

use clap::Parser;
use power_market_sim::config::ScenarioConfig;
use power_market_sim::sim::param::{Param, RawParam};
use power_market_sim::sim::types::{AgentStrategy, MarketParams};

/// Power market equilibrium simulator
#[derive(Parser, Debug)]
#[command(name = "power-market-sim")]
#[command(about = "Finds market-clearing prices for a set of power agents")]
#[command(version)]
pub struct Args {
    /// Load scenario from TOML config file
    #[arg(long, conflicts_with = "preset")]
    pub scenario: Option<PathBuf>,

    /// Use a built-in preset (supply_and_load, neighbourhood)
    #[arg(long)]
    pub preset: Option<String>,

    /// Resume from a checkpoint record instead of building a fresh market
    #[arg(long, value_name = "SNAPSHOT", conflicts_with_all = ["scenario", "preset"])]
    pub resume: Option<PathBuf>,

    /// Replay a checkpoint directory: print its first and last market and
    /// write one flow CSV per record into <DIR>-report
    #[arg(long, value_name = "DIR", conflicts_with_all = ["scenario", "preset", "resume"])]
    pub report: Option<PathBuf>,

    /// Override the stability tolerance
    #[arg(long)]
    pub tol: Option<f64>,

    /// Override the price step size (number or expression of `steps`)
    #[arg(long)]
    pub stepsize: Option<Param>,

    /// Override the round budget
    #[arg(long)]
    pub maxsteps: Option<usize>,

    /// Override the proximal penalty (number or expression of `steps`)
    #[arg(long)]
    pub prox: Option<Param>,

    /// Override the agent strategy (point_bid, limited_minimization)
    #[arg(long)]
    pub agent_strategy: Option<AgentStrategy>,

    /// Directory for checkpoint records (default: <scenario>-<unix secs>-network)
    #[arg(short = 'd', long)]
    pub output_dir: Option<PathBuf>,

    /// Export the per-round trace to CSV
    #[arg(long)]
    pub trace_out: Option<PathBuf>,

    /// Export the final flow matrix to CSV
    #[arg(long)]
    pub flow_out: Option<PathBuf>,

    /// Print the market after every round
    #[arg(short, long)]
    pub verbose: bool,

    /// Start REST API server after the run
    #[cfg(feature = "api")]
    #[arg(long)]
    pub serve: bool,

    /// API server port
    #[cfg(feature = "api")]
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
}

impl Args {
    /// Name used for the default output directory.
    pub fn run_name(&self) -> String {
        if let Some(path) = self.scenario.as_ref().or(self.resume.as_ref()) {
            return path
                .file_stem()
                .map_or_else(|| "market".to_string(), |s| s.to_string_lossy().into_owned());
        }
        self.preset
            .clone()
            .unwrap_or_else(|| "supply_and_load".to_string())
    }

    /// Output directory of `--report DIR`: `DIR-report` beside the input.
    pub fn report_dir(&self) -> Option<PathBuf> {
        let dir = self.report.as_ref()?;
        let mut name = dir.as_os_str().to_os_string();
        name.push("-report");
        Some(PathBuf::from(name))
    }

    /// Applies command-line overrides to a loaded scenario.
    pub fn apply_to_scenario(&self, cfg: &mut ScenarioConfig) {
        let m = &mut cfg.market;
        if let Some(tol) = self.tol {
            m.tol = tol;
        }
        if let Some(maxsteps) = self.maxsteps {
            m.maxsteps = maxsteps;
        }
        if let Some(stepsize) = &self.stepsize {
            m.stepsize = RawParam::from(stepsize.clone());
        }
        if let Some(prox) = &self.prox {
            m.prox = Some(RawParam::from(prox.clone()));
        }
        if let Some(strategy) = self.agent_strategy {
            m.agent_strategy = strategy.to_string();
        }
    }

    /// Applies command-line overrides to restored engine parameters.
    pub fn apply_to_params(&self, params: &mut MarketParams) {
        if let Some(tol) = self.tol {
            params.tol = tol;
        }
        if let Some(maxsteps) = self.maxsteps {
            params.maxsteps = maxsteps;
        }
        if let Some(stepsize) = &self.stepsize {
            params.stepsize = stepsize.clone();
        }
        if let Some(prox) = &self.prox {
            params.prox = Some(prox.clone());
        }
        if let Some(strategy) = self.agent_strategy {
            params.agent_strategy = strategy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("power-market-sim").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_have_no_overrides() {
        let args = parse(&[]).unwrap();
        assert!(args.scenario.is_none());
        assert!(args.tol.is_none());
        assert!(!args.verbose);
        assert_eq!(args.run_name(), "supply_and_load");
    }

    #[test]
    fn overrides_apply_to_scenario() {
        let args = parse(&[
            "--tol",
            "0.01",
            "--maxsteps",
            "7",
            "--stepsize",
            "0.1 / (steps + 1)",
            "--agent-strategy",
            "limited_minimization",
        ])
        .unwrap();
        let mut cfg = ScenarioConfig::supply_and_load();
        args.apply_to_scenario(&mut cfg);
        let params = cfg.market_params().unwrap();
        assert_eq!(params.tol, 0.01);
        assert_eq!(params.maxsteps, 7);
        assert_eq!(params.stepsize.value(1), 0.05);
        assert_eq!(params.agent_strategy, AgentStrategy::LimitedMinimization);
    }

    #[test]
    fn bad_expression_is_rejected_at_parse_time() {
        assert!(parse(&["--stepsize", "steps +"]).is_err());
    }

    #[test]
    fn resume_conflicts_with_preset() {
        assert!(parse(&["--resume", "a.json", "--preset", "neighbourhood"]).is_err());
    }

    #[test]
    fn report_conflicts_with_a_fresh_run() {
        assert!(parse(&["--report", "out", "--scenario", "a.toml"]).is_err());
        assert!(parse(&["--report", "out", "--resume", "a.json"]).is_err());
        let args = parse(&["--report", "out"]).unwrap();
        assert_eq!(args.report_dir(), Some(PathBuf::from("out-report")));
    }

    #[test]
    fn run_name_uses_file_stem() {
        let args = parse(&["--scenario", "configs/winter.toml", "-d", "out"]).unwrap();
        assert_eq!(args.run_name(), "winter");
        assert_eq!(args.output_dir, Some(PathBuf::from("out")));
    }
}
