mod common;

use std::sync::Arc;

use common::*;
use power_market_sim::devices::{Agent, DeviceSet, ProfileLoad, SolveError};
use power_market_sim::error::MarketError;
use power_market_sim::sim::param::Param;
use power_market_sim::sim::types::{AgentStrategy, FailurePolicy, MarketParams, PriceRule};
use power_market_sim::sim::{Event, Listener, Market};

/// Shares one test double between the device set and the test body.
#[derive(Debug)]
struct Shared<A>(Arc<A>);

impl<A: Agent> Agent for Shared<A> {
    fn id(&self) -> &str {
        self.0.id()
    }
    fn rows(&self) -> usize {
        self.0.rows()
    }
    fn time_slots(&self) -> usize {
        self.0.time_slots()
    }
    fn solve(
        &self,
        price: &[f64],
        prior: &[f64],
        prox: Option<f64>,
        options: &power_market_sim::devices::SolverOptions,
    ) -> Result<Vec<f64>, power_market_sim::devices::SolveError> {
        self.0.solve(price, prior, prox, options)
    }
    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &power_market_sim::devices::SolverOptions,
    ) -> Result<Vec<f64>, power_market_sim::devices::SolveError> {
        self.0.step(price, prior, options)
    }
    fn utility(&self, flow: &[f64], price: &[f64]) -> f64 {
        self.0.utility(flow, price)
    }
    fn type_tag(&self) -> &'static str {
        self.0.type_tag()
    }
    fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        self.0.to_value()
    }
}

fn fixed_load(id: &str, row: Vec<f64>) -> Box<dyn Agent> {
    Box::new(ProfileLoad::new(id, row).unwrap())
}

#[test]
fn initialize_resets_to_zero_state() {
    let mut market = market(supply_and_load(), convergence_params());
    market.run(&mut []).unwrap();
    assert!(market.steps() > 0);

    market.initialize();
    assert_eq!(market.steps(), 0);
    assert!(market.price().iter().all(|&p| p == 0.0));
    assert!(market.flow().as_slice().iter().all(|&s| s == 0.0));
    assert!(market.last_demand().iter().all(|&d| d == 0.0));
    assert!(market.last_price().iter().all(|&p| p == 0.0));
    assert_eq!(market.failures(), 0);

    // idempotent
    market.initialize();
    assert_eq!(market.steps(), 0);
}

#[test]
fn supply_and_load_converges_within_budget() {
    let mut market = market(supply_and_load(), convergence_params());
    let converged = market.run(&mut []).unwrap();

    assert!(converged);
    assert!(market.stable());
    // excess halves every round: 4 / 2^12 <= 1e-3
    assert_eq!(market.steps(), 13);
    assert!(market.max_abs_excess() <= 1e-3);
    // clearing price is a * load
    assert_close(market.price(), &[2e-3, 4e-3, 6e-3, 8e-3], 1e-5);
}

#[test]
fn convergence_on_the_last_budgeted_round_counts() {
    let run = |maxsteps: usize| {
        let params = MarketParams {
            maxsteps,
            ..convergence_params()
        };
        let mut market = market(supply_and_load(), params);
        let converged = market.run(&mut []).unwrap();
        (converged, market.steps())
    };

    assert_eq!(run(13), (true, 13));
    assert_eq!(run(12), (false, 12));
}

#[test]
fn budget_exhaustion_runs_exactly_maxsteps() {
    let params = MarketParams {
        maxsteps: 5,
        stepsize: Param::Constant(1e-4),
        ..convergence_params()
    };
    let mut market = market(supply_and_load(), params);
    let converged = market.run(&mut []).unwrap();

    assert!(!converged);
    assert!(!market.stable());
    assert_eq!(market.steps(), 5);
}

#[test]
fn run_executes_at_least_one_round() {
    // Already balanced at zero flow: stable before the first round.
    let set = DeviceSet::new(vec![Box::new(ConstantAgent {
        id: "idle".into(),
        row: vec![0.0, 0.0],
    })])
    .unwrap();
    let mut market = market(set, convergence_params());
    assert!(market.run(&mut []).unwrap());
    assert_eq!(market.steps(), 1);
}

#[test]
fn events_fire_in_lifecycle_order() {
    let mut events = Vec::new();
    let mut record = |m: &Market, e: Event| events.push((e, m.steps()));
    let mut market = market(supply_and_load(), convergence_params());
    market.run(&mut [&mut record]).unwrap();

    assert_eq!(events[0], (Event::AfterInit, 0));
    assert_eq!(events[1], (Event::BeforeStart, 0));
    assert_eq!(events.last(), Some(&(Event::AfterDone, 13)));
    let after_steps: Vec<usize> = events
        .iter()
        .filter(|(e, _)| *e == Event::AfterStep)
        .map(|(_, s)| *s)
        .collect();
    assert_eq!(after_steps, (1..=13).collect::<Vec<_>>());
}

#[test]
fn step_counter_is_monotonic_across_recovered_failures() {
    let set = DeviceSet::new(vec![
        Box::new(FailingAgent::recoverable("flaky", vec![1.0, 1.0])) as Box<dyn Agent>,
        fixed_load("base", vec![1.0, 1.0]),
    ])
    .unwrap();
    let params = MarketParams {
        maxsteps: 4,
        failure_policy: FailurePolicy::Retry,
        ..MarketParams::default()
    };
    let mut seen = Vec::new();
    let mut record = |m: &Market, e: Event| {
        if e == Event::AfterStep {
            seen.push((m.steps(), m.last_round_stats().recovered.clone()));
        }
    };
    let mut market = market(set, params);
    market.run(&mut [&mut record]).unwrap();

    let steps: Vec<usize> = seen.iter().map(|(s, _)| *s).collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);
    assert!(seen.iter().all(|(_, recovered)| recovered == &["flaky".to_string()]));
    assert_eq!(market.failures(), 0);
    assert_close(market.flow().row(0), &[1.0, 1.0], 0.0);
}

#[test]
fn prox_is_disabled_on_round_zero() {
    let agent = Arc::new(RecordingAgent::new("rec", vec![1.0, 1.0]));
    let set = DeviceSet::new(vec![Box::new(Shared(Arc::clone(&agent)))]).unwrap();
    let params = MarketParams {
        maxsteps: 3,
        prox: Some("1 + steps".parse().unwrap()),
        ..MarketParams::default()
    };
    let mut market = market(set, params);
    market.run(&mut []).unwrap();

    // the expression is 1 at step 0, but round 0 still gets no prox
    assert_eq!(agent.prox_history(), vec![None, Some(2.0), Some(3.0)]);
}

#[test]
fn negative_prox_is_rejected_before_the_round() {
    let params = MarketParams {
        prox: Some("1 - steps".parse().unwrap()),
        ..convergence_params()
    };
    let mut market = market(supply_and_load(), params);
    let err = market.run(&mut []).unwrap_err();

    // 0 at step 1 is allowed, -1 at step 2 is not
    assert!(matches!(err, MarketError::NegativeProx { steps: 2, value } if value == -1.0));
    assert_eq!(market.steps(), 2);
}

#[test]
fn rows_are_placed_by_agent_index_not_completion_order() {
    // later agents finish first
    let agents: Vec<Box<dyn Agent>> = (0..4)
        .map(|i| {
            Box::new(DelayedAgent::new(&format!("a{i}"), 40 - 10 * i as u64, i as f64, 3))
                as Box<dyn Agent>
        })
        .collect();
    let set = DeviceSet::new(agents).unwrap();
    let params = MarketParams {
        maxsteps: 1,
        ..MarketParams::default()
    };
    let mut market = market(set, params);
    market.run(&mut []).unwrap();

    for i in 0..4 {
        assert_close(market.flow().row(i), &[i as f64; 3], 0.0);
    }
}

#[test]
fn fallback_keeps_prior_rows_and_counts_failures() {
    let set = DeviceSet::new(vec![
        Box::new(FailingAgent::broken("broken", 2)) as Box<dyn Agent>,
        fixed_load("base", vec![1.0, 2.0]),
    ])
    .unwrap();
    let params = MarketParams {
        maxsteps: 3,
        ..MarketParams::default()
    };
    let mut market = market(set, params);
    let converged = market.run(&mut []).unwrap();

    assert!(!converged);
    assert_eq!(market.steps(), 3);
    assert_eq!(market.failures(), 3);
    assert_close(market.flow().row(0), &[0.0, 0.0], 0.0);
    assert_close(market.flow().row(1), &[1.0, 2.0], 0.0);
    let failed = &market.last_round_stats().failed;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].agent, "broken");
}

#[test]
fn retry_falls_back_when_relaxed_solve_also_fails() {
    let set = DeviceSet::new(vec![
        Box::new(FailingAgent::broken("broken", 2)) as Box<dyn Agent>,
        fixed_load("base", vec![1.0, 2.0]),
    ])
    .unwrap();
    let params = MarketParams {
        maxsteps: 2,
        failure_policy: FailurePolicy::Retry,
        ..MarketParams::default()
    };
    let mut market = market(set, params);
    market.run(&mut []).unwrap();

    assert_eq!(market.failures(), 2);
    assert!(market.last_round_stats().recovered.is_empty());
}

#[test]
fn abort_policy_fails_the_round_without_advancing() {
    let set = DeviceSet::new(vec![
        Box::new(FailingAgent::broken("broken", 2)) as Box<dyn Agent>,
        fixed_load("base", vec![1.0, 2.0]),
    ])
    .unwrap();
    let params = MarketParams {
        failure_policy: FailurePolicy::Abort,
        ..MarketParams::default()
    };
    let mut market = market(set, params);
    let err = market.run(&mut []).unwrap_err();

    match err {
        MarketError::AgentFailed { steps, source } => {
            assert_eq!(steps, 0);
            assert_eq!(source.agent(), "broken");
        }
        other => panic!("expected AgentFailed, got {other}"),
    }
    assert_eq!(market.steps(), 0);
}

#[test]
fn panicking_agent_falls_back_to_prior_rows() {
    let set = DeviceSet::new(vec![
        Box::new(PanickingAgent::new("faulty", 2)) as Box<dyn Agent>,
        fixed_load("base", vec![1.0, 2.0]),
    ])
    .unwrap();
    let params = MarketParams {
        maxsteps: 2,
        ..MarketParams::default()
    };
    let mut market = market(set, params);
    let converged = market.run(&mut []).unwrap();

    assert!(!converged);
    assert_eq!(market.steps(), 2);
    assert_eq!(market.failures(), 2);
    assert_close(market.flow().row(0), &[0.0, 0.0], 0.0);
    assert_close(market.flow().row(1), &[1.0, 2.0], 0.0);
    let failed = &market.last_round_stats().failed;
    assert!(matches!(
        &failed[0].error,
        SolveError::Panicked { agent, message } if agent == "faulty" && message.contains("lost its model")
    ));
}

#[test]
fn panicking_agent_under_abort_fails_the_round() {
    let set = DeviceSet::new(vec![
        fixed_load("base", vec![1.0, 2.0]),
        Box::new(PanickingAgent::new("faulty", 2)) as Box<dyn Agent>,
    ])
    .unwrap();
    let params = MarketParams {
        failure_policy: FailurePolicy::Abort,
        ..MarketParams::default()
    };
    let mut market = market(set, params);
    let err = market.run(&mut []).unwrap_err();

    assert!(matches!(
        err,
        MarketError::AgentFailed { steps: 0, source: SolveError::Panicked { .. } }
    ));
    assert_eq!(market.steps(), 0);
}

#[test]
fn non_finite_stepsize_is_a_parameter_error() {
    let params = MarketParams {
        stepsize: "1 / (steps - 1)".parse().unwrap(),
        ..convergence_params()
    };
    let mut market = market(supply_and_load(), params);
    let err = market.run(&mut []).unwrap_err();
    assert!(matches!(err, MarketError::Parameter { name: "stepsize", steps: 1 }));
    assert_eq!(market.steps(), 1);
}

#[test]
fn limited_minimization_converges_more_slowly() {
    let params = MarketParams {
        agent_strategy: AgentStrategy::LimitedMinimization,
        maxsteps: 100,
        ..convergence_params()
    };
    let mut market = market(supply_and_load(), params);
    assert!(market.run(&mut []).unwrap());
    assert!(market.steps() > 13);
}

#[test]
fn asynchronous_rule_is_reproducible_for_a_seed() {
    let run = |seed: u64| {
        let params = MarketParams {
            price_rule: PriceRule::Asynchronous,
            maxsteps: 8,
            seed,
            ..convergence_params()
        };
        let mut market = market(supply_and_load(), params);
        market.run(&mut []).unwrap();
        market.price().to_vec()
    };
    assert_eq!(run(7), run(7));
}

#[test]
fn normalized_rule_moves_price_by_stepsize() {
    let params = MarketParams {
        price_rule: PriceRule::Normalized,
        maxsteps: 1,
        stepsize: Param::Constant(0.5),
        ..convergence_params()
    };
    let mut market = market(supply_and_load(), params);
    market.run(&mut []).unwrap();
    let norm = market.price().iter().map(|p| p * p).sum::<f64>().sqrt();
    assert!((norm - 0.5).abs() < 1e-12);
}

#[test]
fn listener_error_ends_the_run() {
    struct Stop;
    impl Listener for Stop {
        fn notify(&mut self, market: &Market, event: Event) -> Result<(), MarketError> {
            if event == Event::AfterStep && market.steps() == 2 {
                return Err(MarketError::Config(
                    power_market_sim::error::ConfigError::new("test", "stop"),
                ));
            }
            Ok(())
        }
    }
    let mut market = market(supply_and_load(), convergence_params());
    assert!(market.run(&mut [&mut Stop]).is_err());
    assert_eq!(market.steps(), 2);
}
