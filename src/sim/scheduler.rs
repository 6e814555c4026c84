//! Parallel fan-out of one solve job per agent, with ordered reassembly.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::devices::{Agent, DeviceSet, SolveError, SolverOptions};
use crate::error::MarketError;
use crate::sim::types::{AgentStrategy, FailurePolicy, FlowMatrix};

/// How jobs in a round are solved and how failures are handled.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPlan {
    pub strategy: AgentStrategy,
    pub options: SolverOptions,
    pub policy: FailurePolicy,
}

/// An agent solve that failed this round; its prior rows were kept.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentFailure {
    pub agent: String,
    pub error: SolveError,
}

/// Per-round failure bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundStats {
    /// Agents whose rows fell back to the prior flow.
    pub failed: Vec<AgentFailure>,
    /// Agents that succeeded only on the relaxed retry.
    pub recovered: Vec<String>,
}

/// Result of a dispatched round.
#[derive(Debug, Clone)]
pub struct RoundOutput {
    pub flow: FlowMatrix,
    pub stats: RoundStats,
}

/// One unit of work: an agent, the broadcast price and a private copy of
/// the agent's prior rows.
struct AgentJob<'a> {
    index: usize,
    agent: &'a dyn Agent,
    price: &'a [f64],
    prior: Vec<f64>,
    prox: Option<f64>,
}

struct JobOutcome {
    index: usize,
    result: Result<Vec<f64>, SolveError>,
    retried: bool,
}

impl AgentJob<'_> {
    fn solve(&self, strategy: AgentStrategy, options: &SolverOptions) -> Result<Vec<f64>, SolveError> {
        // a panicking agent is an ordinary failed solve
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| match strategy {
            AgentStrategy::PointBid => self.agent.solve(self.price, &self.prior, self.prox, options),
            AgentStrategy::LimitedMinimization => self.agent.step(self.price, &self.prior, options),
        }));
        let flow = attempt.unwrap_or_else(|payload| {
            Err(SolveError::Panicked {
                agent: self.agent.id().to_string(),
                message: panic_message(payload.as_ref()),
            })
        })?;
        if flow.len() != self.prior.len() {
            return Err(SolveError::ShapeMismatch {
                agent: self.agent.id().to_string(),
                expected: self.prior.len(),
                actual: flow.len(),
            });
        }
        Ok(flow)
    }

    fn run(self, plan: DispatchPlan) -> JobOutcome {
        let first = self.solve(plan.strategy, &plan.options);
        let (result, retried) = match first {
            Err(e) if plan.policy == FailurePolicy::Retry => {
                debug!(agent = self.agent.id(), error = %e, "retrying with relaxed solver options");
                (self.solve(plan.strategy, &plan.options.relaxed()), true)
            }
            other => (other, false),
        };
        JobOutcome {
            index: self.index,
            result,
            retried,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fixed-size worker pool that runs one round at a time.
///
/// Every call to [`RoundScheduler::dispatch`] is a full barrier: it returns
/// only after every job of the round has reported back.
pub struct RoundScheduler {
    pool: ThreadPool,
}

impl RoundScheduler {
    /// Builds a pool with `workers` threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns the rayon build error if the threads cannot be spawned.
    pub fn new(workers: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("agent-worker-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Solves every agent against `price` and assembles the new flow matrix.
    ///
    /// Jobs finish in any order; each result is placed by its agent's row
    /// range. Failed solves, including agents that panic, are handled
    /// according to `plan.policy`.
    ///
    /// # Arguments
    ///
    /// * `deviceset` - Agents and their row ranges
    /// * `price` - Broadcast price, shared read-only by all jobs
    /// * `prior` - Flow matrix of the previous round; each job gets a copy of its rows
    /// * `prox` - Proximal weight, `None` to disable
    /// * `plan` - Strategy, solver options and failure policy
    /// * `steps` - Current round, for error reporting
    ///
    /// # Errors
    ///
    /// - [`MarketError::AgentFailed`] for the lowest-index failure under [`FailurePolicy::Abort`]
    /// - [`MarketError::IncompleteRound`] if a job never reported back
    pub fn dispatch(
        &self,
        deviceset: &DeviceSet,
        price: &[f64],
        prior: &FlowMatrix,
        prox: Option<f64>,
        plan: DispatchPlan,
        steps: usize,
    ) -> Result<RoundOutput, MarketError> {
        let jobs: Vec<AgentJob<'_>> = deviceset
            .iter()
            .enumerate()
            .map(|(index, (agent, range))| AgentJob {
                index,
                agent,
                price,
                prior: prior.rows_slice(range).to_vec(),
                prox,
            })
            .collect();

        let (tx, rx) = mpsc::channel();
        self.pool.scope(|scope| {
            for job in jobs {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    // the receiver outlives the scope
                    let _ = tx.send(job.run(plan));
                });
            }
        });
        drop(tx);

        let mut outcomes: Vec<Option<JobOutcome>> = (0..deviceset.num_agents()).map(|_| None).collect();
        let mut received = 0;
        for outcome in rx {
            let index = outcome.index;
            outcomes[index] = Some(outcome);
            received += 1;
        }
        if received != deviceset.num_agents() {
            return Err(MarketError::IncompleteRound {
                steps,
                received,
                expected: deviceset.num_agents(),
            });
        }

        let mut flow = prior.clone();
        let mut stats = RoundStats::default();
        for ((agent, range), outcome) in deviceset.iter().zip(outcomes.into_iter().flatten()) {
            match outcome.result {
                Ok(rows) => {
                    flow.rows_slice_mut(range).copy_from_slice(&rows);
                    if outcome.retried {
                        stats.recovered.push(agent.id().to_string());
                    }
                }
                Err(error) if plan.policy == FailurePolicy::Abort => {
                    return Err(MarketError::AgentFailed {
                        steps,
                        source: error,
                    });
                }
                Err(error) => {
                    warn!(agent = agent.id(), steps, error = %error, "agent solve failed, keeping prior flow");
                    stats.failed.push(AgentFailure {
                        agent: agent.id().to_string(),
                        error,
                    });
                }
            }
        }
        Ok(RoundOutput { flow, stats })
    }
}
