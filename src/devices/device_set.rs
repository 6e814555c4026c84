use std::fmt;
use std::ops::Range;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::devices::types::Agent;
use crate::error::ConfigError;

/// Key carrying the type tag in serialized records.
pub const TYPE_KEY: &str = "_type";

/// Ordered, immutable collection of market agents.
///
/// Agent `i` owns the contiguous row range `slices()[i]` of the market's flow
/// matrix; ranges are assigned in agent order when the set is built.
pub struct DeviceSet {
    agents: Vec<Box<dyn Agent>>,
    slices: Vec<Range<usize>>,
    time_slots: usize,
}

impl DeviceSet {
    /// Checkpoint type tag.
    pub const TYPE_TAG: &'static str = "power_market_sim::devices::DeviceSet";

    /// Builds a device set and assigns row ranges.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `agents` is empty, an agent owns no rows or
    /// no time slots, agents disagree on the number of time slots, or two
    /// agents share an id.
    pub fn new(agents: Vec<Box<dyn Agent>>) -> Result<Self, ConfigError> {
        let Some(first) = agents.first() else {
            return Err(ConfigError::new("agents", "at least one agent is required"));
        };
        let time_slots = first.time_slots();

        let mut slices = Vec::with_capacity(agents.len());
        let mut next = 0;
        for (i, agent) in agents.iter().enumerate() {
            let field = format!("agents.{}", agent.id());
            if agent.rows() == 0 || agent.time_slots() == 0 {
                return Err(ConfigError::new(field, "agent must own at least one row and slot"));
            }
            if agent.time_slots() != time_slots {
                return Err(ConfigError::new(
                    field,
                    format!(
                        "agent has {} time slots, expected {time_slots}",
                        agent.time_slots()
                    ),
                ));
            }
            if agents[..i].iter().any(|a| a.id() == agent.id()) {
                return Err(ConfigError::new(field, "duplicate agent id"));
            }
            slices.push(next..next + agent.rows());
            next += agent.rows();
        }

        Ok(Self {
            agents,
            slices,
            time_slots,
        })
    }

    pub fn num_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn time_slots(&self) -> usize {
        self.time_slots
    }

    /// Total number of flow rows.
    pub fn rows(&self) -> usize {
        self.slices.last().map_or(0, |r| r.end)
    }

    /// `(rows, time_slots)` of the aggregate flow matrix.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows(), self.time_slots)
    }

    /// Row range owned by each agent, in agent order.
    pub fn slices(&self) -> &[Range<usize>] {
        &self.slices
    }

    pub fn agents(&self) -> &[Box<dyn Agent>] {
        &self.agents
    }

    /// Iterates over `(agent, row range)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&dyn Agent, &Range<usize>)> {
        self.agents
            .iter()
            .map(|a| &**a)
            .zip(self.slices.iter())
    }

    /// Row labels in matrix order.
    pub fn row_ids(&self) -> Vec<String> {
        self.agents.iter().flat_map(|a| a.row_ids()).collect()
    }

    /// Total net surplus of the row-major `flow` at `price`.
    pub fn utility(&self, flow: &[f64], price: &[f64]) -> f64 {
        let t = self.time_slots;
        self.iter()
            .map(|(agent, range)| agent.utility(&flow[range.start * t..range.end * t], price))
            .sum()
    }

    /// Tagged JSON form: `{"_type": ..., "agents": [{"_type": ..., ...}]}`.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if an agent cannot be encoded or encodes
    /// to something other than a JSON object.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        let agents = self
            .agents
            .iter()
            .map(|agent| {
                let Value::Object(fields) = agent.to_value()? else {
                    return Err(serde::ser::Error::custom(format!(
                        "agent {} did not encode to an object",
                        agent.id()
                    )));
                };
                let mut tagged = Map::with_capacity(fields.len() + 1);
                tagged.insert(TYPE_KEY.into(), agent.type_tag().into());
                tagged.extend(fields);
                Ok(Value::Object(tagged))
            })
            .collect::<serde_json::Result<Vec<_>>>()?;

        let mut record = Map::new();
        record.insert(TYPE_KEY.into(), Self::TYPE_TAG.into());
        record.insert("agents".into(), Value::Array(agents));
        Ok(Value::Object(record))
    }
}

impl Serialize for DeviceSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSet")
            .field("agents", &self.agents)
            .field("shape", &self.shape())
            .finish()
    }
}
