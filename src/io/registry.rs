//! Static mapping from checkpoint type tags to agent decoders.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::devices::device_set::TYPE_KEY;
use crate::devices::{Agent, DeviceAgent, DeviceSet, ProfileLoad};
use crate::error::CheckpointError;
use crate::io::checkpoint::Snapshot;
use crate::sim::engine::Market;

/// Rebuilds an agent from its configuration (the record minus its `_type` tag).
pub type AgentDecoder = fn(Value) -> Result<Box<dyn Agent>, CheckpointError>;

/// Registry of agent types that can be restored from checkpoints.
///
/// # Examples
///
/// ```
/// use power_market_sim::devices::DeviceAgent;
/// use power_market_sim::io::registry::TypeRegistry;
///
/// let registry = TypeRegistry::with_defaults();
/// assert!(registry.contains(DeviceAgent::TYPE_TAG));
/// assert!(!registry.contains("somewhere::Else"));
/// ```
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    decoders: HashMap<String, AgentDecoder>,
}

fn decode_device_agent(value: Value) -> Result<Box<dyn Agent>, CheckpointError> {
    Ok(Box::new(DeviceAgent::from_value(value)?))
}

fn decode_profile_load(value: Value) -> Result<Box<dyn Agent>, CheckpointError> {
    Ok(Box::new(ProfileLoad::from_value(value)?))
}

/// Splits the `_type` tag off a tagged record.
fn untag(value: Value, what: &'static str) -> Result<(String, Map<String, Value>), CheckpointError> {
    let Value::Object(mut fields) = value else {
        return Err(CheckpointError::Invalid(format!("{what} is not a JSON object")));
    };
    match fields.remove(TYPE_KEY) {
        Some(Value::String(tag)) => Ok((tag, fields)),
        Some(_) => Err(CheckpointError::Invalid(format!("{what} `_type` is not a string"))),
        None => Err(CheckpointError::MissingType(what)),
    }
}

impl TypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with every built-in agent type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DeviceAgent::TYPE_TAG, decode_device_agent);
        registry.register(ProfileLoad::TYPE_TAG, decode_profile_load);
        registry
    }

    /// Adds or replaces the decoder for `tag`.
    pub fn register(&mut self, tag: impl Into<String>, decoder: AgentDecoder) -> &mut Self {
        self.decoders.insert(tag.into(), decoder);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decodes one tagged agent record.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::UnknownType`] for unregistered tags, or the
    /// decoder's error.
    pub fn decode_agent(&self, value: Value) -> Result<Box<dyn Agent>, CheckpointError> {
        let (tag, fields) = untag(value, "agent record")?;
        let decoder = self
            .decoders
            .get(&tag)
            .ok_or(CheckpointError::UnknownType(tag))?;
        decoder(Value::Object(fields))
    }

    /// Decodes a tagged device set record.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckpointError`] if the tag is wrong, an agent cannot be
    /// decoded, or the agents do not form a valid device set.
    pub fn decode_deviceset(&self, value: Value) -> Result<DeviceSet, CheckpointError> {
        let (tag, mut fields) = untag(value, "device set record")?;
        if tag != DeviceSet::TYPE_TAG {
            return Err(CheckpointError::UnknownType(tag));
        }
        let Some(Value::Array(records)) = fields.remove("agents") else {
            return Err(CheckpointError::Invalid(
                "device set record has no `agents` array".into(),
            ));
        };
        let agents = records
            .into_iter()
            .map(|r| self.decode_agent(r))
            .collect::<Result<Vec<_>, _>>()?;
        DeviceSet::new(agents).map_err(|e| CheckpointError::Invalid(e.to_string()))
    }

    /// Decodes a full market record.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckpointError`] if the record is not a market record or
    /// any part of it fails to decode.
    pub fn decode_snapshot(&self, value: Value) -> Result<Snapshot, CheckpointError> {
        let (tag, mut fields) = untag(value, "market record")?;
        if tag != Market::TYPE_TAG {
            return Err(CheckpointError::UnknownType(tag));
        }
        let deviceset = fields
            .remove("deviceset")
            .ok_or_else(|| CheckpointError::Invalid("market record has no `deviceset`".into()))?;
        let deviceset = self.decode_deviceset(deviceset)?;
        Snapshot::from_fields(deviceset, Value::Object(fields))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_agent_tag_is_an_error() {
        let err = TypeRegistry::with_defaults()
            .decode_agent(json!({"_type": "other::Agent", "id": "x"}))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownType(tag) if tag == "other::Agent"));
    }

    #[test]
    fn missing_tag_is_an_error() {
        let err = TypeRegistry::with_defaults()
            .decode_agent(json!({"id": "x"}))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::MissingType(_)));
    }

    #[test]
    fn empty_registry_knows_nothing() {
        let err = TypeRegistry::new()
            .decode_agent(json!({"_type": ProfileLoad::TYPE_TAG, "id": "l", "profile_kw": [1.0]}))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownType(_)));
    }

    #[test]
    fn device_set_decodes_from_its_own_value() {
        let set = DeviceSet::new(vec![
            Box::new(ProfileLoad::new("l", vec![1.0, 2.0]).unwrap()),
            Box::new(
                DeviceAgent::single(crate::devices::QuadraticDevice::supplier("g", 1.0, 2))
                    .unwrap(),
            ),
        ])
        .unwrap();
        let value = set.to_value().unwrap();
        let back = TypeRegistry::with_defaults()
            .decode_deviceset(value.clone())
            .unwrap();
        assert_eq!(back.to_value().unwrap(), value);
        assert_eq!(back.slices(), set.slices());
    }

    #[test]
    fn invalid_agent_configuration_is_reported() {
        let err = TypeRegistry::with_defaults()
            .decode_agent(json!({"_type": ProfileLoad::TYPE_TAG, "id": "l", "profile_kw": [-1.0]}))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Decode(_)));
    }
}
