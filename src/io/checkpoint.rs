//! Durable per-round market records.
//!
//! A [`CheckpointWriter`] listener writes `network-{steps}.json` into its
//! directory after initialization and after every round, plus an optional
//! `meta.json`. A [`CheckpointReader`] lists those records in step order and
//! decodes them on demand through a [`TypeRegistry`].

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::devices::DeviceSet;
use crate::error::{CheckpointError, MarketError};
use crate::io::registry::TypeRegistry;
use crate::sim::engine::Market;
use crate::sim::listener::{Event, Listener};
use crate::sim::types::{FlowMatrix, MarketParams};

/// File name of the metadata record.
pub const META_FILE: &str = "meta.json";

/// File name prefix of every round record.
pub const RECORD_PREFIX: &str = "network-";
const RECORD_SUFFIX: &str = ".json";

/// Serialized view of a market, borrowed for the duration of a write.
#[derive(Serialize)]
struct MarketRecord<'a> {
    #[serde(rename = "_type")]
    type_tag: &'static str,
    deviceset: &'a DeviceSet,
    price: &'a [f64],
    s: &'a FlowMatrix,
    #[serde(flatten)]
    params: &'a MarketParams,
    steps: usize,
    last_demand: &'a [f64],
    last_price: &'a [f64],
}

impl<'a> MarketRecord<'a> {
    fn new(market: &'a Market) -> Self {
        Self {
            type_tag: Market::TYPE_TAG,
            deviceset: market.deviceset(),
            price: market.price(),
            s: market.flow(),
            params: market.params(),
            steps: market.steps(),
            last_demand: market.last_demand(),
            last_price: market.last_price(),
        }
    }
}

/// Untagged scalar part of a market record.
#[derive(Deserialize)]
struct StateFields {
    price: Vec<f64>,
    s: FlowMatrix,
    steps: usize,
    last_demand: Vec<f64>,
    last_price: Vec<f64>,
    #[serde(flatten)]
    params: MarketParams,
}

/// Full engine state restored from one record.
#[derive(Debug)]
pub struct Snapshot {
    pub deviceset: DeviceSet,
    pub params: MarketParams,
    pub steps: usize,
    pub price: Vec<f64>,
    pub s: FlowMatrix,
    pub last_demand: Vec<f64>,
    pub last_price: Vec<f64>,
}

impl Snapshot {
    /// Combines a decoded device set with the remaining record fields.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Decode`] if a field is missing or malformed.
    pub fn from_fields(deviceset: DeviceSet, fields: Value) -> Result<Self, CheckpointError> {
        let state: StateFields = serde_json::from_value(fields)?;
        Ok(Self {
            deviceset,
            params: state.params,
            steps: state.steps,
            price: state.price,
            s: state.s,
            last_demand: state.last_demand,
            last_price: state.last_price,
        })
    }

    /// Rebuilds a market from this snapshot.
    ///
    /// # Errors
    ///
    /// See [`Market::from_snapshot`].
    pub fn into_market(self) -> Result<Market, CheckpointError> {
        Market::from_snapshot(self)
    }
}

/// Reads and decodes a single record file.
///
/// # Errors
///
/// Returns a [`CheckpointError`] on I/O failure, malformed JSON or an
/// undecodable record.
pub fn read_snapshot(path: &Path, registry: &TypeRegistry) -> Result<Snapshot, CheckpointError> {
    let value = read_json(path)?;
    registry.decode_snapshot(value)
}

fn read_json(path: &Path) -> Result<Value, CheckpointError> {
    let text = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, pretty: bool) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    let encoded = if pretty {
        serde_json::to_writer_pretty(&mut out, value)
    } else {
        serde_json::to_writer(&mut out, value)
    };
    encoded.map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    out.flush().map_err(io_err)
}

/// Listener that persists the market after initialization and every round.
#[derive(Debug)]
pub struct CheckpointWriter {
    dir: PathBuf,
    pretty: bool,
    written: usize,
}

impl CheckpointWriter {
    /// Creates `dir` (and parents) if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            pretty: false,
            written: 0,
        })
    }

    /// Like [`CheckpointWriter::new`], and writes `meta` as `meta.json`.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckpointError`] if the directory or metadata file cannot
    /// be written.
    pub fn with_meta(dir: impl Into<PathBuf>, meta: &Value) -> Result<Self, CheckpointError> {
        let writer = Self::new(dir)?;
        write_json(&writer.dir.join(META_FILE), meta, true)?;
        Ok(writer)
    }

    /// Indents records for reading by eye.
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of records written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Path of the record for round `steps`.
    pub fn record_path(&self, steps: usize) -> PathBuf {
        self.dir.join(format!("{RECORD_PREFIX}{steps}{RECORD_SUFFIX}"))
    }

    /// Writes the current state of `market`, replacing any record of the same step.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckpointError`] if encoding or writing fails.
    pub fn write(&mut self, market: &Market) -> Result<PathBuf, CheckpointError> {
        let path = self.record_path(market.steps());
        write_json(&path, &MarketRecord::new(market), self.pretty)?;
        self.written += 1;
        info!(path = %path.display(), steps = market.steps(), "checkpoint written");
        Ok(path)
    }
}

impl Listener for CheckpointWriter {
    fn notify(&mut self, market: &Market, event: Event) -> Result<(), MarketError> {
        match event {
            Event::AfterInit | Event::AfterStep => {
                self.write(market)?;
            }
            Event::BeforeStart | Event::AfterDone => {}
        }
        Ok(())
    }
}

/// Step index carried by a record file name, `None` if it is not a record.
///
/// # Errors
///
/// Returns [`CheckpointError::BadRecordName`] for `network-*.json` names whose
/// middle part is not a step number.
fn record_step(path: &Path) -> Result<Option<usize>, CheckpointError> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let Some(middle) = name
        .strip_prefix(RECORD_PREFIX)
        .and_then(|rest| rest.strip_suffix(RECORD_SUFFIX))
    else {
        return Ok(None);
    };
    if middle.is_empty() || !middle.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CheckpointError::BadRecordName(path.to_path_buf()));
    }
    middle
        .parse()
        .map(Some)
        .map_err(|_| CheckpointError::BadRecordName(path.to_path_buf()))
}

/// Ordered, random-access view over a checkpoint directory.
///
/// Records are decoded lazily; the listing is taken once at [`CheckpointReader::open`].
#[derive(Debug)]
pub struct CheckpointReader {
    dir: PathBuf,
    meta: Option<Value>,
    records: Vec<(usize, PathBuf)>,
    registry: TypeRegistry,
}

impl CheckpointReader {
    /// Lists the records of `dir`, sorted by step index.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::NotADirectory`] if `dir` is not a directory
    /// - [`CheckpointError::BadRecordName`] for a record without a numeric step
    /// - [`CheckpointError::Invalid`] if two records carry the same step
    /// - [`CheckpointError::Io`] / [`CheckpointError::Json`] if listing or metadata fails
    pub fn open(dir: impl Into<PathBuf>, registry: TypeRegistry) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(CheckpointError::NotADirectory(dir));
        }
        let io_err = |source| CheckpointError::Io {
            path: dir.clone(),
            source,
        };

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if let Some(step) = record_step(&path)? {
                records.push((step, path));
            }
        }
        records.sort_by_key(|(step, _)| *step);
        if let Some(pair) = records.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(CheckpointError::Invalid(format!(
                "records {} and {} share step {}",
                pair[0].1.display(),
                pair[1].1.display(),
                pair[0].0
            )));
        }

        let meta_path = dir.join(META_FILE);
        let meta = if meta_path.is_file() {
            Some(read_json(&meta_path)?)
        } else {
            None
        };
        debug!(dir = %dir.display(), records = records.len(), "checkpoint directory opened");

        Ok(Self {
            dir,
            meta,
            records,
            registry,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Metadata record, if the directory has one.
    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// Step index of every record, ascending.
    pub fn steps(&self) -> Vec<usize> {
        self.records.iter().map(|(step, _)| *step).collect()
    }

    /// Record paths, in step order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.records.iter().map(|(_, path)| path.as_path())
    }

    /// Decodes records in step order. Each call starts from the first record.
    pub fn iter(&self) -> impl Iterator<Item = Result<Snapshot, CheckpointError>> + '_ {
        self.records
            .iter()
            .map(|(_, path)| read_snapshot(path, &self.registry))
    }

    /// Decodes the `index`-th record in step order.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::OutOfRange`] if there is no such record, or
    /// any decoding error.
    pub fn get(&self, index: usize) -> Result<Snapshot, CheckpointError> {
        let (_, path) = self.records.get(index).ok_or(CheckpointError::OutOfRange {
            index,
            len: self.records.len(),
        })?;
        read_snapshot(path, &self.registry)
    }

    /// First record (the initial state when written by a full run).
    ///
    /// # Errors
    ///
    /// Same as [`CheckpointReader::get`].
    pub fn first(&self) -> Result<Snapshot, CheckpointError> {
        self.get(0)
    }

    /// Last record.
    ///
    /// # Errors
    ///
    /// Same as [`CheckpointReader::get`].
    pub fn last(&self) -> Result<Snapshot, CheckpointError> {
        self.get(self.records.len().saturating_sub(1))
    }
}
