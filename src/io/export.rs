//! CSV export for round traces and flow matrices.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use tracing::info;

use crate::devices::DeviceSet;
use crate::error::CheckpointError;
use crate::io::checkpoint::{CheckpointReader, RECORD_PREFIX};
use crate::sim::kpi::RoundRecord;
use crate::sim::types::FlowMatrix;

/// Column header for the per-round trace.
const TRACE_HEADER: &str = "step,max_abs_excess,mean_price,total_demand,total_supply,\
                            load_factor,total_cost,failed_agents,stable";

/// Exports a round trace to a CSV file at the given path.
///
/// # Arguments
///
/// * `records` - One record per completed round
/// * `path` - Output file path
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_trace_csv(records: &[RoundRecord], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_trace_csv(records, io::BufWriter::new(file))
}

/// Writes a round trace as CSV to any writer.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_trace_csv(records: &[RoundRecord], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(TRACE_HEADER.split(',').map(str::trim))?;

    for r in records {
        wtr.write_record(&[
            r.step.to_string(),
            format!("{:.6e}", r.max_abs_excess),
            format!("{:.6}", r.mean_price),
            format!("{:.4}", r.total_demand),
            format!("{:.4}", r.total_supply),
            format!("{:.4}", r.load_factor),
            format!("{:.6}", r.total_cost),
            r.failed_agents.to_string(),
            r.stable.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Writes a flow matrix as CSV: one row per flow row, labelled with the
/// device set's row ids, one column per time slot.
///
/// Values are written at full precision.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails, or `InvalidInput` if the matrix
/// does not have the device set's shape.
pub fn write_flow_csv(deviceset: &DeviceSet, flow: &FlowMatrix, writer: impl Write) -> io::Result<()> {
    if flow.shape() != deviceset.shape() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "flow matrix is {:?}, device set expects {:?}",
                flow.shape(),
                deviceset.shape()
            ),
        ));
    }
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);

    let header = std::iter::once("row".to_string()).chain((0..flow.cols()).map(|t| format!("t{t}")));
    wtr.write_record(header)?;

    for (label, row) in deviceset.row_ids().into_iter().zip(flow.iter_rows()) {
        let record = std::iter::once(label).chain(row.iter().map(f64::to_string));
        wtr.write_record(record)?;
    }

    wtr.flush()?;
    Ok(())
}

/// Writes a flow matrix CSV to a file at the given path.
///
/// # Errors
///
/// Same as [`write_flow_csv`], plus file creation failures.
pub fn export_flow_csv(deviceset: &DeviceSet, flow: &FlowMatrix, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_flow_csv(deviceset, flow, io::BufWriter::new(file))
}

/// Writes one flow CSV per checkpoint record, `network-{steps}.csv`, into
/// `out_dir`, creating it if needed. Returns the number of files written.
///
/// # Errors
///
/// Returns the first record that fails to decode, or a
/// [`CheckpointError::Io`] naming the file that could not be written.
pub fn export_report(reader: &CheckpointReader, out_dir: &Path) -> Result<usize, CheckpointError> {
    fs::create_dir_all(out_dir).map_err(|source| CheckpointError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let mut written = 0;
    for snapshot in reader.iter() {
        let snapshot = snapshot?;
        let path = out_dir.join(format!("{RECORD_PREFIX}{}.csv", snapshot.steps));
        export_flow_csv(&snapshot.deviceset, &snapshot.s, &path)
            .map_err(|source| CheckpointError::Io { path, source })?;
        written += 1;
    }
    info!(dir = %out_dir.display(), files = written, "flow report written");
    Ok(written)
}
