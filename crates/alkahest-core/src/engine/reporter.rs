//! Multi-state trajectory storage and checkpointing.
//!
//! The reporter persists one record per sampler iteration (replica state
//! assignments plus the full reduced-potential matrix) to a storage file,
//! and a paired checkpoint file holding the latest sampler states. Records
//! are encoded as one JSON document per line so a partially written file
//! remains readable up to its last complete record.

use super::error::EngineError;
use super::states::SamplerState;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One sampler iteration as persisted to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Thermodynamic state index occupied by each replica.
    pub replica_states: Vec<usize>,
    /// Reduced potentials `u[replica][state]`.
    pub reduced_potentials: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub iteration: usize,
    pub replica_states: Vec<usize>,
    pub sampler_states: Vec<SamplerState>,
}

pub struct MultiStateReporter {
    storage_path: PathBuf,
    checkpoint_path: PathBuf,
    checkpoint_interval: usize,
    writer: Option<BufWriter<File>>,
}

impl MultiStateReporter {
    /// Creates the storage file and prepares the paired checkpoint path.
    pub fn new(
        storage_path: PathBuf,
        checkpoint_path: PathBuf,
        checkpoint_interval: usize,
    ) -> Result<Self, EngineError> {
        let file = File::create(&storage_path)
            .map_err(|e| EngineError::storage(storage_path.clone(), e))?;
        Ok(Self {
            storage_path,
            checkpoint_path,
            checkpoint_interval,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn write_iteration(&mut self, record: &IterationRecord) -> Result<(), EngineError> {
        let line = serde_json::to_string(record)?;
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{line}")
                .map_err(|e| EngineError::storage(self.storage_path.clone(), e))?;
        }
        Ok(())
    }

    /// Writes a checkpoint if `iteration` falls on the checkpoint interval.
    pub fn maybe_checkpoint(
        &mut self,
        iteration: usize,
        replica_states: &[usize],
        sampler_states: &[SamplerState],
    ) -> Result<(), EngineError> {
        if iteration == 0 || iteration % self.checkpoint_interval != 0 {
            return Ok(());
        }
        self.write_checkpoint(iteration, replica_states, sampler_states)
    }

    pub fn write_checkpoint(
        &mut self,
        iteration: usize,
        replica_states: &[usize],
        sampler_states: &[SamplerState],
    ) -> Result<(), EngineError> {
        let record = CheckpointRecord {
            iteration,
            replica_states: replica_states.to_vec(),
            sampler_states: sampler_states.to_vec(),
        };
        let file = File::create(&self.checkpoint_path)
            .map_err(|e| EngineError::storage(self.checkpoint_path.clone(), e))?;
        serde_json::to_writer(BufWriter::new(file), &record)?;
        Ok(())
    }

    /// Flushes and closes the storage writer.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| EngineError::storage(self.storage_path.clone(), e))?;
        }
        Ok(())
    }

    /// Closes and removes both files. Used by dry runs so a validation-only
    /// pass leaves nothing behind.
    pub fn close_and_delete(&mut self) -> Result<(), EngineError> {
        self.close()?;
        for path in [&self.storage_path, &self.checkpoint_path] {
            if path.exists() {
                fs::remove_file(path).map_err(|e| EngineError::storage(path.clone(), e))?;
            }
        }
        Ok(())
    }

    /// Appends a record to an analysis sidecar file.
    pub fn append_json_line<T: Serialize>(path: &Path, record: &T) -> Result<(), EngineError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::storage(path.to_path_buf(), e))?;
        let mut writer = BufWriter::new(file);
        let line = serde_json::to_string(record)?;
        writeln!(writer, "{line}").map_err(|e| EngineError::storage(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn read_iterations(path: &Path) -> Result<Vec<IterationRecord>, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::storage(path.to_path_buf(), e))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| EngineError::storage(path.to_path_buf(), e))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// The per-iteration replica-to-state assignment timeseries.
    pub fn read_replica_thermodynamic_states(
        path: &Path,
    ) -> Result<Vec<Vec<usize>>, EngineError> {
        Ok(Self::read_iterations(path)?
            .into_iter()
            .map(|r| r.replica_states)
            .collect())
    }

    pub fn read_last_checkpoint(path: &Path) -> Result<CheckpointRecord, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::storage(path.to_path_buf(), e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use tempfile::TempDir;

    fn test_record(iteration: usize) -> IterationRecord {
        IterationRecord {
            iteration,
            replica_states: vec![0, 1],
            reduced_potentials: vec![vec![0.1, 0.2], vec![0.3, 0.4]],
        }
    }

    #[test]
    fn iterations_round_trip_through_storage() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("leg.nc");
        let checkpoint = dir.path().join("leg_checkpoint.nc");

        let mut reporter = MultiStateReporter::new(storage.clone(), checkpoint, 10).unwrap();
        reporter.write_iteration(&test_record(1)).unwrap();
        reporter.write_iteration(&test_record(2)).unwrap();
        reporter.close().unwrap();

        let records = MultiStateReporter::read_iterations(&storage).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], test_record(1));

        let states = MultiStateReporter::read_replica_thermodynamic_states(&storage).unwrap();
        assert_eq!(states, vec![vec![0, 1], vec![0, 1]]);
    }

    #[test]
    fn checkpoints_are_written_on_the_interval() {
        let dir = TempDir::new().unwrap();
        let checkpoint = dir.path().join("leg_checkpoint.nc");
        let mut reporter =
            MultiStateReporter::new(dir.path().join("leg.nc"), checkpoint.clone(), 5).unwrap();

        let sampler_states = vec![SamplerState::new(vec![Vector3::zeros()])];
        reporter.maybe_checkpoint(3, &[0], &sampler_states).unwrap();
        assert!(!checkpoint.exists());

        reporter.maybe_checkpoint(5, &[0], &sampler_states).unwrap();
        assert!(checkpoint.exists());

        let record = MultiStateReporter::read_last_checkpoint(&checkpoint).unwrap();
        assert_eq!(record.iteration, 5);
        assert_eq!(record.sampler_states.len(), 1);
    }

    #[test]
    fn close_and_delete_removes_both_files() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("leg.nc");
        let checkpoint = dir.path().join("leg_checkpoint.nc");

        let mut reporter =
            MultiStateReporter::new(storage.clone(), checkpoint.clone(), 5).unwrap();
        reporter.write_iteration(&test_record(1)).unwrap();
        reporter
            .write_checkpoint(1, &[0], &[SamplerState::new(vec![Vector3::zeros()])])
            .unwrap();
        assert!(storage.exists());
        assert!(checkpoint.exists());

        reporter.close_and_delete().unwrap();
        assert!(!storage.exists());
        assert!(!checkpoint.exists());
    }
}
