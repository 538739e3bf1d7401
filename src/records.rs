// FQLab: Network-Emulation Experiments for Fair-Queuing Detection in Congestion Control
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Storage of per-sample results and persistence of the metric grids.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::shaping::QueueDiscipline;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// The three metrics of one valid sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellSample {
    pub accuracy: f64,
    pub throughput_mbit: f64,
    pub delay_offset_ms: f64,
}

/// The delay-index × rate-index × repetition-index result store for one
/// (queue-discipline, congestion-control) pair.
///
/// Grown incrementally; a cell holds exactly the configured number of valid repetitions
/// once the sweep over it is complete.
#[derive(Clone, Debug)]
pub struct ResultGrid {
    delays_ms: Vec<f64>,
    rates_mbit: Vec<f64>,
    cells: Vec<Vec<Vec<CellSample>>>,
}

impl ResultGrid {
    pub fn new(delays_ms: Vec<f64>, rates_mbit: Vec<f64>) -> Self {
        let cells = vec![vec![Vec::new(); rates_mbit.len()]; delays_ms.len()];
        Self {
            delays_ms,
            rates_mbit,
            cells,
        }
    }

    pub fn delays_ms(&self) -> &[f64] {
        &self.delays_ms
    }

    pub fn rates_mbit(&self) -> &[f64] {
        &self.rates_mbit
    }

    pub fn push(&mut self, delay_idx: usize, rate_idx: usize, sample: CellSample) {
        self.cells[delay_idx][rate_idx].push(sample);
    }

    pub fn samples(&self, delay_idx: usize, rate_idx: usize) -> &[CellSample] {
        &self.cells[delay_idx][rate_idx]
    }

    fn metric(&self, f: impl Fn(&CellSample) -> f64) -> Vec<Vec<Vec<f64>>> {
        self.cells
            .iter()
            .map(|row| row.iter().map(|cell| cell.iter().map(&f).collect()).collect())
            .collect()
    }

    /// Persist the three metric grids, one literal nested-sequence text file per metric,
    /// keyed by queue discipline and congestion-control name.
    pub fn persist(
        &self,
        dir: &Path,
        qdisc: &QueueDiscipline,
        congestion_control: &str,
    ) -> Result<Vec<PathBuf>, PersistError> {
        std::fs::create_dir_all(dir)?;

        let grids = [
            ("accuracy", self.metric(|s| s.accuracy)),
            ("throughput", self.metric(|s| s.throughput_mbit)),
            ("delay_offset", self.metric(|s| s.delay_offset_ms)),
        ];

        let mut paths = Vec::with_capacity(grids.len());
        for (metric, grid) in grids {
            let path = dir.join(format!("{metric}_{qdisc}_{congestion_control}.txt"));
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            writeln!(file, "{}", serde_json::to_string(&grid)?)?;
            paths.push(path);
        }

        Ok(paths)
    }
}

/// One CSV row per valid sample, for offline analysis across runs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SampleRecord {
    /// Execution timestamp identifying the sample.
    pub sample_id: String,
    pub delay_ms: f64,
    pub rate_mbit: f64,
    pub queue_discipline: String,
    pub congestion_control: String,
    /// How many runs this cell had taken when the sample was recorded, including invalid
    /// ones.
    pub attempt: usize,
    pub accuracy: f64,
    pub throughput_mbit: f64,
    pub delay_offset_ms: f64,
}

/// Append a record to the per-sample CSV, writing the header only when creating the file.
pub fn append_sample_record(path: &Path, record: &SampleRecord) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let write_header = !path.exists();
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let mut csv = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    csv.serialize(record)?;
    csv.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(accuracy: f64) -> CellSample {
        CellSample {
            accuracy,
            throughput_mbit: 9.5,
            delay_offset_ms: 1.25,
        }
    }

    #[test]
    fn grid_grows_per_cell() {
        let mut grid = ResultGrid::new(vec![10.0, 50.0], vec![10.0, 100.0]);
        grid.push(0, 1, sample(0.5));
        grid.push(0, 1, sample(0.75));
        assert_eq!(grid.samples(0, 1).len(), 2);
        assert!(grid.samples(1, 0).is_empty());
    }

    #[test]
    fn persisted_grids_are_nested_sequences() {
        let tmp = tempfile::tempdir().unwrap();
        let mut grid = ResultGrid::new(vec![10.0], vec![10.0, 100.0]);
        grid.push(0, 0, sample(0.5));
        grid.push(0, 0, sample(1.0));
        grid.push(0, 1, sample(0.25));

        let paths = grid
            .persist(tmp.path(), &QueueDiscipline::FairQueue, "tonopah")
            .unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths[0].ends_with("accuracy_fq_tonopah.txt"));

        let accuracy = std::fs::read_to_string(&paths[0]).unwrap();
        assert_eq!(accuracy.trim(), "[[[0.5,1.0],[0.25]]]");

        let throughput = std::fs::read_to_string(&paths[1]).unwrap();
        assert_eq!(throughput.trim(), "[[[9.5,9.5],[9.5]]]");
    }

    #[test]
    fn sample_records_append_with_single_header() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("samples.csv");
        let record = SampleRecord {
            sample_id: "2025-01-01_00-00-00".to_string(),
            delay_ms: 10.0,
            rate_mbit: 100.0,
            queue_discipline: "fq".to_string(),
            congestion_control: "tonopah".to_string(),
            attempt: 1,
            accuracy: 0.5,
            throughput_mbit: 90.0,
            delay_offset_ms: 0.5,
        };
        append_sample_record(&path, &record).unwrap();
        append_sample_record(&path, &record).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sample_id,delay_ms,rate_mbit"));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let parsed: Vec<SampleRecord> =
            reader.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed, vec![record.clone(), record]);
    }
}
