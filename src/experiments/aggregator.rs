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
//! Sweep over the delay x rate grid, collecting valid samples per cell until the
//! repetition target is met, and persistence of the resulting metric grids.

use std::{future::Future, path::PathBuf, time::Duration};

use indicatif::{ProgressBar, ProgressStyle};
use itertools::iproduct;

use crate::{
    classifier,
    metrics::{MetricError, MetricExtractors},
    node::Node,
    records::{append_sample_record, CellSample, PersistError, ResultGrid, SampleRecord},
    shaping::QueueDiscipline,
};

use super::{ExperimentError, ExperimentRunner, LinkParameters};

/// Valid samples collected per grid cell before moving on.
pub const DEFAULT_REPETITIONS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("experiment failed: {0}")]
    Experiment(#[from] ExperimentError),
    #[error("metric extraction failed: {0}")]
    Metric(#[from] MetricError),
    #[error("could not persist results: {0}")]
    Persist(#[from] PersistError),
}

/// The grid swept by the aggregator, plus everything identifying the result files.
#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub delays_ms: Vec<f64>,
    pub rates_mbit: Vec<f64>,
    pub queue_discipline: QueueDiscipline,
    pub congestion_control: String,
    /// Valid samples required per cell. Invalid samples never count towards this target.
    pub repetitions: usize,
    /// Time budget injected into the transport binary.
    pub max_duration: Duration,
    /// Directory receiving the metric grids and the per-sample CSV.
    pub data_root: PathBuf,
}

/// Explicit retry state of one grid cell: how many runs were attempted, and how many of
/// them yielded a valid sample. Terminal once the target is collected; attempts are
/// uncapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellProgress {
    attempts: usize,
    valid: usize,
    target: usize,
}

impl CellProgress {
    pub fn new(target: usize) -> Self {
        Self {
            attempts: 0,
            valid: 0,
            target,
        }
    }

    pub fn record_valid(&mut self) {
        self.attempts += 1;
        self.valid += 1;
    }

    pub fn record_invalid(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn valid(&self) -> usize {
        self.valid
    }

    pub fn done(&self) -> bool {
        self.valid >= self.target
    }
}

/// Repeats runs over the configured grid and persists the aggregated metrics.
pub struct ResultAggregator<'a, N> {
    runner: &'a ExperimentRunner<N>,
    extractors: MetricExtractors,
    config: SweepConfig,
}

impl<'a, N: Node> ResultAggregator<'a, N> {
    pub fn new(
        runner: &'a ExperimentRunner<N>,
        extractors: MetricExtractors,
        config: SweepConfig,
    ) -> Self {
        Self {
            runner,
            extractors,
            config,
        }
    }

    /// Sweep the whole grid and persist the three metric grids once complete.
    ///
    /// Invalid samples are discarded and the configuration retried on the spot; an
    /// experiment or metric-extraction failure aborts the sweep, as the testbed can no
    /// longer be trusted to produce sound measurements.
    pub async fn sweep(&self) -> Result<ResultGrid, SweepError> {
        let cfg = &self.config;
        let mut grid = ResultGrid::new(cfg.delays_ms.clone(), cfg.rates_mbit.clone());

        let total = cfg.delays_ms.len() * cfg.rates_mbit.len() * cfg.repetitions;
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{wide_bar} {pos}/{len} samples, time: {elapsed}")
                .unwrap(),
        );
        bar.tick();

        let samples_csv = cfg.data_root.join("samples.csv");

        for ((delay_idx, delay), (rate_idx, rate)) in iproduct!(
            cfg.delays_ms.iter().copied().enumerate(),
            cfg.rates_mbit.iter().copied().enumerate()
        ) {
            let params = LinkParameters::new(delay, rate, cfg.queue_discipline.clone());
            log::info!(
                "cell delay={delay}ms rate={rate}mbit qdisc={} cc={}",
                cfg.queue_discipline,
                cfg.congestion_control
            );

            let samples =
                fill_cell(cfg.repetitions, |progress| self.collect_one(&params, progress))
                    .await?;

            for (attempt, sample) in samples {
                grid.push(delay_idx, rate_idx, sample);
                bar.inc(1);

                let record = SampleRecord {
                    sample_id: sample_id(),
                    delay_ms: delay,
                    rate_mbit: rate,
                    queue_discipline: cfg.queue_discipline.to_string(),
                    congestion_control: cfg.congestion_control.clone(),
                    attempt,
                    accuracy: sample.accuracy,
                    throughput_mbit: sample.throughput_mbit,
                    delay_offset_ms: sample.delay_offset_ms,
                };
                if let Err(e) = append_sample_record(&samples_csv, &record) {
                    log::warn!("could not append sample record: {e}");
                }
            }
            debug_assert_eq!(grid.samples(delay_idx, rate_idx).len(), cfg.repetitions);
        }
        bar.finish();

        let paths = grid.persist(
            &cfg.data_root,
            &cfg.queue_discipline,
            &cfg.congestion_control,
        )?;
        log::info!("persisted metric grids: {paths:?}");

        Ok(grid)
    }

    /// Run the experiment once. `Ok(None)` marks an invalid sample to be retried; real
    /// failures propagate.
    async fn collect_one(
        &self,
        params: &LinkParameters,
        progress: CellProgress,
    ) -> Result<Option<CellSample>, SweepError> {
        let cfg = &self.config;
        let artifacts = self
            .runner
            .run(params, &cfg.congestion_control, cfg.max_duration)
            .await?;

        let accuracy = match classifier::classify(&artifacts.server_log, &params.queue_discipline)
        {
            Ok(accuracy) => accuracy,
            Err(invalid) => {
                log::warn!(
                    "discarding sample (attempt {}, {} valid): {invalid}",
                    progress.attempts() + 1,
                    progress.valid()
                );
                return Ok(None);
            }
        };

        // a completed, valid run with missing metrics is a data-integrity problem
        let throughput_mbit = self
            .extractors
            .throughput_mbit(&artifacts.client_capture)
            .await?;
        let qlog = artifacts.client_qlog.as_deref().ok_or_else(|| {
            MetricError::Utility {
                utility: self.extractors.rtt_utility.clone(),
                stderr: "the transport produced no client qlog".to_string(),
            }
        })?;
        let delay_offset_ms = self
            .extractors
            .delay_offset_ms(qlog, params.one_way_delay_ms)
            .await?;

        Ok(Some(CellSample {
            accuracy,
            throughput_mbit,
            delay_offset_ms,
        }))
    }
}

/// Drive one cell to its repetition target: retry invalid outcomes on the spot, stop at
/// exactly `target` valid samples, and propagate real failures.
///
/// Returns the valid samples in collection order, each with the cell's attempt count at the
/// time it was recorded.
async fn fill_cell<F, Fut>(
    target: usize,
    mut collect: F,
) -> Result<Vec<(usize, CellSample)>, SweepError>
where
    F: FnMut(CellProgress) -> Fut,
    Fut: Future<Output = Result<Option<CellSample>, SweepError>>,
{
    let mut progress = CellProgress::new(target);
    let mut samples = Vec::with_capacity(target);
    while !progress.done() {
        match collect(progress).await? {
            Some(sample) => {
                progress.record_valid();
                samples.push((progress.attempts(), sample));
            }
            None => progress.record_invalid(),
        }
    }
    Ok(samples)
}

fn sample_id() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cell_progress_counts_only_valid_samples() {
        let mut progress = CellProgress::new(5);
        assert!(!progress.done());

        for _ in 0..3 {
            progress.record_invalid();
        }
        assert_eq!(progress.valid(), 0);
        assert_eq!(progress.attempts(), 3);
        assert!(!progress.done());

        for _ in 0..5 {
            assert!(!progress.done());
            progress.record_valid();
        }
        assert!(progress.done());
        assert_eq!(progress.valid(), 5);
        assert_eq!(progress.attempts(), 8);
    }

    #[test]
    fn cell_progress_terminates_exactly_at_target() {
        let mut progress = CellProgress::new(1);
        progress.record_invalid();
        progress.record_valid();
        assert!(progress.done());
        // the sweep loop stops here; no further samples are recorded for the cell
    }

    fn outcome(accuracy: f64) -> Result<Option<CellSample>, SweepError> {
        Ok(Some(CellSample {
            accuracy,
            throughput_mbit: 9.5,
            delay_offset_ms: 0.5,
        }))
    }

    #[tokio::test]
    async fn cell_loop_retries_invalid_and_stops_at_target() {
        // two invalid runs interleaved with the valid ones, plus spare outcomes that must
        // never be consumed once the target is met
        let mut outcomes = vec![
            Ok(None),
            outcome(0.1),
            Ok(None),
            outcome(0.2),
            outcome(0.3),
            outcome(0.9),
            outcome(1.0),
        ]
        .into_iter();

        let samples = fill_cell(3, |_| {
            let next = outcomes.next().unwrap();
            async move { next }
        })
        .await
        .unwrap();

        assert_eq!(samples.len(), 3);
        let accuracies: Vec<f64> = samples.iter().map(|(_, s)| s.accuracy).collect();
        assert_eq!(accuracies, [0.1, 0.2, 0.3]);
        // attempt counts include the discarded runs
        let attempts: Vec<usize> = samples.iter().map(|(a, _)| *a).collect();
        assert_eq!(attempts, [2, 4, 5]);
        // the loop stopped at the target; the spare outcomes were never requested
        assert_eq!(outcomes.count(), 2);
    }

    #[tokio::test]
    async fn cell_loop_propagates_failures() {
        let mut outcomes = vec![
            outcome(0.5),
            Err(SweepError::Metric(crate::metrics::MetricError::Utility {
                utility: "extract".to_string(),
                stderr: "broken".to_string(),
            })),
        ]
        .into_iter();

        let result = fill_cell(3, |_| {
            let next = outcomes.next().unwrap();
            async move { next }
        })
        .await;
        assert!(matches!(result, Err(SweepError::Metric(_))));
    }
}
