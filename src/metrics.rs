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
//! Invocation of the external metric-extraction utilities.
//!
//! Capture artifacts are never parsed here beyond treating the utility's stdout as numeric
//! text: the throughput extractor reads the client-side capture, the RTT extractor reads the
//! client-side qlog. A failing or unparsable extraction is a data-integrity problem for an
//! otherwise completed sample and is propagated rather than retried.

use std::path::Path;

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("failed to launch metric utility `{utility}`: {source}")]
    Launch {
        utility: String,
        source: std::io::Error,
    },
    #[error("metric utility `{utility}` failed: {stderr}")]
    Utility { utility: String, stderr: String },
    #[error("metric utility `{utility}` produced unparsable output `{output}`")]
    Unparsable { utility: String, output: String },
}

/// The external utilities that turn capture artifacts into scalar metrics.
///
/// Each field is a shell command; the artifact path is appended as its last argument. The
/// utility must print the metric as the final line of its stdout: mbit/s for the throughput
/// extractor, the measured round-trip time in milliseconds for the RTT extractor.
#[derive(Clone, Debug)]
pub struct MetricExtractors {
    pub throughput_utility: String,
    pub rtt_utility: String,
}

impl MetricExtractors {
    /// Average goodput of the transfer in mbit/s, extracted from the client-side capture.
    pub async fn throughput_mbit(&self, capture: &Path) -> Result<f64, MetricError> {
        run_utility(&self.throughput_utility, capture).await
    }

    /// Offset between the measured and the configured one-way delay, in milliseconds.
    ///
    /// The utility reports the minimum round-trip time of the transfer; half of it estimates
    /// the one-way delay actually experienced on the emulated path.
    pub async fn delay_offset_ms(
        &self,
        qlog: &Path,
        configured_one_way_ms: f64,
    ) -> Result<f64, MetricError> {
        let rtt_ms = run_utility(&self.rtt_utility, qlog).await?;
        Ok(rtt_ms / 2.0 - configured_one_way_ms)
    }
}

async fn run_utility(utility: &str, artifact: &Path) -> Result<f64, MetricError> {
    let line = format!("{utility} {}", artifact.display());
    log::debug!("extracting metric: $ {line}");

    let output = Command::new("sh")
        .args(["-c", &line])
        .output()
        .await
        .map_err(|source| MetricError::Launch {
            utility: utility.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(MetricError::Utility {
            utility: utility.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value = stdout.lines().rev().find(|l| !l.trim().is_empty());
    value
        .and_then(|l| l.trim().parse::<f64>().ok())
        .ok_or_else(|| MetricError::Unparsable {
            utility: utility.to_string(),
            output: stdout.into_owned(),
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn extractors(throughput: &str, rtt: &str) -> MetricExtractors {
        MetricExtractors {
            throughput_utility: throughput.to_string(),
            rtt_utility: rtt.to_string(),
        }
    }

    #[tokio::test]
    async fn parses_final_stdout_line() {
        // `echo` stands in for the real extractor; the path argument is ignored by it
        let e = extractors("echo 12.5 #", "echo 0 #");
        let tput = e.throughput_mbit(&PathBuf::from("client.pcap")).await.unwrap();
        assert_eq!(tput, 12.5);
    }

    #[tokio::test]
    async fn computes_delay_offset_from_rtt() {
        let e = extractors("echo 0 #", "printf 'noise\\n210.0\\n' #");
        let offset = e
            .delay_offset_ms(&PathBuf::from("client.qlog"), 100.0)
            .await
            .unwrap();
        assert_eq!(offset, 5.0);
    }

    #[tokio::test]
    async fn utility_failure_is_propagated() {
        let e = extractors("false #", "echo 0 #");
        assert!(matches!(
            e.throughput_mbit(&PathBuf::from("client.pcap")).await,
            Err(MetricError::Utility { .. })
        ));
    }

    #[tokio::test]
    async fn unparsable_output_is_propagated() {
        let e = extractors("echo not-a-number #", "echo 0 #");
        assert!(matches!(
            e.throughput_mbit(&PathBuf::from("client.pcap")).await,
            Err(MetricError::Unparsable { .. })
        ));
    }
}
