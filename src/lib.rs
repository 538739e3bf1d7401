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
//! Library driving network-emulation experiments that score a transport's fair-queuing
//! detection against the queue discipline actually installed at the bottleneck.

pub mod classifier;
pub mod experiments;
pub mod metrics;
pub mod node;
pub mod records;
pub mod shaping;
pub mod supervisor;
pub mod util;

pub mod prelude {
    pub use super::{
        classifier::{classify, parse_events, Classification, DetectionEvent, InvalidSample},
        experiments::{
            CellProgress, CrossTrafficConfig, DataPath, ExperimentRunner, LinkParameters,
            ResultAggregator, RunArtifacts, SweepConfig, TransportConfig,
        },
        metrics::MetricExtractors,
        node::{LocalNode, NetnsNode, Node},
        records::{CellSample, ResultGrid, SampleRecord},
        shaping::{QueueDiscipline, ShapingPlan},
        supervisor::{Liveness, ProcessOutput, Supervised},
    };
}
