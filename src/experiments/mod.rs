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
//! Module facilitating experiments on the emulated dumbbell path.

pub mod aggregator;
pub mod runner;

pub use aggregator::*;
pub use runner::*;

use serde::{Deserialize, Serialize};

use crate::{node::Node, shaping::QueueDiscipline};

/// Immutable parameters of one emulated-link configuration.
///
/// Constructed fresh per experiment and passed explicitly; no scratch state is reused
/// across runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkParameters {
    /// One-way propagation delay of the path. Non-negative.
    pub one_way_delay_ms: f64,
    /// Bottleneck rate. Strictly positive.
    pub bottleneck_rate_mbit: f64,
    pub queue_discipline: QueueDiscipline,
}

impl LinkParameters {
    pub fn new(one_way_delay_ms: f64, bottleneck_rate_mbit: f64, qdisc: QueueDiscipline) -> Self {
        debug_assert!(one_way_delay_ms >= 0.0);
        debug_assert!(bottleneck_rate_mbit > 0.0);
        Self {
            one_way_delay_ms,
            bottleneck_rate_mbit,
            queue_discipline: qdisc,
        }
    }
}

/// The three nodes of the reference dumbbell topology: client host, switch, server host.
#[derive(Clone, Debug)]
pub struct DataPath<N> {
    pub client: N,
    pub switch: N,
    pub server: N,
    /// Address at which the server host is reachable from the client host.
    pub server_addr: String,
}

/// One shaped interface of the data path.
pub struct PathInterface<'a, N> {
    pub node: &'a N,
    pub interface: String,
    /// Whether this interface carries the delay/rate emulation. True only on the two
    /// interfaces nearest the end hosts; the others mark the return path.
    pub near_host: bool,
}

impl<N: Node> DataPath<N> {
    /// The four shaped interfaces of the reference topology: one per end host, and the two
    /// switch-facing interfaces.
    pub fn interfaces(&self) -> Vec<PathInterface<'_, N>> {
        vec![
            PathInterface {
                node: &self.client,
                interface: format!("{}-eth0", self.client.name()),
                near_host: true,
            },
            PathInterface {
                node: &self.server,
                interface: format!("{}-eth0", self.server.name()),
                near_host: false,
            },
            PathInterface {
                node: &self.switch,
                interface: format!("{}-eth1", self.switch.name()),
                near_host: true,
            },
            PathInterface {
                node: &self.switch,
                interface: format!("{}-eth2", self.switch.name()),
                near_host: false,
            },
        ]
    }
}

/// How to launch the transport binary under test.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Path to the client/server binary (reached only via argv, env and its stdio).
    pub binary: String,
    pub port: u16,
    /// Server-side TLS material and content root.
    pub cert: String,
    pub key: String,
    pub server_root: String,
    /// Object the client downloads.
    pub transfer_object: String,
}

/// How to launch the competing best-effort traffic generator, when enabled.
#[derive(Clone, Debug)]
pub struct CrossTrafficConfig {
    /// Path to the generator binary (iperf3-compatible interface).
    pub binary: String,
    /// Congestion control the generator announces for its flow.
    pub congestion_control: String,
}

impl Default for CrossTrafficConfig {
    fn default() -> Self {
        Self {
            binary: "iperf3".to_string(),
            congestion_control: "reno".to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::LocalNode;

    #[test]
    fn reference_topology_has_four_interfaces() {
        let path = DataPath {
            client: LocalNode::new("h1"),
            switch: LocalNode::new("s1"),
            server: LocalNode::new("h2"),
            server_addr: "192.168.0.2".to_string(),
        };
        let interfaces = path.interfaces();
        assert_eq!(interfaces.len(), 4);

        let names: Vec<&str> = interfaces.iter().map(|i| i.interface.as_str()).collect();
        assert_eq!(names, ["h1-eth0", "h2-eth0", "s1-eth1", "s1-eth2"]);

        // delay emulation only on the host-nearest interfaces
        let near: Vec<bool> = interfaces.iter().map(|i| i.near_host).collect();
        assert_eq!(near, [true, false, true, false]);
    }
}
