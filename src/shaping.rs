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
//! Pure planner that turns link parameters into the ordered `tc` directive sequence for one
//! interface.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::experiments::LinkParameters;

/// Reference packet size used to convert a bandwidth-delay product into packets.
pub const REFERENCE_PACKET_BYTES: f64 = 1500.0;

/// Lower bound on the bottleneck buffer, in packets. Hand-tuned; keeps low-BDP configurations
/// from running severely underbuffered.
pub const BUFFER_FLOOR_PACKETS: u64 = 100;

/// Floor on the rate installed on return-path interfaces.
pub const UNCONSTRAINED_RATE_MBIT: f64 = 1000.0;

/// Headroom factor of the return path over the bottleneck rate, so the reverse direction
/// never becomes the bottleneck, whatever rates the sweep is configured with.
pub const RETURN_PATH_HEADROOM: f64 = 10.0;

/// Queue target of the CoDel-based discipline, in milliseconds.
pub const CODEL_TARGET_MS: u64 = 5;

/// The packet-scheduling policy installed at the emulated bottleneck.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueDiscipline {
    PlainFifo,
    FairQueue,
    FairQueueCodel,
    /// Passed through to `tc` verbatim, without a buffer override. Useful for one-off
    /// measurements with disciplines the planner knows nothing about.
    Other(String),
}

impl QueueDiscipline {
    /// Whether the discipline schedules competing flows fairly. This is the ground truth the
    /// transport's detection events are scored against.
    pub fn is_fair_queuing(&self) -> bool {
        match self {
            Self::PlainFifo => false,
            Self::FairQueue | Self::FairQueueCodel => true,
            Self::Other(name) => name.contains("fq"),
        }
    }

    /// The `tc` name of the discipline.
    pub fn name(&self) -> &str {
        match self {
            Self::PlainFifo => "pfifo",
            Self::FairQueue => "fq",
            Self::FairQueueCodel => "fq_codel",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for QueueDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QueueDiscipline {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pfifo" => Self::PlainFifo,
            "fq" => Self::FairQueue,
            "fq_codel" => Self::FairQueueCodel,
            other => Self::Other(other.to_string()),
        })
    }
}

/// The ordered `tc` directive sequence for a single interface.
///
/// A plan is generated fresh per interface and never mutated afterwards. It must be applied
/// atomically: all directives are issued before the interface carries experiment traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapingPlan {
    interface: String,
    directives: Vec<String>,
}

impl ShapingPlan {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn directives(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Whether the directive at `index` is allowed to fail when issued. Only the initial
    /// `del root` is tolerant, as there may be nothing to remove on a fresh interface.
    pub fn tolerates_failure(&self, index: usize) -> bool {
        index == 0
    }
}

/// The bandwidth-delay product of the configured path, in reference-sized packets.
pub fn bdp_packets(one_way_delay_ms: f64, rate_mbit: f64) -> f64 {
    (one_way_delay_ms / 1000.0 * rate_mbit * 1e6) / (REFERENCE_PACKET_BYTES * 8.0)
}

/// The buffer capacity installed at the bottleneck, in packets. Disciplines that manage their
/// queue themselves carry no override.
pub fn buffer_packets(params: &LinkParameters) -> Option<u64> {
    match params.queue_discipline {
        QueueDiscipline::PlainFifo | QueueDiscipline::FairQueue => {
            let bdp = bdp_packets(params.one_way_delay_ms, params.bottleneck_rate_mbit);
            Some((BUFFER_FLOOR_PACKETS as f64).max(bdp.ceil()) as u64)
        }
        QueueDiscipline::FairQueueCodel | QueueDiscipline::Other(_) => None,
    }
}

/// Compute the shaping plan for one interface.
///
/// Each directional hop of the path contributes half the end-to-end one-way delay budget, so
/// the netem stage applies `delay/2` on the two interfaces with `apply_delay`. Interfaces with
/// `apply_delay == false` mark the return path: zero added delay, a rate at least
/// [`RETURN_PATH_HEADROOM`] times the bottleneck rate, and a plain FIFO leaf.
pub fn plan(interface: &str, params: &LinkParameters, apply_delay: bool) -> ShapingPlan {
    let delay_ms = if apply_delay { (params.one_way_delay_ms / 2.0) as u64 } else { 0 };
    let rate_mbit = if apply_delay {
        params.bottleneck_rate_mbit
    } else {
        UNCONSTRAINED_RATE_MBIT.max(RETURN_PATH_HEADROOM * params.bottleneck_rate_mbit)
    };

    let leaf = if apply_delay {
        match (&params.queue_discipline, buffer_packets(params)) {
            (QueueDiscipline::PlainFifo, Some(limit)) => format!("pfifo limit {limit}"),
            (QueueDiscipline::FairQueue, Some(limit)) => {
                format!("fq nopacing flow_limit {limit}")
            }
            (QueueDiscipline::FairQueueCodel, _) => {
                format!("fq_codel noecn target {CODEL_TARGET_MS}ms")
            }
            // fall back to an unlimited FIFO rather than passing unknown parameters to tc
            _ => "pfifo".to_string(),
        }
    } else {
        "pfifo".to_string()
    };

    let directives = vec![
        format!("tc qdisc del dev {interface} root"),
        format!("tc qdisc add dev {interface} root handle 1: netem delay {delay_ms}ms"),
        format!("tc qdisc add dev {interface} parent 1: handle 2: htb default 21"),
        format!("tc class add dev {interface} parent 2: classid 2:21 htb rate {rate_mbit}mbit"),
        format!("tc qdisc add dev {interface} parent 2:21 handle 3: {leaf}"),
    ];

    ShapingPlan { interface: interface.to_string(), directives }
}
