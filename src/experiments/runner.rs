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
//! Execution of a single experiment: provision shaping, run captures, server, client and the
//! optional competing traffic generator, and tear everything down in a fixed order.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::time::sleep;

use crate::{
    node::{run_shell, Node},
    shaping::{self, ShapingPlan},
    supervisor::{ProcessOutput, Supervised, SupervisorError},
    util,
};

use super::{CrossTrafficConfig, DataPath, LinkParameters, TransportConfig};

/// Environment variable carrying the run's time budget in seconds. The transport binary
/// ends the transfer on its own once the budget is spent; the supervisor only reaps.
pub const TIME_BUDGET_ENV: &str = "MAX_TIME";
/// Environment variable selecting the congestion-control algorithm under test.
pub const CONGESTION_CONTROL_ENV: &str = "CONGESTION_CONTROL";

/// Settle interval between client completion and capture teardown, letting in-flight
/// packets drain. Hand-tuned.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Head start granted to the competing traffic generator before the main transfer.
const CROSS_TRAFFIC_HEAD_START: Duration = Duration::from_secs(1);

/// Per-packet snapshot length of the captures. Headers suffice for throughput extraction.
const CAPTURE_SNAPLEN: u32 = 100;
/// Wire/transport filter of the captures.
const CAPTURE_FILTER: &str = "(tcp || udp) and ip";

/// Offload features disabled on all data-path interfaces, so captured packet sizes reflect
/// wire reality rather than pre-segmentation buffers.
const OFFLOAD_FEATURES: &str = "gso off tso off gro off";

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    /// A shaping directive was rejected. Fatal for the configuration: proceeding with an
    /// unshaped link would silently corrupt every downstream measurement.
    #[error("shaping directive `{directive}` failed on {node}: {stderr}")]
    Shaping {
        node: String,
        directive: String,
        stderr: String,
    },
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The raw artifacts of one completed run, read only after all writers have been reaped.
#[derive(Clone, Debug)]
pub struct RunArtifacts {
    /// Full stdout of the server process; input to the event classifier.
    pub server_log: String,
    pub client_capture: PathBuf,
    pub server_capture: PathBuf,
    /// Structured per-packet delay log of the client, when the transport produced one.
    pub client_qlog: Option<PathBuf>,
}

/// Runs one experiment configuration on a provisioned data path.
pub struct ExperimentRunner<N> {
    path: DataPath<N>,
    transport: TransportConfig,
    cross_traffic: Option<CrossTrafficConfig>,
    /// Directory shared with the testbed nodes into which captures and qlogs are written.
    work_dir: PathBuf,
    settle_delay: Duration,
}

impl<N: Node> ExperimentRunner<N> {
    pub fn new(
        path: DataPath<N>,
        transport: TransportConfig,
        cross_traffic: Option<CrossTrafficConfig>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            path,
            transport,
            cross_traffic,
            work_dir,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Run one experiment and return its raw artifacts.
    ///
    /// Teardown order is fixed: client (joined on natural completion) -> generator ->
    /// settle delay -> captures -> server. Lifecycle failures during teardown are logged
    /// and do not abort the remaining steps.
    pub async fn run(
        &self,
        params: &LinkParameters,
        congestion_control: &str,
        max_duration: Duration,
    ) -> Result<RunArtifacts, ExperimentError> {
        self.cleanup_stale_processes().await;
        self.provision_shaping(params).await?;
        self.disable_offloads().await;

        let client_capture = self.work_dir.join("client.pcap");
        let server_capture = self.work_dir.join("server.pcap");

        let env = [
            (TIME_BUDGET_ENV, max_duration.as_secs().to_string()),
            (CONGESTION_CONTROL_ENV, congestion_control.to_string()),
        ];

        // captures first, so the handshake is on the wire trace
        let mut server_tcpdump = self.start_capture(&self.path.server, &server_capture)?;
        let mut client_tcpdump = self.start_capture(&self.path.client, &client_capture)?;

        let mut server = self.start_server(&env)?;

        let mut cross = match &self.cross_traffic {
            Some(cfg) => Some(self.start_cross_traffic(cfg)?),
            None => None,
        };

        sleep(CROSS_TRAFFIC_HEAD_START).await;

        // the client's natural completion signals transfer-done (or its budget spent)
        let mut client = self.start_client(&env)?;
        let client_output = client.join().await?;
        log_process_output("client", &client_output);

        if let Some((mut sender, mut receiver)) = cross.take() {
            reap_best_effort("cross-traffic sender", &mut sender).await;
            reap_best_effort("cross-traffic receiver", &mut receiver).await;
        }

        // let in-flight packets drain before stopping the observers
        sleep(self.settle_delay).await;

        reap_best_effort("client tcpdump", &mut client_tcpdump).await;
        reap_best_effort("server tcpdump", &mut server_tcpdump).await;

        server.terminate();
        let server_log = match server.join().await {
            Ok(output) => {
                log_process_output("server", &output);
                output.stdout
            }
            Err(e) => {
                log::error!("failed to reap the server: {e}");
                String::new()
            }
        };

        let client_qlog = self.link_latest_qlog();

        Ok(RunArtifacts {
            server_log,
            client_capture,
            server_capture,
            client_qlog,
        })
    }

    /// Apply the shaping plans to all four data-path interfaces. A plan is issued
    /// completely before the next interface is touched; only the initial `del root` of
    /// each plan may fail.
    async fn provision_shaping(&self, params: &LinkParameters) -> Result<(), ExperimentError> {
        for itf in self.path.interfaces() {
            let plan = shaping::plan(&itf.interface, params, itf.near_host);
            apply_plan(itf.node, &plan).await?;
        }
        Ok(())
    }

    /// Disable segmentation and checksum offloads on the data-path interfaces. Some veth
    /// drivers reject individual features; that only degrades capture fidelity, so
    /// failures are logged rather than fatal.
    async fn disable_offloads(&self) {
        for itf in self.path.interfaces() {
            let line = format!("ethtool -K {} {OFFLOAD_FEATURES}", itf.interface);
            match run_shell(itf.node, &line).await {
                Ok(output) if !output.status.success() => log::warn!(
                    "[{}] could not disable offloads on {}: {}",
                    itf.node.name(),
                    itf.interface,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Ok(_) => {}
                Err(e) => log::warn!(
                    "[{}] could not run ethtool on {}: {e}",
                    itf.node.name(),
                    itf.interface
                ),
            }
        }
    }

    /// Kill leftovers of a previously aborted run. Best-effort; a clean testbed makes
    /// these no-ops.
    async fn cleanup_stale_processes(&self) {
        let mut stale = vec![binary_name(&self.transport.binary)];
        if let Some(cfg) = &self.cross_traffic {
            stale.push(binary_name(&cfg.binary));
        }
        for name in stale {
            let _ = run_shell(&self.path.client, &format!("killall -q {name}")).await;
            let _ = run_shell(&self.path.server, &format!("killall -q {name}")).await;
        }
    }

    fn start_capture(&self, node: &N, file: &Path) -> Result<Supervised, SupervisorError> {
        let interface = format!("{}-eth0", node.name());
        let mut cmd = node.command("tcpdump");
        cmd.args(["-s", &CAPTURE_SNAPLEN.to_string(), "-i", &interface, "-w"])
            .arg(file)
            .arg(CAPTURE_FILTER);
        Supervised::spawn(format!("tcpdump@{}", node.name()), cmd)
    }

    fn start_server(&self, env: &[(&str, String)]) -> Result<Supervised, SupervisorError> {
        let t = &self.transport;
        let mut cmd = self.path.server.command(&t.binary);
        cmd.args([
            "server",
            &t.port.to_string(),
            &t.cert,
            &t.key,
            &t.server_root,
        ])
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .current_dir(&self.work_dir);
        Supervised::spawn("server", cmd)
    }

    fn start_client(&self, env: &[(&str, String)]) -> Result<Supervised, SupervisorError> {
        let t = &self.transport;
        let mut cmd = self.path.client.command(&t.binary);
        cmd.args([
            "client",
            &self.path.server_addr,
            &t.port.to_string(),
            "./",
            &t.transfer_object,
        ])
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .current_dir(&self.work_dir);
        Supervised::spawn("client", cmd)
    }

    /// Launch the competing best-effort flow: receiver on the client host, sender on the
    /// server host, so the cross traffic shares the bottleneck with the transfer.
    fn start_cross_traffic(
        &self,
        cfg: &CrossTrafficConfig,
    ) -> Result<(Supervised, Supervised), SupervisorError> {
        let mut receiver_cmd = self.path.client.command(&cfg.binary);
        receiver_cmd.arg("-s");
        let receiver = Supervised::spawn("cross-traffic receiver", receiver_cmd)?;

        let mut sender_cmd = self.path.server.command(&cfg.binary);
        sender_cmd.args([
            "-c",
            &client_addr_of(&self.path.server_addr),
            "--congestion",
            &cfg.congestion_control,
            "-tinf",
        ]);
        let sender = Supervised::spawn("cross-traffic sender", sender_cmd)?;

        Ok((sender, receiver))
    }

    /// Point a stable name at the freshest client qlog, so the RTT extractor always has a
    /// fixed input path.
    fn link_latest_qlog(&self) -> Option<PathBuf> {
        let latest = util::latest_file_with_suffix(&self.work_dir, ".client.qlog")?;
        let link = self.work_dir.join("client.qlog");
        if link.symlink_metadata().is_ok() {
            let _ = std::fs::remove_file(&link);
        }
        // link target relative to the link's own directory
        let target = latest.file_name()?.to_os_string();
        match std::os::unix::fs::symlink(&target, &link) {
            Ok(()) => Some(link),
            Err(e) => {
                log::warn!("could not link {target:?} to {link:?}: {e}");
                Some(latest)
            }
        }
    }
}

/// Issue all directives of a plan on its node, in order. The first directive removes any
/// existing root discipline and is tolerant of there being nothing to remove; every other
/// rejection surfaces immediately.
pub async fn apply_plan(node: &impl Node, plan: &ShapingPlan) -> Result<(), ExperimentError> {
    for (i, directive) in plan.directives().enumerate() {
        let output = run_shell(node, directive).await?;
        if !output.status.success() && !plan.tolerates_failure(i) {
            return Err(ExperimentError::Shaping {
                node: node.name().to_string(),
                directive: directive.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
    }
    Ok(())
}

/// Terminate and join a supervised process, logging failures instead of propagating them.
async fn reap_best_effort(label: &str, proc: &mut Supervised) {
    proc.terminate();
    match proc.join().await {
        Ok(output) => log_process_output(label, &output),
        Err(e) => log::error!("failed to reap {label}: {e}"),
    }
}

fn log_process_output(label: &str, output: &ProcessOutput) {
    if !output.stdout.is_empty() {
        log::trace!("[{label}] stdout:\n{}", output.stdout);
    }
    if !output.stderr.is_empty() {
        log::trace!("[{label}] stderr:\n{}", output.stderr);
    }
}

/// The sender targets the client host; with the reference addressing, its address is the
/// server address with the final octet swapped for `.1`.
fn client_addr_of(server_addr: &str) -> String {
    match server_addr.rsplit_once('.') {
        Some((prefix, _)) => format!("{prefix}.1"),
        None => server_addr.to_string(),
    }
}

fn binary_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        node::LocalNode,
        shaping::QueueDiscipline,
    };

    #[test]
    fn client_addr_swaps_final_octet() {
        assert_eq!(client_addr_of("192.168.0.2"), "192.168.0.1");
        assert_eq!(client_addr_of("not-an-address"), "not-an-address");
    }

    #[test]
    fn binary_name_strips_directories() {
        assert_eq!(binary_name("../picoquic_sample"), "picoquic_sample");
        assert_eq!(binary_name("iperf3"), "iperf3");
    }

    #[tokio::test]
    async fn plan_application_surfaces_rejections() {
        let node = LocalNode::new("h1");
        let params = LinkParameters::new(10.0, 10.0, QueueDiscipline::FairQueue);
        // a nonexistent device makes every directive fail, whether or not tc is even
        // installed; the tolerated `del root` is skipped over and the netem stage surfaces
        let plan = shaping::plan("fqlab-missing0", &params, true);

        let result = apply_plan(&node, &plan).await;
        match result {
            Err(ExperimentError::Shaping { directive, .. }) => {
                assert!(directive.contains("netem"));
            }
            other => panic!("expected a shaping error, got {other:?}"),
        }
    }
}
