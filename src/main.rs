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
use std::{path::PathBuf, time::Duration};

use clap::Parser;

use fqlab::{
    experiments::{
        CrossTrafficConfig, DataPath, ExperimentRunner, ResultAggregator, SweepConfig,
        TransportConfig, DEFAULT_REPETITIONS,
    },
    metrics::MetricExtractors,
    node::NetnsNode,
    shaping::QueueDiscipline,
    util,
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Overwrite the output path for data.
    #[arg(short, long, default_value = "./data/")]
    data_root: PathBuf,
    /// Working directory shared with the testbed nodes (captures, qlogs).
    #[arg(short, long, default_value = "./work/")]
    work_dir: PathBuf,
    /// Queue discipline installed at the bottleneck.
    #[arg(short, long, default_value = "fq")]
    qdisc: QueueDiscipline,
    /// Congestion-control algorithm under test, as understood by the transport binary.
    #[arg(short, long, default_value = "tonopah")]
    congestion_control: String,
    /// One-way delays of the sweep, in milliseconds.
    #[arg(long, value_delimiter = ',', default_value = "10,50,100")]
    delays: Vec<f64>,
    /// Bottleneck rates of the sweep, in mbit/s.
    #[arg(long, value_delimiter = ',', default_value = "10,50,100")]
    rates: Vec<f64>,
    /// Select the number of valid samples collected per grid cell.
    #[arg(short = 'n', long, default_value_t = DEFAULT_REPETITIONS)]
    repetitions: usize,
    /// Time budget per run, in seconds, injected into the transport binary.
    #[arg(long, default_value_t = 120)]
    max_time: u64,
    /// Settle interval before capture teardown, in seconds.
    #[arg(long, default_value_t = 5)]
    settle: u64,
    /// Run a competing best-effort flow alongside the transfer.
    #[arg(long)]
    cross_traffic: bool,
    /// Path to the transport client/server binary.
    #[arg(long, default_value = "../picoquic_sample")]
    transport: String,
    /// Address of the server host inside the emulation.
    #[arg(long, default_value = "192.168.0.2")]
    server_addr: String,
    /// Network namespaces of the client host, switch, and server host.
    #[arg(long, value_delimiter = ',', default_value = "h1,s1,h2")]
    nodes: Vec<String>,
    /// Shell command extracting mbit/s from the client capture.
    #[arg(long, default_value = "./extract_throughput.sh")]
    throughput_utility: String,
    /// Shell command extracting the minimum RTT (ms) from the client qlog.
    #[arg(long, default_value = "./extract_rtt.sh")]
    rtt_utility: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    util::init_logging();
    let args = Args::parse();

    anyhow::ensure!(
        args.nodes.len() == 3,
        "expected exactly three nodes (client,switch,server), got {:?}",
        args.nodes
    );
    std::fs::create_dir_all(&args.work_dir)?;

    let path = DataPath {
        client: NetnsNode::new(args.nodes[0].clone(), args.nodes[0].clone()),
        switch: NetnsNode::new(args.nodes[1].clone(), args.nodes[1].clone()),
        server: NetnsNode::new(args.nodes[2].clone(), args.nodes[2].clone()),
        server_addr: args.server_addr,
    };

    let transport = TransportConfig {
        binary: args.transport,
        port: 4433,
        cert: "./ca-cert.pem".to_string(),
        key: "./server-key.pem".to_string(),
        server_root: "./server_files".to_string(),
        transfer_object: "100M.bin".to_string(),
    };

    let cross_traffic = args.cross_traffic.then(CrossTrafficConfig::default);

    let runner = ExperimentRunner::new(path, transport, cross_traffic, args.work_dir)
        .settle_delay(Duration::from_secs(args.settle));

    let extractors = MetricExtractors {
        throughput_utility: args.throughput_utility,
        rtt_utility: args.rtt_utility,
    };

    let config = SweepConfig {
        delays_ms: args.delays,
        rates_mbit: args.rates,
        queue_discipline: args.qdisc,
        congestion_control: args.congestion_control,
        repetitions: args.repetitions,
        max_duration: Duration::from_secs(args.max_time),
        data_root: args.data_root,
    };

    let aggregator = ResultAggregator::new(&runner, extractors, config);
    let grid = aggregator.sweep().await?;

    log::info!(
        "sweep complete: {} delay(s) x {} rate(s)",
        grid.delays_ms().len(),
        grid.rates_mbit().len()
    );
    Ok(())
}
