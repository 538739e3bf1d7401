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
//! Access to the nodes of the emulation testbed.
//!
//! The testbed itself is an external collaborator; the controller only ever consumes it
//! through the capability of running a shell command on a named node.

use std::process::Output;

use tokio::process::Command;

/// A node of the emulated path on which external processes can be executed.
pub trait Node {
    /// The node name, as used in interface names (`<name>-eth0`) and logs.
    fn name(&self) -> &str;

    /// Build a command that executes `program` on this node. Arguments and environment are
    /// appended by the caller.
    fn command(&self, program: &str) -> Command;
}

/// Run a full shell line on a node and collect its output.
pub async fn run_shell(node: &impl Node, line: &str) -> std::io::Result<Output> {
    log::trace!("[{}] $ {line}", node.name());
    node.command("sh").args(["-c", line]).output().await
}

/// A node backed by a Linux network namespace, entered via `ip netns exec`.
#[derive(Clone, Debug)]
pub struct NetnsNode {
    name: String,
    netns: String,
}

impl NetnsNode {
    pub fn new(name: impl Into<String>, netns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            netns: netns.into(),
        }
    }
}

impl Node for NetnsNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", &self.netns, program]);
        cmd
    }
}

/// A node that executes directly on the controller host. Used for single-host smoke runs
/// and in tests.
#[derive(Clone, Debug)]
pub struct LocalNode {
    name: String,
}

impl LocalNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Node for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, program: &str) -> Command {
        Command::new(program)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn local_node_runs_shell() {
        let node = LocalNode::new("h1");
        let output = run_shell(&node, "echo -n from-$0").await.unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).starts_with("from-"));
    }

    #[test]
    fn netns_node_prefixes_command() {
        let node = NetnsNode::new("h1", "fqlab-h1");
        let cmd = node.command("tc");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["netns", "exec", "fqlab-h1", "tc"]);
        assert_eq!(cmd.as_std().get_program().to_string_lossy(), "ip");
    }
}
