//! OS adapters for the collaborator traits.
//!
//! Each adapter shells out and hands the text to a pure parser. Every
//! command runs under a deadline and is killed when it misses it.

use std::collections::BTreeSet;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use tblsync_services::{
    CollaboratorError, FirewallTableSink, NeighborMapping, NeighborTableProvider,
    PeerDiscoverySource,
};

/// Deadline for one external command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// ── Neighbor cache ───────────────────────────────────────────────────────────

/// Reads `arp -an` and `ndp -an`.
pub struct ArpNdpNeighbors {
    commands: Vec<Vec<String>>,
    timeout: Duration,
}

impl Default for ArpNdpNeighbors {
    fn default() -> Self {
        Self::with_commands(vec![
            argv(&["/usr/sbin/arp", "-an"]),
            argv(&["/usr/sbin/ndp", "-an"]),
        ])
    }
}

impl ArpNdpNeighbors {
    pub fn with_commands(commands: Vec<Vec<String>>) -> Self {
        Self {
            commands,
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl NeighborTableProvider for ArpNdpNeighbors {
    /// Rows from every command that ran. Fails only if none did.
    async fn neighbors(&mut self) -> Result<Vec<NeighborMapping>, CollaboratorError> {
        let mut rows = Vec::new();
        let mut last_error = None;
        let mut ran = 0;
        for command in &self.commands {
            match run(command, None, self.timeout).await {
                Ok(output) => {
                    ran += 1;
                    rows.extend(parse_neighbor_table(&output));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "neighbor command failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if ran == 0 => Err(e),
            _ => Ok(rows),
        }
    }
}

/// Parse BSD-style `arp -an` / `ndp -an` output.
///
/// The first line is a column header. Each row is whitespace separated:
/// address, link-layer address, interface, expiry, and optional flags.
pub fn parse_neighbor_table(output: &str) -> Vec<NeighborMapping> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let ip_address = cols.next()?.to_string();
            let physical_address = cols.next()?.to_string();
            Some(NeighborMapping {
                ip_address,
                physical_address,
                interface: cols.next().unwrap_or_default().to_string(),
                expiration: cols.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

// ── Peer discovery ───────────────────────────────────────────────────────────

/// OSPF neighbors from `ospfctl show neighbor detail`.
pub struct OspfNeighbors {
    command: Vec<String>,
    timeout: Duration,
}

impl Default for OspfNeighbors {
    fn default() -> Self {
        Self::with_command(argv(&["/usr/sbin/ospfctl", "show", "neighbor", "detail"]))
    }
}

impl OspfNeighbors {
    pub fn with_command(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PeerDiscoverySource for OspfNeighbors {
    async fn discover(&mut self) -> Result<Vec<String>, CollaboratorError> {
        let output = run(&self.command, None, self.timeout).await?;
        Ok(parse_ospf_neighbors(&output))
    }
}

/// Interface addresses from lines like
/// `Neighbor 10.0.0.2, interface address 192.168.1.2`.
pub fn parse_ospf_neighbors(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("Neighbor"))
        .filter_map(|line| line.split_once("interface address"))
        .filter_map(|(_, rest)| rest.split_whitespace().next())
        .map(|addr| addr.trim_end_matches(',').to_string())
        .collect()
}

// ── Packet filter ────────────────────────────────────────────────────────────

/// pf tables via `pfctl -t <table> -T replace -f -`.
pub struct PfctlSink {
    /// Program and leading arguments, e.g. `doas /sbin/pfctl`.
    command: Vec<String>,
    timeout: Duration,
}

impl PfctlSink {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn table_command(&self, table: &str, action: &str, extra: &[&str]) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend(["-t", table, "-T", action].iter().map(|s| s.to_string()));
        argv.extend(extra.iter().map(|s| s.to_string()));
        argv
    }
}

#[async_trait]
impl FirewallTableSink for PfctlSink {
    async fn replace_table(
        &mut self,
        table: &str,
        addresses: &BTreeSet<String>,
    ) -> Result<(), CollaboratorError> {
        let list: Vec<&str> = addresses.iter().map(String::as_str).collect();
        let command = self.table_command(table, "replace", &["-f", "-"]);
        run(&command, Some(list.join("\n").as_bytes()), self.timeout).await?;
        tracing::debug!(table, count = list.len(), "pf table replaced");
        Ok(())
    }

    async fn current_table(&mut self, table: &str) -> Option<BTreeSet<String>> {
        let command = self.table_command(table, "show", &[]);
        match run(&command, None, self.timeout).await {
            Ok(output) => Some(parse_table_show(&output)),
            Err(e) => {
                tracing::debug!(table, error = %e, "could not read pf table");
                None
            }
        }
    }
}

/// One address per line, indented.
pub fn parse_table_show(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Process plumbing ─────────────────────────────────────────────────────────

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Run `command`, optionally feeding `stdin`, and return its stdout.
///
/// stdin is written while stdout and stderr drain, so a chatty child
/// cannot deadlock on a full pipe. The child is killed if `timeout`
/// elapses first.
async fn run(
    command: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<String, CollaboratorError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| CollaboratorError::Other("empty command".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CollaboratorError::Spawn {
            program: program.clone(),
            source,
        })?;

    let pipe = child.stdin.take();
    let feed = async move {
        let (Some(input), Some(mut pipe)) = (stdin, pipe) else {
            return Ok(());
        };
        match pipe.write_all(input).await {
            // The child may exit without reading everything.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    };

    let finished = tokio::time::timeout(timeout, async {
        tokio::join!(feed, child.wait_with_output())
    })
    .await;

    let (fed, output) = finished.map_err(|_| CollaboratorError::Timeout {
        program: program.clone(),
        after: timeout,
    })?;
    fed.map_err(|source| CollaboratorError::Io {
        program: program.clone(),
        source,
    })?;
    let output = output.map_err(|source| CollaboratorError::Io {
        program: program.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(CollaboratorError::Status {
            program: program.clone(),
            status: output.status.to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
