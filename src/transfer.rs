//! Outgoing Taildrop transfers.
//!
//! `tailscale file cp` reads the file body from stdin and only occasionally
//! prints a percentage, so progress is also estimated from the transmit
//! counter of the tailnet interface in `/proc/<tailscaled>/net/dev`.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::exec::{CommandExecutor, RootShell, shell_quote};
use crate::procs::ProcessId;

pub const TAILNET_INTERFACE: &str = "tailscale0";

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("percent pattern compiles"));

pub fn send_command(binary: &str, file_name: &str, peer: &str) -> String {
    format!(
        "{binary} file cp --verbose --name {} - {peer}:",
        shell_quote(file_name)
    )
}

/// First percentage figure in `line`, truncated and capped at 100.
pub fn parse_percent(line: &str) -> Option<u8> {
    let value: f64 = PERCENT.captures(line)?.get(1)?.as_str().parse().ok()?;
    Some(value.min(100.0) as u8)
}

/// Transmit byte counter of `iface` from a `/proc/net/dev` style listing.
pub fn parse_tx_bytes(net_dev: &str, iface: &str) -> Option<u64> {
    let line = net_dev
        .lines()
        .find(|line| line.trim_start().starts_with(&format!("{iface}:")))?;
    let (_, counters) = line.split_once(':')?;
    // 8 receive counters precede the transmit byte count
    counters.split_whitespace().nth(8)?.parse().ok()
}

/// Converts transmit counter samples into a percentage of `total` bytes,
/// measured from the first sample. Stays below 100 until the sender exits.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    total: u64,
    baseline: Option<u64>,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        TransferProgress {
            total,
            baseline: None,
        }
    }

    pub fn sample(&mut self, tx_bytes: u64) -> u8 {
        let baseline = *self.baseline.get_or_insert(tx_bytes);
        if self.total == 0 {
            return 0;
        }
        let sent = tx_bytes.saturating_sub(baseline);
        ((sent as f64 / self.total as f64) * 100.0).min(99.0) as u8
    }
}

/// Polls the daemon's interface counters until told to stop.
pub struct ProgressSampler {
    exec: Arc<dyn CommandExecutor>,
    daemon: ProcessId,
    iface: String,
    every: Duration,
    progress: TransferProgress,
}

impl ProgressSampler {
    pub fn new(exec: Arc<dyn CommandExecutor>, daemon: ProcessId, total: u64) -> Self {
        ProgressSampler {
            exec,
            daemon,
            iface: TAILNET_INTERFACE.to_string(),
            every: Duration::from_millis(100),
            progress: TransferProgress::new(total),
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>, updates: mpsc::Sender<TransferEvent>) {
        let command = format!("cat /proc/{}/net/dev", self.daemon);
        while !*stop.borrow() {
            let listing = tokio::select! {
                biased;
                _ = stop.changed() => break,
                out = self.exec.execute(&command) => out,
            };
            if let Some(tx) = parse_tx_bytes(&listing, &self.iface) {
                let percent = self.progress.sample(tx);
                if updates.send(TransferEvent::Progress(percent)).await.is_err() {
                    break;
                }
            }
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.every) => {}
            }
        }
        debug!(daemon = self.daemon, "progress sampler stopped");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress(u8),
    /// A line the sender printed on stderr.
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub code: Option<i32>,
    /// Everything the sender printed on stderr.
    pub stderr: String,
}

impl TransferOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn message(&self) -> String {
        if self.success() {
            "transfer complete".to_string()
        } else {
            format!("failed: {}", self.stderr)
        }
    }
}

/// Streams `path` to `peer` and reports progress on `events`.
pub async fn send_file(
    shell: &RootShell,
    exec: Arc<dyn CommandExecutor>,
    binary: &str,
    path: &Path,
    peer: &str,
    events: mpsc::Sender<TransferEvent>,
) -> Result<TransferOutcome> {
    let total = tokio::fs::metadata(path).await?.len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let command = send_command(binary, &file_name, peer);
    info!(%command, total, "starting transfer");

    let mut child = shell
        .command(&command)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut file = tokio::fs::File::open(path).await?;
    let stdin = child.stdin.take();
    let feeder = tokio::spawn(async move {
        let Some(mut stdin) = stdin else { return };
        if let Err(e) = tokio::io::copy(&mut file, &mut stdin).await {
            warn!(error = %e, "writing file to sender stdin failed");
        }
        let _ = stdin.shutdown().await;
    });

    let (stop, stop_rx) = watch::channel(false);
    let daemon = exec
        .execute("pidof tailscaled")
        .await
        .split_whitespace()
        .next()
        .and_then(|pid| pid.parse::<ProcessId>().ok());
    let sampler = daemon.map(|daemon| {
        tokio::spawn(ProgressSampler::new(exec.clone(), daemon, total).run(stop_rx, events.clone()))
    });

    let mut stderr = String::new();
    if let Some(err) = child.stderr.take() {
        let mut lines = BufReader::new(err).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(percent) = parse_percent(&line) {
                let _ = events.send(TransferEvent::Progress(percent)).await;
            }
            let _ = events.send(TransferEvent::Log(line.clone())).await;
            stderr.push_str(&line);
            stderr.push('\n');
        }
    }

    let status = child.wait().await?;
    let _ = stop.send(true);
    if let Some(sampler) = sampler {
        let _ = sampler.await;
    }
    let _ = feeder.await;

    let outcome = TransferOutcome {
        code: status.code(),
        stderr: stderr.trim().to_string(),
    };
    if outcome.success() {
        let _ = events.send(TransferEvent::Progress(100)).await;
    }
    info!(code = ?outcome.code, "transfer finished");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
tailscale0: 987654    2000    0    0    0     0          0         0  5550000    3000    0    0    0     0       0          0
wlan0:1234567890    9000    0    0    0     0          0         0 22222222    8000    0    0    0     0       0          0
";

    #[test]
    fn command_quotes_file_name() {
        assert_eq!(
            send_command("tailscale", "my photo.jpg", "laptop"),
            "tailscale file cp --verbose --name 'my photo.jpg' - laptop:"
        );
    }

    #[test]
    fn percent_extraction() {
        assert_eq!(parse_percent("sending 42% done"), Some(42));
        assert_eq!(parse_percent("12.9%"), Some(12));
        assert_eq!(parse_percent("250%"), Some(100));
        assert_eq!(parse_percent("no figures here"), None);
    }

    #[test]
    fn tx_bytes_from_net_dev() {
        assert_eq!(parse_tx_bytes(NET_DEV, "tailscale0"), Some(5_550_000));
        assert_eq!(parse_tx_bytes(NET_DEV, "wlan0"), Some(22_222_222));
        assert_eq!(parse_tx_bytes(NET_DEV, "eth0"), None);
        assert_eq!(parse_tx_bytes("", "tailscale0"), None);
    }

    #[test]
    fn progress_is_relative_and_capped() {
        let mut progress = TransferProgress::new(1000);
        assert_eq!(progress.sample(5000), 0);
        assert_eq!(progress.sample(5250), 25);
        assert_eq!(progress.sample(9000), 99);

        let mut empty = TransferProgress::new(0);
        assert_eq!(empty.sample(10), 0);
        assert_eq!(empty.sample(20), 0);
    }

    #[test]
    fn outcome_messages() {
        let ok = TransferOutcome {
            code: Some(0),
            stderr: String::new(),
        };
        assert_eq!(ok.message(), "transfer complete");
        let failed = TransferOutcome {
            code: Some(1),
            stderr: "can't send to laptop: not connected to the tailnet".to_string(),
        };
        assert!(failed.message().starts_with("failed: can't send"));
    }
}
