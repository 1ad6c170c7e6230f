//! Connectivity checks: `tailscale netcheck` and `tailscale ping`.

use tokio::sync::mpsc;

use crate::error::Result;
use crate::exec::{CommandExecutor, RootShell, shell_quote};

pub fn netcheck_command(binary: &str) -> String {
    format!("{binary} netcheck")
}

/// Everything after the `Report:` marker. Without the marker the whole
/// output is returned, which is how errors reach the caller. `None` when
/// nothing is left.
pub fn parse_netcheck_report(output: &str) -> Option<String> {
    let report = output
        .split_once("Report:")
        .map_or(output, |(_, rest)| rest)
        .trim();
    (!report.is_empty()).then(|| report.to_string())
}

pub async fn netcheck(exec: &dyn CommandExecutor, binary: &str) -> Option<String> {
    parse_netcheck_report(&exec.execute(&netcheck_command(binary)).await)
}

pub fn ping_command(binary: &str, target: &str) -> String {
    format!("{binary} ping {}", shell_quote(target))
}

/// Streams `tailscale ping` output to `lines` until the command ends or
/// the future is dropped.
pub async fn ping(
    shell: &RootShell,
    binary: &str,
    target: &str,
    lines: mpsc::Sender<String>,
) -> Result<Option<i32>> {
    shell.stream(&ping_command(binary, target), lines).await
}
