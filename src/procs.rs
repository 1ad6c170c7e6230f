//! Process-table inspection.
//!
//! The supervisor only needs a handful of questions answered about running
//! processes. [`ShellProcessTable`] answers them by scraping `ps`/`pgrep`
//! output through the root shell, which is the only option when the caller
//! is not itself privileged. [`NativeProcessTable`] reads `/proc` and sends
//! signals directly for hosts that already run as root.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, TailcontrolError};
use crate::exec::CommandExecutor;

pub type ProcessId = libc::pid_t;

#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn is_alive(&self, pid: ProcessId) -> bool;

    /// Asks `pid` to exit (SIGTERM).
    async fn terminate(&self, pid: ProcessId) -> Result<()>;

    /// Number of processes whose name is exactly `name`.
    async fn count_instances(&self, name: &str) -> usize;

    /// SIGKILLs every process named exactly `name`.
    async fn kill_all(&self, name: &str) -> Result<()>;

    /// Finds a direct child of `parent` running `name`.
    async fn resolve_child(&self, parent: ProcessId, name: &str) -> Option<ProcessId>;
}

pub struct ShellProcessTable {
    exec: Arc<dyn CommandExecutor>,
}

impl ShellProcessTable {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        ShellProcessTable { exec }
    }

    async fn quiet(&self, command: &str) -> Result<()> {
        let out = self.exec.execute(command).await;
        if out.is_empty() {
            Ok(())
        } else {
            Err(TailcontrolError::Process(out))
        }
    }
}

#[async_trait]
impl ProcessTable for ShellProcessTable {
    async fn is_alive(&self, pid: ProcessId) -> bool {
        // kill -0 is silent when the target exists
        self.exec.execute(&format!("kill -0 {pid}")).await.is_empty()
    }

    async fn terminate(&self, pid: ProcessId) -> Result<()> {
        self.quiet(&format!("kill {pid}")).await
    }

    async fn count_instances(&self, name: &str) -> usize {
        let out = self.exec.execute(&format!("pgrep -x {name}")).await;
        count_pid_lines(&out)
    }

    async fn kill_all(&self, name: &str) -> Result<()> {
        self.quiet(&format!("pkill -9 -x {name}")).await
    }

    async fn resolve_child(&self, parent: ProcessId, name: &str) -> Option<ProcessId> {
        let out = self.exec.execute(&format!("ps -A | grep {parent}")).await;
        let child = parse_child_pid(&out, parent, name);
        if child.is_none() {
            debug!(parent, name, ps = %out, "no matching child in process listing");
        }
        child
    }
}

/// Lines of `pgrep` output that are process ids.
pub fn count_pid_lines(output: &str) -> usize {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.parse::<ProcessId>().is_ok())
        .count()
}

/// Picks the pid of a `name` process whose parent is `parent` out of a
/// `ps -A` listing (`USER PID PPID ... NAME` columns).
pub fn parse_child_pid(listing: &str, parent: ProcessId, name: &str) -> Option<ProcessId> {
    let pattern = format!(
        r"(?m)(?:^|\s)(\d+)\s+{parent}\s+.*{}",
        regex::escape(name)
    );
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!(error = %e, "bad child pid pattern");
            return None;
        }
    };
    re.captures_iter(listing)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<ProcessId>().ok())
        .find(|pid| *pid != parent)
}

/// Direct `/proc` + signal implementation. Requires the caller to be allowed
/// to signal the target processes.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Default, Clone)]
pub struct NativeProcessTable;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod native {
    use std::path::Path;

    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct ProcEntry {
        pub pid: ProcessId,
        pub ppid: ProcessId,
        pub comm: String,
    }

    /// Parses `/proc/<pid>/stat`. The command name is parenthesised and may
    /// itself contain spaces or parentheses, so split on the last `)`.
    pub(crate) fn parse_stat(stat: &str) -> Option<ProcEntry> {
        let open = stat.find('(')?;
        let close = stat.rfind(')')?;
        let pid = stat[..open].trim().parse().ok()?;
        let comm = stat.get(open + 1..close)?.to_string();
        let mut rest = stat[close + 1..].split_whitespace();
        let _state = rest.next()?;
        let ppid = rest.next()?.parse().ok()?;
        Some(ProcEntry { pid, ppid, comm })
    }

    pub(crate) fn scan(root: &Path) -> Vec<ProcEntry> {
        let Ok(dir) = std::fs::read_dir(root) else {
            return Vec::new();
        };
        dir.filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()))
            })
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
            .filter_map(|stat| parse_stat(&stat))
            .collect()
    }

    async fn snapshot() -> Vec<ProcEntry> {
        tokio::task::spawn_blocking(|| scan(Path::new("/proc")))
            .await
            .unwrap_or_default()
    }

    fn signal(pid: ProcessId, sig: Signal) -> Result<()> {
        match kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(TailcontrolError::Process(format!("{sig:?} to {pid}: {e}"))),
        }
    }

    #[async_trait]
    impl ProcessTable for NativeProcessTable {
        async fn is_alive(&self, pid: ProcessId) -> bool {
            if pid <= 0 {
                return false;
            }
            // EPERM still proves the process exists
            matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
        }

        async fn terminate(&self, pid: ProcessId) -> Result<()> {
            signal(pid, Signal::SIGTERM)
        }

        async fn count_instances(&self, name: &str) -> usize {
            snapshot().await.iter().filter(|p| p.comm == name).count()
        }

        async fn kill_all(&self, name: &str) -> Result<()> {
            let mut failures = Vec::new();
            for proc in snapshot().await.into_iter().filter(|p| p.comm == name) {
                if let Err(e) = signal(proc.pid, Signal::SIGKILL) {
                    failures.push(e.to_string());
                }
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(TailcontrolError::Process(failures.join("; ")))
            }
        }

        async fn resolve_child(&self, parent: ProcessId, name: &str) -> Option<ProcessId> {
            snapshot()
                .await
                .into_iter()
                .find(|p| p.ppid == parent && p.comm == name)
                .map(|p| p.pid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecOutput;
    use std::sync::Mutex;

    const PS_LISTING: &str = "\
root          4519     1 10904200  3352 0                   0 S sh
root          4521  4519 10936072 24640 0                   0 S tailscale
u0_a245      14519   602 14897460 98660 0                   0 S top.example.app
";

    #[test]
    fn child_pid_found_by_parent_and_name() {
        assert_eq!(parse_child_pid(PS_LISTING, 4519, "tailscale"), Some(4521));
    }

    #[test]
    fn child_pid_requires_exact_parent_and_name() {
        assert_eq!(parse_child_pid(PS_LISTING, 451, "tailscale"), None);
        assert_eq!(parse_child_pid(PS_LISTING, 4519, "tailscaled-other"), None);
        assert_eq!(parse_child_pid(PS_LISTING, 602, "tailscale"), None);
        assert_eq!(parse_child_pid("", 4519, "tailscale"), None);
    }

    #[test]
    fn pgrep_lines_are_counted() {
        assert_eq!(count_pid_lines("101\n102\n\n 103 \n"), 3);
        assert_eq!(count_pid_lines(""), 0);
        assert_eq!(count_pid_lines("permission denied"), 0);
    }

    struct Canned {
        reply: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for Canned {
        async fn run(&self, command: &str) -> ExecOutput {
            self.seen.lock().unwrap().push(command.to_string());
            ExecOutput {
                stdout: self.reply.clone(),
                ..ExecOutput::default()
            }
        }
    }

    fn table(reply: &str) -> (Arc<Canned>, ShellProcessTable) {
        let exec = Arc::new(Canned {
            reply: reply.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        (exec.clone(), ShellProcessTable::new(exec))
    }

    #[tokio::test]
    async fn shell_liveness_uses_silent_kill_zero() {
        let (exec, procs) = table("");
        assert!(procs.is_alive(77).await);
        assert_eq!(exec.seen.lock().unwrap().as_slice(), ["kill -0 77"]);

        let (_, procs) = table("kill: 77: No such process");
        assert!(!procs.is_alive(77).await);
    }

    #[tokio::test]
    async fn shell_kill_reports_output_as_failure() {
        let (exec, procs) = table("");
        procs.kill_all("tailscale").await.unwrap();
        assert_eq!(exec.seen.lock().unwrap().as_slice(), ["pkill -9 -x tailscale"]);

        let (_, procs) = table("kill: 9: Operation not permitted");
        assert!(matches!(
            procs.terminate(9).await,
            Err(TailcontrolError::Process(_))
        ));
    }

    #[tokio::test]
    async fn shell_resolves_child_from_ps() {
        let (exec, procs) = table(PS_LISTING);
        assert_eq!(procs.resolve_child(4519, "tailscale").await, Some(4521));
        assert_eq!(exec.seen.lock().unwrap().as_slice(), ["ps -A | grep 4519"]);
        assert_eq!(procs.count_instances("tailscale").await, 0);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    mod native_tests {
        use crate::procs::native::parse_stat;
        use crate::procs::{NativeProcessTable, ProcessId, ProcessTable};

        #[test]
        fn stat_line_with_odd_comm() {
            let entry = parse_stat("4521 (tail scale) (x)) S 4519 4521 0 0").unwrap();
            assert_eq!(entry.pid, 4521);
            assert_eq!(entry.ppid, 4519);
            assert_eq!(entry.comm, "tail scale) (x)");
            assert!(parse_stat("garbage").is_none());
        }

        #[tokio::test]
        async fn own_process_is_alive() {
            let procs = NativeProcessTable;
            assert!(procs.is_alive(std::process::id() as ProcessId).await);
            assert!(!procs.is_alive(0).await);
            assert!(!procs.is_alive(-5).await);
        }

        #[tokio::test]
        async fn resolves_and_terminates_spawned_child() {
            let mut child = tokio::process::Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .expect("spawn sleep");
            let pid = child.id().expect("child pid") as ProcessId;
            let procs = NativeProcessTable;

            let me = std::process::id() as ProcessId;
            assert_eq!(procs.resolve_child(me, "sleep").await, Some(pid));
            assert!(procs.count_instances("sleep").await >= 1);

            procs.terminate(pid).await.unwrap();
            let status = child.wait().await.unwrap();
            assert!(!status.success());
        }
    }
}
