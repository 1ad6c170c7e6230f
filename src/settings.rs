use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, TailcontrolError};
use crate::exec::{CommandExecutor, RootShell, shell_quote};

/// Connection preferences passed to `tailscale set` and `tailscale login`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    accept_routes: bool,
    accept_dns: bool,
    advertise_exit_node: bool,
    exit_node: String,
    advertise_routes: String,
    hostname: String,
    /// Appended verbatim, e.g. `--webclient --update-check=false`.
    extra_args: String,
}

impl Settings {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn accept_routes(&mut self, accept: bool) -> &mut Self {
        let new = self;
        new.accept_routes = accept;
        new
    }

    pub fn accept_dns(&mut self, accept: bool) -> &mut Self {
        let new = self;
        new.accept_dns = accept;
        new
    }

    pub fn advertise_exit_node(&mut self, advertise: bool) -> &mut Self {
        let new = self;
        new.advertise_exit_node = advertise;
        new
    }

    pub fn exit_node(&mut self, node: impl Into<String>) -> &mut Self {
        let new = self;
        new.exit_node = node.into();
        new
    }

    pub fn advertise_routes(&mut self, routes: impl Into<String>) -> &mut Self {
        let new = self;
        new.advertise_routes = routes.into();
        new
    }

    pub fn hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        let new = self;
        new.hostname = hostname.into();
        new
    }

    pub fn extra_args(&mut self, args: impl Into<String>) -> &mut Self {
        let new = self;
        new.extra_args = args.into();
        new
    }

    /// Flags in the order the CLI documents them. Empty strings are passed
    /// through so that `set` clears the corresponding preference.
    pub fn to_args(&self) -> String {
        let mut args = vec![
            format!("--accept-routes={}", self.accept_routes),
            format!("--accept-dns={}", self.accept_dns),
            format!("--advertise-exit-node={}", self.advertise_exit_node),
            format!("--exit-node {}", shell_quote(&self.exit_node)),
            format!("--advertise-routes {}", shell_quote(&self.advertise_routes)),
            format!("--hostname {}", shell_quote(&self.hostname)),
        ];
        let extra = self.extra_args.trim();
        if !extra.is_empty() {
            args.push(extra.to_string());
        }
        args.join(" ")
    }

    pub fn set_command(&self, binary: &str) -> String {
        format!("{binary} set {}", self.to_args())
    }

    pub fn login_command(&self, binary: &str) -> String {
        format!("{binary} login {}", self.to_args())
    }

    /// Runs `tailscale set`. The CLI is silent on success, so any output is
    /// treated as a rejection.
    pub async fn apply(&self, exec: &dyn CommandExecutor, binary: &str) -> Result<()> {
        let out = exec.execute(&self.set_command(binary)).await;
        if out.is_empty() {
            Ok(())
        } else {
            Err(TailcontrolError::Rejected(out))
        }
    }

    /// Runs `tailscale login` with these preferences and reports its output
    /// on `events` until the command exits.
    pub async fn login(
        &self,
        shell: &RootShell,
        binary: &str,
        events: mpsc::Sender<LoginEvent>,
    ) -> Result<Option<i32>> {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        let command = self.login_command(binary);
        let relay = async move {
            while let Some(line) = rx.recv().await {
                for event in login_events(&line) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        };
        let (code, ()) = tokio::join!(shell.stream(&command, tx), relay);
        code
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    Line(String),
    /// Browser URL that completes the login.
    Url(String),
    Success,
}

/// Every line is reported; URLs and the success marker additionally.
pub fn login_events(line: &str) -> Vec<LoginEvent> {
    let mut events = vec![LoginEvent::Line(line.to_string())];
    if let Some(url) = parse_login_url(line) {
        events.push(LoginEvent::Url(url.to_string()));
    }
    if is_login_success(line) {
        events.push(LoginEvent::Success);
    }
    events
}

/// Authentication URL printed by `tailscale login`, if `line` carries one.
pub fn parse_login_url(line: &str) -> Option<&str> {
    line.split_whitespace()
        .find(|word| word.starts_with("https://"))
}

/// `tailscale login` prints this once the browser flow has completed.
pub fn is_login_success(line: &str) -> bool {
    line.contains("Success.")
}
