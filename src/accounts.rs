//! Profiles known to `tailscale switch`.

use serde::Serialize;

use crate::exec::CommandExecutor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: String,
    pub account: String,
    pub current: bool,
}

/// Parses `tailscale switch --list`:
///
/// ```text
/// ID    Tailnet             Account
/// 4a2f  example.com         alice@example.com*
/// 91c0  bob.github          bob@github
/// ```
///
/// The active profile is marked with a trailing `*`.
pub fn parse_accounts(output: &str) -> Vec<Account> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            let raw = parts[2];
            Some(Account {
                id: parts[0].to_string(),
                account: raw.trim_end_matches('*').to_string(),
                current: raw.ends_with('*'),
            })
        })
        .collect()
}

pub async fn list_accounts(exec: &dyn CommandExecutor, binary: &str) -> Vec<Account> {
    parse_accounts(&exec.execute(&format!("{binary} switch --list")).await)
}

pub fn switch_command(binary: &str, id: &str) -> String {
    format!("{binary} switch {id}")
}

pub fn logout_command(binary: &str) -> String {
    format!("{binary} logout")
}

/// Signs the current profile out. Returns whatever the CLI printed.
pub async fn logout(exec: &dyn CommandExecutor, binary: &str) -> String {
    exec.execute(&logout_command(binary)).await
}
