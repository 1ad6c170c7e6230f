//! Parsing of `tailscale status --json`.
//!
//! All entry points are total: unreachable daemons, malformed JSON and
//! missing or mistyped fields degrade to documented defaults instead of
//! errors.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::well_known::Rfc3339, macros::format_description};
use tracing::debug;

/// Substring the CLI prints when it cannot reach `tailscaled`.
pub const DAEMON_UNREACHABLE_MARKER: &str = "failed to connect";

/// Placeholder for any identity field the payload does not provide.
pub const UNKNOWN: &str = "Unknown";

pub const STATUS_COMMAND: &str = "tailscale status --json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendState {
    Stopped,
    Running,
    Starting,
    NeedsLogin,
    /// The status command could not reach the daemon at all.
    DaemonOffline,
    /// Unrecognised state string or unparseable payload.
    Unknown,
}

impl BackendState {
    /// Maps the raw `BackendState` string. Anything outside the known set is `Unknown`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "Stopped" => BackendState::Stopped,
            "Running" => BackendState::Running,
            "Starting" => BackendState::Starting,
            "NeedsLogin" => BackendState::NeedsLogin,
            _ => BackendState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::Stopped => "Stopped",
            BackendState::Running => "Running",
            BackendState::Starting => "Starting",
            BackendState::NeedsLogin => "NeedsLogin",
            BackendState::DaemonOffline => "DaemonOffline",
            BackendState::Unknown => "Unknown",
        }
    }

    /// Whether the connection counts as "on" for toggle purposes.
    pub fn is_active(self) -> bool {
        matches!(self, BackendState::Running | BackendState::Starting)
    }

    /// Command that flips the connection from this state.
    pub fn toggle_command(self) -> &'static str {
        match self {
            BackendState::Running | BackendState::Starting => "tailscale down",
            BackendState::Stopped | BackendState::NeedsLogin => "tailscale up",
            BackendState::DaemonOffline => "tailscaled.service start && tailscale up",
            BackendState::Unknown => "tailscaled.service restart && tailscale up",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the tailnet as reported by the status payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Key of the entry in the `Peer` map (or `ID` of the self node).
    pub id: String,
    pub name: String,
    pub os: String,
    pub addresses: Vec<String>,
    /// First dotted-quad entry of `addresses`, or [`UNKNOWN`].
    pub primary_address: String,
    pub relay: String,
    pub last_seen_raw: String,
    pub last_seen: String,
    pub online: bool,
    /// `None` when the payload has no `PrimaryRoutes` field at all.
    pub primary_routes: Option<Vec<String>>,
    pub exit_node_capable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub backend: BackendState,
    pub self_node: Option<Device>,
    /// Display name of the logged-in user.
    pub user: Option<String>,
    pub devices: Vec<Device>,
}

impl StatusSnapshot {
    fn empty(backend: BackendState) -> Self {
        StatusSnapshot {
            backend,
            self_node: None,
            user: None,
            devices: Vec::new(),
        }
    }
}

pub fn is_daemon_unreachable(raw: &str) -> bool {
    raw.contains(DAEMON_UNREACHABLE_MARKER)
}

fn parse_root(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(root)) => Some(root),
        Ok(_) => {
            debug!("status payload is not a json object");
            None
        }
        Err(e) => {
            debug!(error = %e, "status payload is not valid json");
            None
        }
    }
}

/// Classifies the daemon lifecycle from raw status output.
pub fn parse_backend_state(raw: &str) -> BackendState {
    if is_daemon_unreachable(raw) {
        return BackendState::DaemonOffline;
    }
    match parse_root(raw) {
        Some(root) => backend_from_root(&root),
        None => BackendState::Unknown,
    }
}

/// Peers of the tailnet, online first and then by name.
pub fn parse_devices(raw: &str) -> Vec<Device> {
    if is_daemon_unreachable(raw) {
        return Vec::new();
    }
    parse_root(raw)
        .map(|root| devices_from_root(&root))
        .unwrap_or_default()
}

/// Backend state, self identity and peers in one pass.
pub fn parse_status(raw: &str) -> StatusSnapshot {
    if is_daemon_unreachable(raw) {
        return StatusSnapshot::empty(BackendState::DaemonOffline);
    }
    let Some(root) = parse_root(raw) else {
        return StatusSnapshot::empty(BackendState::Unknown);
    };

    let self_obj = root.get("Self").and_then(Value::as_object);
    let self_node = self_obj.map(|obj| {
        let id = str_field(obj, "ID").unwrap_or_default();
        let mut node = device_from_entry(id, obj);
        if node.primary_address == UNKNOWN {
            if let Some(first) = node.addresses.first() {
                node.primary_address = first.clone();
            }
        }
        node
    });

    let user = self_obj
        .and_then(|obj| obj.get("UserID"))
        .and_then(|id| match id {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
        .and_then(|id| {
            root.get("User")
                .and_then(Value::as_object)?
                .get(&id)
                .and_then(Value::as_object)
                .and_then(|u| str_field(u, "DisplayName"))
                .map(str::to_string)
        });

    StatusSnapshot {
        backend: backend_from_root(&root),
        self_node,
        user,
        devices: devices_from_root(&root),
    }
}

fn backend_from_root(root: &Map<String, Value>) -> BackendState {
    BackendState::from_wire(str_field(root, "BackendState").unwrap_or_default())
}

fn devices_from_root(root: &Map<String, Value>) -> Vec<Device> {
    let Some(peers) = root.get("Peer").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut devices: Vec<Device> = peers
        .iter()
        .filter_map(|(id, entry)| entry.as_object().map(|obj| device_from_entry(id, obj)))
        .collect();
    sort_devices(&mut devices);
    devices
}

/// Online devices first, then by name. Stable.
pub fn sort_devices(devices: &mut [Device]) {
    devices.sort_by(|a, b| b.online.cmp(&a.online).then_with(|| a.name.cmp(&b.name)));
}

fn device_from_entry(id: &str, obj: &Map<String, Value>) -> Device {
    let addresses = string_list(obj, "TailscaleIPs").unwrap_or_default();
    let last_seen_raw = str_field(obj, "LastSeen").unwrap_or(UNKNOWN).to_string();

    Device {
        id: id.to_string(),
        name: derive_name(str_field(obj, "DNSName"), str_field(obj, "HostName")),
        os: str_field(obj, "OS").unwrap_or(UNKNOWN).to_string(),
        primary_address: primary_ipv4(&addresses).unwrap_or(UNKNOWN).to_string(),
        addresses,
        relay: str_field(obj, "Relay").unwrap_or_default().to_string(),
        last_seen: normalize_last_seen(&last_seen_raw),
        last_seen_raw,
        online: bool_field(obj, "Online"),
        primary_routes: string_list(obj, "PrimaryRoutes"),
        exit_node_capable: bool_field(obj, "ExitNodeOption"),
    }
}

/// First label of the DNS name, else the host name, else [`UNKNOWN`].
pub fn derive_name(dns_name: Option<&str>, host_name: Option<&str>) -> String {
    let from_dns = dns_name
        .map(|dns| dns.trim().trim_end_matches('.'))
        .and_then(|dns| dns.split('.').next())
        .filter(|label| !label.is_empty());

    from_dns
        .or(host_name.filter(|h| !h.trim().is_empty()))
        .unwrap_or(UNKNOWN)
        .to_string()
}

/// First address made of four dot-separated digit runs.
pub fn primary_ipv4(addresses: &[String]) -> Option<&str> {
    addresses
        .iter()
        .map(String::as_str)
        .find(|addr| is_dotted_quad(addr))
}

fn is_dotted_quad(addr: &str) -> bool {
    let mut parts = 0;
    for part in addr.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 4
}

/// Reformats an RFC 3339 timestamp as `yyyy-MM-dd HH:mm:ss` in its own
/// offset. Blank input becomes [`UNKNOWN`]; anything unparseable is returned
/// unchanged.
pub fn normalize_last_seen(raw: &str) -> String {
    if raw.trim().is_empty() {
        return UNKNOWN.to_string();
    }
    let parsed = match OffsetDateTime::parse(raw, &Rfc3339) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(raw, error = %e, "last-seen is not rfc 3339, keeping raw value");
            return raw.to_string();
        }
    };
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    parsed.format(format).unwrap_or_else(|_| raw.to_string())
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn string_list(obj: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    obj.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}
