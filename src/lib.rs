//! Control-panel core for a rooted Tailscale client.
//!
//! This crate drives the `tailscale` command-line binary through a root shell
//! and turns what it prints into typed state. It is the part of a control
//! panel that has behaviour worth testing; presentation is left to the caller.
//!
//! # Features
//!
//! - Run privileged commands without ever failing at the API boundary
//! - Parse `tailscale status --json` into a backend state and a peer list
//! - Supervise a `tailscale file get --loop` receiver that survives host restarts
//! - Detect and purge leaked duplicate receivers
//! - Send files to peers with progress reporting
//! - Build `tailscale set`/`login` arguments and read `switch --list`
//! - Stream `tailscale login` and `tailscale ping`, summarise `tailscale netcheck`
//!
//! # Example: Status
//!
//! ```no_run
//! use tailcontrol::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shell = RootShell::default();
//!     let raw = shell.execute(STATUS_COMMAND).await;
//!
//!     let status = parse_status(&raw);
//!     println!("backend: {}", status.backend);
//!     for device in status.devices {
//!         println!("{} {} online={}", device.name, device.primary_address, device.online);
//!     }
//! }
//! ```
//!
//! # Example: Drop protection
//!
//! ```no_run
//! use std::sync::Arc;
//! use tailcontrol::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let shell: Arc<dyn CommandExecutor> = Arc::new(RootShell::default());
//!     let store = JsonFileStore::open("/data/local/tmp/tailcontrol/state.json")?;
//!
//!     let supervisor = DropSupervisor::new(
//!         shell.clone(),
//!         Arc::new(ShellProcessTable::new(shell)),
//!         DropState::new(Arc::new(store)),
//!         Diagnostics::new(),
//!         SupervisorConfig::default(),
//!     );
//!
//!     let request = DropRequest::new("/sdcard/Download/TailDrop/", ConflictBehavior::Rename);
//!     match supervisor.enable(request).await {
//!         LaunchOutcome::Active => println!("receiving"),
//!         LaunchOutcome::Blocked(state) => println!("tailscale is {state}"),
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     if let Some(plan) = supervisor.shutdown().await {
//!         println!("re-enable in {:?}", plan.delay);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Basic Usage
//!
//! 1. Pick a [`CommandExecutor`] (normally [`RootShell`])
//! 2. Feed its output to the parsers in [`status`]
//! 3. For drop protection, wire a [`DropSupervisor`] to a [`StateStore`] and a [`ProcessTable`]
//! 4. Observe [`Diagnostics`] and the phase receiver for progress

pub mod accounts;
pub mod config;
pub mod diag;
pub mod error;
pub mod exec;
pub mod netcheck;
pub mod procs;
pub mod settings;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod transfer;

pub use accounts::{Account, parse_accounts};
pub use config::{Config, DropConfig, ProcessTableKind, load_config, save_config};
pub use diag::Diagnostics;
pub use error::{Result, TailcontrolError};
pub use exec::{CommandExecutor, ExecOutput, RootShell, has_root};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use procs::NativeProcessTable;
pub use procs::{ProcessId, ProcessTable, ShellProcessTable};
pub use settings::{LoginEvent, Settings};
pub use status::{
    BackendState, Device, STATUS_COMMAND, StatusSnapshot, parse_backend_state, parse_devices,
    parse_status,
};
pub use store::{ConflictBehavior, DropState, JsonFileStore, MemoryStore, StateStore};
pub use supervisor::{
    DropPhase, DropRequest, DropSupervisor, DuplicateGuard, GuardReport, LaunchOutcome,
    RestartPlan, SupervisorConfig, TickOutcome,
};
pub use transfer::{TransferEvent, TransferOutcome, send_file};
