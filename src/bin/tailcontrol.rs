use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tailcontrol::diag::Tail;
use tailcontrol::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tailcontrol", about = "Drive a rooted tailscale install")]
struct Args {
    #[arg(long, default_value = "tailcontrol.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backend state, identity and peers.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Peers only, online first.
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Bring the connection up or down depending on its current state.
    Toggle,
    Accounts,
    Switch {
        id: String,
    },
    /// Apply connection preferences with `tailscale set`.
    Set(SettingsArgs),
    /// Log in with the given preferences, printing the authentication URL.
    Login(SettingsArgs),
    Logout,
    /// Summarise `tailscale netcheck`.
    Netcheck,
    /// Ping a peer until it answers or Ctrl-C.
    Ping {
        target: String,
    },
    /// Check that the configured shell grants root.
    Root,
    /// Send a file to a peer.
    Send {
        file: PathBuf,
        peer: String,
    },
    /// Keep a file receiver running until Ctrl-C.
    Drop {
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        conflict: Option<ConflictBehavior>,
    },
    /// Turn drop protection off and stop the tracked receiver.
    DropOff,
}

#[derive(clap::Args, Debug)]
struct SettingsArgs {
    #[arg(long)]
    accept_routes: bool,
    #[arg(long)]
    accept_dns: bool,
    #[arg(long)]
    advertise_exit_node: bool,
    #[arg(long, default_value = "")]
    exit_node: String,
    #[arg(long, default_value = "")]
    advertise_routes: String,
    #[arg(long, default_value = "")]
    hostname: String,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    extra: String,
}

impl SettingsArgs {
    fn settings(self) -> Settings {
        Settings::builder()
            .accept_routes(self.accept_routes)
            .accept_dns(self.accept_dns)
            .advertise_exit_node(self.advertise_exit_node)
            .exit_node(self.exit_node)
            .advertise_routes(self.advertise_routes)
            .hostname(self.hostname)
            .extra_args(self.extra)
            .clone()
    }
}

fn process_table(config: &Config, exec: Arc<dyn CommandExecutor>) -> Result<Arc<dyn ProcessTable>> {
    match config.process_table {
        ProcessTableKind::Shell => Ok(Arc::new(ShellProcessTable::new(exec))),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        ProcessTableKind::Native => Ok(Arc::new(NativeProcessTable)),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        ProcessTableKind::Native => Err(TailcontrolError::Config(
            "native process table needs /proc".into(),
        )),
    }
}

fn supervisor(config: &Config, exec: Arc<dyn CommandExecutor>) -> Result<DropSupervisor> {
    let store = JsonFileStore::open(&config.state_file)?;
    debug!(path = %store.path().display(), "opened state store");
    Ok(DropSupervisor::new(
        exec.clone(),
        process_table(config, exec)?,
        DropState::new(Arc::new(store)),
        Diagnostics::new(),
        config.supervisor(),
    ))
}

fn print_device(device: &Device) {
    let routes = device
        .primary_routes
        .as_ref()
        .map(|r| r.join(","))
        .unwrap_or_default();
    println!(
        "{:<20} {:<16} {:<8} {:<7} {:<20} {}{}",
        device.name,
        device.primary_address,
        device.os,
        if device.online { "online" } else { "offline" },
        device.last_seen,
        if device.exit_node_capable { "exit-node " } else { "" },
        routes,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    let shell = RootShell::new(&config.shell, &config.shell_flag);
    let exec: Arc<dyn CommandExecutor> = Arc::new(shell.clone());
    let status_command = format!("{} status --json", config.binary);

    match args.command {
        Command::Status { json } => {
            let status = parse_status(&exec.execute(&status_command).await);
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            println!("backend: {}", status.backend);
            if let Some(me) = &status.self_node {
                println!(
                    "self:    {} {} {}",
                    me.name,
                    me.primary_address,
                    if me.online { "online" } else { "offline" }
                );
            }
            if let Some(user) = &status.user {
                println!("user:    {user}");
            }
            for device in &status.devices {
                print_device(device);
            }
        }
        Command::Devices { json } => {
            let devices = parse_devices(&exec.execute(&status_command).await);
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                devices.iter().for_each(print_device);
            }
        }
        Command::Toggle => {
            let state = parse_backend_state(&exec.execute(&status_command).await);
            let command = state.toggle_command();
            info!(%state, command, "toggling");
            let out = exec.execute(command).await;
            if !out.is_empty() {
                println!("{out}");
            }
        }
        Command::Accounts => {
            for account in accounts::list_accounts(exec.as_ref(), &config.binary).await {
                println!(
                    "{} {}{}",
                    account.id,
                    account.account,
                    if account.current { " (current)" } else { "" }
                );
            }
        }
        Command::Switch { id } => {
            let out = exec
                .execute(&accounts::switch_command(&config.binary, &id))
                .await;
            println!("{out}");
        }
        Command::Set(args) => {
            args.settings()
                .apply(exec.as_ref(), &config.binary)
                .await?;
            println!("settings applied");
        }
        Command::Login(args) => {
            let (tx, mut rx) = mpsc::channel(16);
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        LoginEvent::Url(url) => println!("open {url} to authenticate"),
                        LoginEvent::Success => println!("logged in"),
                        LoginEvent::Line(line) => debug!(%line, "login"),
                    }
                }
            });
            let code = args
                .settings()
                .login(&shell, &config.binary, tx)
                .await?;
            let _ = printer.await;
            if code != Some(0) {
                println!("login exited with {code:?}");
            }
        }
        Command::Logout => {
            let out = accounts::logout(exec.as_ref(), &config.binary).await;
            if !out.is_empty() {
                println!("{out}");
            }
        }
        Command::Netcheck => match netcheck::netcheck(exec.as_ref(), &config.binary).await {
            Some(report) => println!("{report}"),
            None => println!("netcheck produced no report"),
        },
        Command::Ping { target } => {
            let (tx, mut rx) = mpsc::channel(16);
            let printer = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    println!("{line}");
                }
            });
            tokio::select! {
                code = netcheck::ping(&shell, &config.binary, &target, tx) => {
                    let _ = printer.await;
                    debug!(code = ?code?, "ping finished");
                }
                _ = tokio::signal::ctrl_c() => println!("ping stopped"),
            }
        }
        Command::Root => {
            if has_root(exec.as_ref()).await {
                println!("root granted by `{} {}`", config.shell, config.shell_flag);
            } else {
                return Err(TailcontrolError::Config(format!(
                    "`{} {} id` did not report uid=0",
                    config.shell, config.shell_flag
                )));
            }
        }
        Command::Send { file, peer } => {
            let (tx, mut rx) = mpsc::channel(64);
            let printer = tokio::spawn(async move {
                let mut last = None;
                while let Some(event) = rx.recv().await {
                    match event {
                        TransferEvent::Progress(p) if last != Some(p) => {
                            last = Some(p);
                            println!("{p}%");
                        }
                        TransferEvent::Progress(_) => {}
                        TransferEvent::Log(line) => debug!(%line, "sender"),
                    }
                }
            });
            let outcome = send_file(&shell, exec.clone(), &config.binary, &file, &peer, tx).await?;
            let _ = printer.await;
            println!("{}", outcome.message());
        }
        Command::Drop { path, conflict } => {
            if !has_root(exec.as_ref()).await {
                warn!(shell = %config.shell, "shell does not grant root, process control may fail");
            }
            let supervisor = supervisor(&config, exec)?;
            let request = DropRequest::new(
                path.unwrap_or_else(|| config.drop.watch_path.clone()),
                conflict.unwrap_or(config.drop.conflict),
            );

            let mut log = supervisor.diagnostics().subscribe();
            let mut tail = Tail::new();
            if let LaunchOutcome::Blocked(state) = supervisor.enable(request).await {
                println!("{}", supervisor.diagnostics().contents());
                println!("not started: tailscale is {state}");
                return Ok(());
            }

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                let fresh = tail.advance(&log.borrow_and_update());
                for line in fresh {
                    println!("{line}");
                }
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    changed = log.changed() => if changed.is_err() { break },
                }
            }

            if let Some(plan) = supervisor.shutdown().await {
                println!(
                    "drop switch still on; re-run `tailcontrol drop --path {} --conflict {}` after {:?} to resume",
                    plan.request.watch_path, plan.request.conflict, plan.delay
                );
            }
        }
        Command::DropOff => {
            let supervisor = supervisor(&config, exec)?;
            supervisor.disable().await;
            println!("{}", supervisor.diagnostics().contents());
        }
    }
    Ok(())
}
