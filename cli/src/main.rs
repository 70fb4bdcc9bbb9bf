use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use secrecy::Secret;
use tracing::info;

use common::telemtry::{get_subscriber, init_subscriber};
use qarax_cli::api::{Accepted, ApiClient, DEFAULT_WAIT_TIMEOUT, VmAction};
use qarax_cli::config::{self, Settings};
use qarax_cli::console::{ConsoleProxy, ConsoleTarget};
use qarax_cli::monitor::{MonitorSession, QmpMonitor};
use qarax_cli::output::{OutputFormat, render_vm, render_vms};
use qarax_cli::quorum::{CommandQuorum, QuorumCheck, Standalone};
use qarax_cli::relay::RelayOutcome;
use qarax_cli::tunnel::{ControlTunnel, TunnelOutcome};
use qarax_cli::vm::{VmId, VmStore};

#[derive(Parser, Debug)]
#[clap(
    name = "qarax",
    about = "qarax command line - VM consoles, monitor and control API",
    rename_all = "kebab-case",
    rename_all_env = "screaming-snake"
)]
struct Cli {
    /// Configuration file (default: ~/.config/qarax/config.toml)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// qarax API base URL
    #[clap(long, env = "QARAX_SERVER", global = true)]
    server: Option<String>,

    /// Directory holding VM sockets and pid files
    #[clap(long, env = "QARAX_RUNTIME_DIR", global = true)]
    runtime_dir: Option<PathBuf>,

    /// Directory holding per-VM configuration files
    #[clap(long, env = "QARAX_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Log at debug level (logs go to stderr)
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ActionArgs {
    vmid: VmId,

    /// Block until the API reports the operation finished
    #[clap(long)]
    wait: bool,

    /// Seconds to wait with --wait
    #[clap(long, default_value_t = DEFAULT_WAIT_TIMEOUT.as_secs())]
    wait_timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List VMs
    List {
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Show one VM
    Status {
        vmid: VmId,
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Start a VM
    Start(ActionArgs),
    /// Stop a VM
    Stop(ActionArgs),
    /// Pause a VM
    Pause(ActionArgs),
    /// Resume a paused VM
    Resume(ActionArgs),
    /// Delete a VM
    Delete { vmid: VmId },
    /// Relay stdin/stdout to the VM's VNC socket
    Vncproxy {
        vmid: VmId,
        /// Idle timeout in seconds
        #[clap(long)]
        timeout: Option<u64>,
        /// One-time VNC password installed before relaying
        #[clap(long, env = "QARAX_VNC_TICKET", hide_env_values = true)]
        ticket: Option<String>,
    },
    /// Attach to a VM serial console
    Terminal {
        vmid: VmId,
        /// Serial interface (serial0..serial3), defaults to the first socket one
        #[clap(long)]
        iface: Option<String>,
        /// Idle timeout in seconds
        #[clap(long)]
        timeout: Option<u64>,
    },
    /// Control channel gating a migration tunnel
    Mtunnel,
    /// Interactive monitor for a VM
    Monitor { vmid: VmId },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    let subscriber = get_subscriber("qarax".into(), filter.into(), std::io::stderr);
    init_subscriber(subscriber);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings =
        config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(server) = &cli.server {
        settings.server = server.clone();
    }
    if let Some(runtime_dir) = &cli.runtime_dir {
        settings.runtime_dir = runtime_dir.clone();
    }
    if let Some(config_dir) = &cli.config_dir {
        settings.config_dir = config_dir.clone();
    }
    Ok(settings)
}

fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(&cli)?;
    let store = VmStore::new(&settings.config_dir, &settings.runtime_dir);

    match cli.command {
        Command::List { output } => {
            let vms = api(&settings)?.list_vms()?;
            println!("{}", render_vms(&vms, output)?);
        }
        Command::Status { vmid, output } => {
            let vm = api(&settings)?.get_vm(vmid)?;
            println!("{}", render_vm(&vm, output)?);
        }
        Command::Start(args) => vm_action(&settings, args, VmAction::Start)?,
        Command::Stop(args) => vm_action(&settings, args, VmAction::Stop)?,
        Command::Pause(args) => vm_action(&settings, args, VmAction::Pause)?,
        Command::Resume(args) => vm_action(&settings, args, VmAction::Resume)?,
        Command::Delete { vmid } => api(&settings)?.delete_vm(vmid)?,
        Command::Vncproxy {
            vmid,
            timeout,
            ticket,
        } => {
            let target = ConsoleTarget::Vnc(ticket.map(Secret::new));
            console(&settings, store, vmid, &target, timeout)?;
        }
        Command::Terminal {
            vmid,
            iface,
            timeout,
        } => {
            console(&settings, store, vmid, &ConsoleTarget::Serial(iface), timeout)?;
        }
        Command::Mtunnel => mtunnel(&settings)?,
        Command::Monitor { vmid } => monitor(&settings, &store, vmid)?,
    }

    Ok(())
}

fn api(settings: &Settings) -> Result<ApiClient> {
    ApiClient::new(&settings.server).context("failed to build API client")
}

fn vm_action(settings: &Settings, args: ActionArgs, action: VmAction) -> Result<()> {
    let client = api(settings)?;
    let accepted = client
        .vm_action(args.vmid, action)
        .with_context(|| format!("failed to {} VM {}", action.as_str(), args.vmid))?;

    if args.wait {
        let timeout = Duration::from_secs(args.wait_timeout);
        match accepted {
            Accepted::Job(job_id) => {
                client.wait_for_job(job_id, timeout)?;
            }
            Accepted::Done => {
                client.wait_for_status(args.vmid, action.target_status(), timeout)?;
            }
        }
    }

    info!(vmid = %args.vmid, action = action.as_str(), "VM action accepted");
    Ok(())
}

fn console(
    settings: &Settings,
    store: VmStore,
    vmid: VmId,
    target: &ConsoleTarget,
    timeout: Option<u64>,
) -> Result<()> {
    let idle_timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.relay.idle_timeout());
    let proxy = ConsoleProxy::new(
        store,
        settings.relay.wait_policy(),
        idle_timeout,
        settings.monitor.timeout(),
    );

    let (outcome, _) = proxy.attach(vmid, target)?;
    if outcome == RelayOutcome::IdleTimeout {
        eprintln!(
            "console of VM {vmid} idle for {}s, closing",
            idle_timeout.as_secs()
        );
    }
    Ok(())
}

fn mtunnel(settings: &Settings) -> Result<()> {
    let quorum: Box<dyn QuorumCheck> = match settings
        .quorum
        .command
        .as_deref()
        .and_then(CommandQuorum::from_argv)
    {
        Some(command) => Box::new(command),
        None => Box::new(Standalone),
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let outcome = ControlTunnel::new(quorum).run(&mut stdin.lock(), &mut stdout.lock())?;
    if outcome == TunnelOutcome::NoQuorum {
        info!("mtunnel finished without quorum");
    }
    Ok(())
}

fn monitor(settings: &Settings, store: &VmStore, vmid: VmId) -> Result<()> {
    store.load(vmid)?;

    let endpoint = QmpMonitor::new(store.qmp_socket(vmid), settings.monitor.timeout());
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    MonitorSession::new(vmid, endpoint).run(&mut stdin.lock(), &mut stdout)?;
    stdout.flush()?;
    Ok(())
}
