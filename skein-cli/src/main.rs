use clap::{Parser, Subcommand};
use skein::config;
use skein::daemon::{connect_daemon, DaemonRpcClient};
use skein::report::{
    ApplicationId, ApplicationReport, ApplicationState, Container, ContainerState, FinalStatus,
};
use skein::rpc::{blocking_context, connect_master, MasterRpcClient, RpcError};
use skein::ApplicationSpec;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tarpc::context;

#[derive(Parser)]
#[clap(name = "skein", version, about = "Define and run YARN applications")]
struct Cli {
    /// Address of the skein daemon, defaults to $SKEIN_DAEMON_ADDRESS
    #[clap(long, global = true)]
    daemon: Option<SocketAddr>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit an application specification and print the application id
    Submit {
        /// The specification file (yaml or json)
        spec: PathBuf,
    },
    /// Show the status of an application
    Status {
        app_id: String,
    },
    /// Kill an application
    Kill {
        app_id: String,
    },
    /// Manage applications
    #[clap(subcommand)]
    Application(ApplicationCommand),
    /// Manage containers
    #[clap(subcommand)]
    Container(ContainerCommand),
    /// Manage an application's key-value store
    #[clap(subcommand)]
    Kv(KvCommand),
}

#[derive(Subcommand)]
enum ApplicationCommand {
    /// List applications
    Ls {
        /// Show all applications (default is only active applications)
        #[clap(long, short)]
        all: bool,
        /// Filter by application state, may be repeated
        #[clap(long, short)]
        state: Vec<String>,
    },
    /// Shutdown an application, overriding its final status
    Shutdown {
        /// The application id, or `current` from inside a container
        app_id: String,
        /// The final application status
        #[clap(long, default_value = "SUCCEEDED")]
        status: String,
    },
}

#[derive(Subcommand)]
enum ContainerCommand {
    /// List an application's containers
    Ls {
        /// The application id, or `current` from inside a container
        app_id: String,
        /// Show all containers (default is only active containers)
        #[clap(long, short)]
        all: bool,
        /// Filter by service name, may be repeated
        #[clap(long)]
        service: Vec<String>,
        /// Filter by container state, may be repeated
        #[clap(long)]
        state: Vec<String>,
    },
    /// Kill a single container instance
    Kill {
        app_id: String,
        service: String,
        instance: u32,
    },
    /// Scale a service to a requested number of instances
    Scale {
        app_id: String,
        service: String,
        number: u32,
    },
}

#[derive(Subcommand)]
enum KvCommand {
    /// Get a value from the key-value store
    Get {
        app_id: String,
        key: String,
        /// Block until the key is set
        #[clap(long)]
        wait: bool,
    },
    /// Set a value in the key-value store
    Set {
        app_id: String,
        key: String,
        value: String,
    },
    /// Delete a key from the key-value store
    Del {
        app_id: String,
        key: String,
    },
    /// List the whole key-value store
    Ls {
        app_id: String,
    },
}

/// Exit codes: 0 success, 1 user error, 2 cluster or application master
/// unreachable, 3 not found.
struct CliError {
    code: u8,
    message: String,
}

impl CliError {
    fn user(message: impl Display) -> Self {
        Self { code: 1, message: message.to_string() }
    }

    fn unreachable(message: impl Display) -> Self {
        Self { code: 2, message: message.to_string() }
    }
}

impl From<RpcError> for CliError {
    fn from(err: RpcError) -> Self {
        let code = match err {
            RpcError::NotFound(_) => 3,
            RpcError::InvalidArgument(_)
            | RpcError::FailedPrecondition(_)
            | RpcError::ResourceExhausted(_) => 1,
            RpcError::Unavailable(_) | RpcError::Cancelled(_) | RpcError::Internal(_) => 2,
        };
        Self { code, message: err.to_string() }
    }
}

impl From<tarpc::client::RpcError> for CliError {
    fn from(err: tarpc::client::RpcError) -> Self {
        Self::unreachable(err)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt::try_init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let daemon = cli.daemon;
    match cli.command {
        Command::Submit { spec } => {
            let spec = ApplicationSpec::from_path(&spec).map_err(CliError::user)?;
            let app_id = daemon_client(daemon).await?.submit(context::current(), spec).await??;
            println!("{}", app_id);
        }
        Command::Status { app_id } => {
            let id = parse_app_id(&app_id)?;
            let report = daemon_client(daemon).await?.get_status(context::current(), id).await??;
            print_application_table(&[report]);
        }
        Command::Kill { app_id } => {
            let id = parse_app_id(&app_id)?;
            daemon_client(daemon).await?.kill(context::current(), id).await??;
        }
        Command::Application(ApplicationCommand::Ls { all, state }) => {
            let states = if all {
                None
            } else if state.is_empty() {
                Some(vec![
                    ApplicationState::Submitted,
                    ApplicationState::Accepted,
                    ApplicationState::Running,
                ])
            } else {
                Some(parse_each(&state)?)
            };
            let reports =
                daemon_client(daemon).await?.get_applications(context::current(), states).await?;
            print_application_table(&reports);
        }
        Command::Application(ApplicationCommand::Shutdown { app_id, status }) => {
            let status: FinalStatus = status.parse().map_err(CliError::user)?;
            master_client(daemon, &app_id).await?.shutdown(context::current(), status).await??;
        }
        Command::Container(command) => run_container(daemon, command).await?,
        Command::Kv(command) => run_kv(daemon, command).await?,
    }
    Ok(())
}

async fn run_container(daemon: Option<SocketAddr>, command: ContainerCommand) -> Result<(), CliError> {
    match command {
        ContainerCommand::Ls { app_id, all, service, state } => {
            let states = if all {
                None
            } else if state.is_empty() {
                Some(ContainerState::active())
            } else {
                Some(parse_each(&state)?)
            };
            let services = if service.is_empty() { None } else { Some(service) };
            let containers = master_client(daemon, &app_id)
                .await?
                .get_containers(context::current(), states, services)
                .await??;
            print_container_table(&containers);
        }
        ContainerCommand::Kill { app_id, service, instance } => {
            master_client(daemon, &app_id)
                .await?
                .kill_container(context::current(), service, instance)
                .await??;
        }
        ContainerCommand::Scale { app_id, service, number } => {
            master_client(daemon, &app_id)
                .await?
                .scale(context::current(), service, number)
                .await??;
        }
    }
    Ok(())
}

async fn run_kv(daemon: Option<SocketAddr>, command: KvCommand) -> Result<(), CliError> {
    match command {
        KvCommand::Get { app_id, key, wait } => {
            let client = master_client(daemon, &app_id).await?;
            let cx = if wait { blocking_context() } else { context::current() };
            let value = client.kv_get(cx, key, wait).await??;
            println!("{}", value);
        }
        KvCommand::Set { app_id, key, value } => {
            master_client(daemon, &app_id).await?.kv_set(context::current(), key, value).await??;
        }
        KvCommand::Del { app_id, key } => {
            master_client(daemon, &app_id).await?.kv_del(context::current(), key).await??;
        }
        KvCommand::Ls { app_id } => {
            let pairs = master_client(daemon, &app_id).await?.kv_get_all(context::current()).await?;
            for (key, value) in pairs {
                println!("{}: {}", key, value);
            }
        }
    }
    Ok(())
}

async fn daemon_client(addr: Option<SocketAddr>) -> Result<DaemonRpcClient, CliError> {
    let addr = match addr {
        Some(addr) => addr,
        None => config::daemon_addr().map_err(CliError::user)?,
    };
    connect_daemon(addr).await.map_err(CliError::unreachable)
}

/// Resolve the master rpc endpoint for an application: `current` reads the
/// environment injected into every skein container, anything else asks the
/// daemon for the application report.
async fn master_client(daemon: Option<SocketAddr>, app_id: &str) -> Result<MasterRpcClient, CliError> {
    let addr = if app_id == "current" {
        config::appmaster_addr().map_err(CliError::user)?
    } else {
        let id = parse_app_id(app_id)?;
        let report = daemon_client(daemon).await?.get_status(context::current(), id).await??;
        report
            .address()
            .parse()
            .map_err(|_| CliError::unreachable(format!("bad master address `{}`", report.address())))?
    };
    connect_master(addr).await.map_err(CliError::unreachable)
}

fn parse_app_id(s: &str) -> Result<ApplicationId, CliError> {
    s.parse().map_err(CliError::user)
}

fn parse_each<T: std::str::FromStr>(values: &[String]) -> Result<Vec<T>, CliError>
where
    T::Err: Display,
{
    values.iter().map(|v| v.parse().map_err(CliError::user)).collect()
}

fn print_application_table(reports: &[ApplicationReport]) {
    let rows = reports
        .iter()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.name.clone(),
                a.state.to_string(),
                a.final_status.to_string(),
                a.usage.num_used_containers.to_string(),
                a.usage.used_resources.vcores.to_string(),
                a.usage.used_resources.memory.to_string(),
                humanize_duration(a.runtime()),
            ]
        })
        .collect();
    print!(
        "{}",
        format_table(
            &["application_id", "name", "state", "status", "containers", "vcores", "memory", "runtime"],
            rows,
        )
    );
}

fn print_container_table(containers: &[Container]) {
    let rows = containers
        .iter()
        .map(|c| {
            vec![
                c.service_name.clone(),
                c.id(),
                c.state.to_string(),
                humanize_duration(c.runtime()),
            ]
        })
        .collect();
    print!("{}", format_table(&["service", "id", "state", "runtime"], rows));
}

fn format_table(header: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let mut out = String::new();
    let render = |out: &mut String, cells: Vec<String>| {
        let line = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect::<Vec<_>>()
            .join("    ");
        out.push_str(line.trim_end());
        out.push('\n');
    };
    render(&mut out, header.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        render(&mut out, row);
    }
    out
}

fn humanize_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
