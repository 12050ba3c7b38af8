use clap::Parser;
use skein::config::{self, DaemonConfig};
use skein::daemon::{bind_daemon, Daemon};
use skein::SkeinResult;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
struct Opts {
    /// Address to serve the daemon rpc on
    #[clap(long, default_value_t = config::default_daemon_addr())]
    addr: SocketAddr,
    /// Directory the local cluster backend runs containers under
    #[clap(long)]
    workdir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> SkeinResult<()> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    let mut config = DaemonConfig { addr: opts.addr, ..DaemonConfig::default() };
    if let Some(workdir) = opts.workdir {
        config.workdir = workdir;
    }
    let addr = config.addr;
    let daemon = Daemon::new(config);
    let (bind_addr, handle) = bind_daemon(daemon, addr).await?;
    print!("skein://{}", bind_addr);
    std::io::stdout().flush()?;
    handle.await?;
    Ok(())
}
