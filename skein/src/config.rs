use crate::spec::Resources;
use crate::SkeinResult;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

pub const DEFAULT_DAEMON_PORT: u16 = 8470;

/// Environment injected into every container, alongside the user-defined
/// service environment.
pub const ENV_APPMASTER_ADDRESS: &str = "SKEIN_APPMASTER_ADDRESS";
pub const ENV_APPLICATION_ID: &str = "SKEIN_APPLICATION_ID";
pub const ENV_SERVICE: &str = "SKEIN_SERVICE";
pub const ENV_INSTANCE: &str = "SKEIN_INSTANCE";
pub const ENV_CONTAINER_ID: &str = "SKEIN_CONTAINER_ID";

/// Environment consulted by the cli to find the daemon.
pub const ENV_DAEMON_ADDRESS: &str = "SKEIN_DAEMON_ADDRESS";

pub fn default_daemon_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_DAEMON_PORT))
}

/// Resolve the daemon address from `SKEIN_DAEMON_ADDRESS`, falling back to
/// the default local address.
pub fn daemon_addr() -> SkeinResult<SocketAddr> {
    match std::env::var(ENV_DAEMON_ADDRESS) {
        Ok(addr) => addr
            .parse()
            .map_err(|_| eyre!("invalid address `{}` in ${}", addr, ENV_DAEMON_ADDRESS)),
        Err(_) => Ok(default_daemon_addr()),
    }
}

/// Resolve the address of the owning application master from inside a container.
pub fn appmaster_addr() -> SkeinResult<SocketAddr> {
    let addr = std::env::var(ENV_APPMASTER_ADDRESS)
        .map_err(|_| eyre!("${} is not set; not running inside a skein container?", ENV_APPMASTER_ADDRESS))?;
    addr.parse().map_err(|_| eyre!("invalid address `{}` in ${}", addr, ENV_APPMASTER_ADDRESS))
}

/// Configuration for the client-side daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub addr: SocketAddr,
    /// Base directory the local cluster backend runs containers under.
    pub workdir: PathBuf,
    /// The largest single-container allocation the backend will grant.
    pub maximum_resources: Resources,
    pub user: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: default_daemon_addr(),
            workdir: std::env::temp_dir().join("skein"),
            maximum_resources: Resources::new(65536, 64),
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
        }
    }
}
