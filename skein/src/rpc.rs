use crate::master::ApplicationMaster;
use crate::report::{ApplicationReport, Container, ContainerState, FinalStatus};
use crate::spec::{ApplicationSpec, ServiceSpec};
use crate::SkeinResult;
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tarpc::context::Context;
use tarpc::server::{BaseChannel, Channel};
use tokio::task::JoinHandle;
use tarpc::tokio_serde::formats::Bincode;


pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced across the rpc boundary, one variant per error kind a
/// client is expected to distinguish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RpcError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// The Master service: the rpc surface served by every application master,
/// used by both the user client and the application's own containers.
#[tarpc::service]
pub trait MasterRpc {
    /// Get a key's value; with `wait` the call blocks until the key is set.
    async fn kv_get(key: String, wait: bool) -> RpcResult<String>;
    async fn kv_set(key: String, value: String) -> RpcResult<()>;
    async fn kv_del(key: String) -> RpcResult<()>;
    async fn kv_get_all() -> BTreeMap<String, String>;
    async fn get_application_spec() -> ApplicationSpec;
    async fn get_service(name: String) -> RpcResult<ServiceSpec>;
    async fn get_containers(
        states: Option<Vec<ContainerState>>,
        services: Option<Vec<String>>,
    ) -> RpcResult<Vec<Container>>;
    async fn kill_container(service: String, instance: u32) -> RpcResult<()>;
    async fn scale(service: String, instances: u32) -> RpcResult<()>;
    async fn shutdown(final_status: FinalStatus) -> RpcResult<()>;
    async fn status() -> ApplicationReport;
}

impl MasterRpc for Arc<ApplicationMaster> {
    async fn kv_get(self, _cx: Context, key: String, wait: bool) -> RpcResult<String> {
        if wait {
            self.wait_key(&key).await
        } else {
            self.get_key(&key)
        }
    }

    async fn kv_set(self, _cx: Context, key: String, value: String) -> RpcResult<()> {
        self.set_key(key, value).await
    }

    async fn kv_del(self, _cx: Context, key: String) -> RpcResult<()> {
        self.del_key(&key)
    }

    async fn kv_get_all(self, _cx: Context) -> BTreeMap<String, String> {
        self.kv_snapshot()
    }

    async fn get_application_spec(self, _cx: Context) -> ApplicationSpec {
        self.application_spec().clone()
    }

    async fn get_service(self, _cx: Context, name: String) -> RpcResult<ServiceSpec> {
        self.service_spec(&name)
    }

    async fn get_containers(
        self,
        _cx: Context,
        states: Option<Vec<ContainerState>>,
        services: Option<Vec<String>>,
    ) -> RpcResult<Vec<Container>> {
        self.container_snapshot(states, services)
    }

    #[instrument(skip(self, _cx))]
    async fn kill_container(self, _cx: Context, service: String, instance: u32) -> RpcResult<()> {
        self.kill_instance(&service, instance).await
    }

    #[instrument(skip(self, _cx))]
    async fn scale(self, _cx: Context, service: String, instances: u32) -> RpcResult<()> {
        self.rescale(&service, instances).await
    }

    #[instrument(skip(self, _cx))]
    async fn shutdown(self, _cx: Context, final_status: FinalStatus) -> RpcResult<()> {
        self.request_shutdown(final_status, String::new()).await
    }

    async fn status(self, _cx: Context) -> ApplicationReport {
        self.report()
    }
}

/// Bind the master rpc server, walking forward from the configured port if it
/// is taken. Returns the bound address and the serving task.
pub(crate) async fn bind_master(
    am: Arc<ApplicationMaster>,
    config_addr: SocketAddr,
) -> SkeinResult<(SocketAddr, JoinHandle<()>)> {
    let mut bind_addr = config_addr;
    let mut listener = loop {
        match tarpc::serde_transport::tcp::listen(&bind_addr, Bincode::default).await {
            Ok(listener) => break listener,
            Err(err) => {
                let port = bind_addr.port();
                if port == 0 || port == u16::MAX {
                    bail!("failed to bind rpc server to `{}`: {}", config_addr, err);
                }
                bind_addr.set_port(port + 1);
            }
        }
    };
    let addr = listener.local_addr();
    listener.config_mut().max_frame_length(usize::MAX);

    let handle = tokio::spawn(async move {
        listener
            // Ignore tcp accept errors
            .filter_map(|r| future::ready(r.ok()))
            .map(BaseChannel::with_defaults)
            .map(|channel| channel.execute(Arc::clone(&am).serve()).for_each(spawn))
            .buffer_unordered(64)
            .for_each(|()| async {})
            .await;
    });

    Ok((addr, handle))
}

pub(crate) async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// Connect to an application master's rpc endpoint.
pub async fn connect_master(addr: SocketAddr) -> SkeinResult<MasterRpcClient> {
    let mk_codec = Bincode::default;
    let connect = tarpc::serde_transport::tcp::connect(addr, mk_codec);
    let transport = tokio::time::timeout(Duration::from_secs(5), connect)
        .await
        .map_err(|_| eyre!("connection to application master at `{}` timed out", addr))??;
    Ok(MasterRpcClient::new(tarpc::client::Config::default(), transport).spawn())
}

/// A context with a deadline long enough for blocking calls like
/// `kv_get(wait = true)`, which may legitimately park for hours.
pub fn blocking_context() -> Context {
    let mut cx = tarpc::context::current();
    cx.deadline = std::time::SystemTime::now() + Duration::from_secs(60 * 60 * 24);
    cx
}
