use crate::cluster::{event_channel, ClusterInterface, LocalCluster};
use crate::config::DaemonConfig;
use crate::master::ApplicationMaster;
use crate::report::{
    now_millis, ApplicationId, ApplicationReport, ApplicationState, FinalStatus,
    ResourceUsageReport,
};
use crate::rpc::{self, RpcError, RpcResult};
use crate::spec::ApplicationSpec;
use crate::SkeinResult;
use dashmap::DashMap;
use futures::prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tarpc::context::Context;
use tarpc::server::{BaseChannel, Channel};
use tokio::task::JoinHandle;
use tarpc::tokio_serde::formats::Bincode;

/// The daemon service: a thin submit/status/kill proxy that owns the
/// connection to the cluster's submission interface. Clients discover each
/// application master's own rpc endpoint through the reports it returns.
#[tarpc::service]
pub trait DaemonRpc {
    async fn ping();
    async fn submit(spec: ApplicationSpec) -> RpcResult<ApplicationId>;
    async fn get_status(id: ApplicationId) -> RpcResult<ApplicationReport>;
    async fn get_applications(states: Option<Vec<ApplicationState>>) -> Vec<ApplicationReport>;
    /// Blocks until the application is running and its master endpoint is known.
    async fn wait_for_start(id: ApplicationId) -> RpcResult<ApplicationReport>;
    async fn kill(id: ApplicationId) -> RpcResult<()>;
}

/// An application the daemon knows about. Entries are registered before the
/// application master comes up, so the SUBMITTED/ACCEPTED phases are
/// observable through status queries.
enum AppEntry {
    /// Accepted for submission; the master is not serving yet (or never made
    /// it up, in which case the stored report is terminal).
    Pending(ApplicationReport),
    Started(Arc<ApplicationMaster>),
}

impl AppEntry {
    fn report(&self) -> ApplicationReport {
        match self {
            AppEntry::Pending(report) => report.clone(),
            AppEntry::Started(master) => master.report(),
        }
    }
}

/// Client-side daemon state. Applications run against the local-process
/// cluster backend, which stands in for the resource manager behind the same
/// interface boundary the yarn protocols use.
pub struct Daemon {
    config: DaemonConfig,
    cluster_timestamp: u64,
    app_seq: AtomicU32,
    apps: DashMap<ApplicationId, AppEntry>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            cluster_timestamp: now_millis(),
            app_seq: AtomicU32::new(0),
            apps: DashMap::new(),
        })
    }

    fn next_app_id(&self) -> ApplicationId {
        ApplicationId {
            cluster_timestamp: self.cluster_timestamp,
            seq: self.app_seq.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Validate the spec and launch an application master for it. Validation
    /// is atomic: a rejected spec creates no application. The application is
    /// registered before the master starts, so status queries observe the
    /// SUBMITTED and ACCEPTED phases.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn submit(&self, spec: ApplicationSpec) -> RpcResult<ApplicationId> {
        spec.validate().map_err(|err| RpcError::InvalidArgument(err.to_string()))?;
        spec.validate_resources(&self.config.maximum_resources)
            .map_err(|err| RpcError::ResourceExhausted(err.to_string()))?;

        let app_id = self.next_app_id();
        self.apps.insert(app_id, AppEntry::Pending(self.pending_report(app_id, &spec)));

        let (sink, events) = event_channel();
        let cluster = match LocalCluster::new(
            app_id,
            sink,
            self.config.workdir.join(app_id.to_string()),
            self.config.maximum_resources,
        ) {
            Ok(cluster) => cluster,
            Err(err) => {
                self.fail_pending(app_id, &err.to_string());
                return Err(RpcError::Internal(err.to_string()));
            }
        };
        // The cluster has accepted the submission; the master is still coming up.
        self.set_pending_state(app_id, ApplicationState::Accepted);

        let master = match ApplicationMaster::start(
            app_id,
            self.config.user.clone(),
            spec,
            cluster as Arc<dyn ClusterInterface>,
            events,
        )
        .await
        {
            Ok(master) => master,
            Err(err) => {
                self.fail_pending(app_id, &err.to_string());
                return Err(RpcError::Unavailable(err.to_string()));
            }
        };
        info!(%app_id, "application submitted");
        self.apps.insert(app_id, AppEntry::Started(master));
        Ok(app_id)
    }

    pub fn status(&self, id: ApplicationId) -> RpcResult<ApplicationReport> {
        self.apps
            .get(&id)
            .map(|entry| entry.value().report())
            .ok_or_else(|| not_found(id))
    }

    pub fn applications(&self, states: Option<Vec<ApplicationState>>) -> Vec<ApplicationReport> {
        let mut reports: Vec<_> = self
            .apps
            .iter()
            .map(|entry| entry.value().report())
            .filter(|report| states.as_ref().map_or(true, |states| states.contains(&report.state)))
            .collect();
        reports.sort_by_key(|report| report.id);
        reports
    }

    pub async fn wait_for_start(&self, id: ApplicationId) -> RpcResult<ApplicationReport> {
        loop {
            let master = {
                let entry = self.apps.get(&id).ok_or_else(|| not_found(id))?;
                match entry.value() {
                    AppEntry::Pending(report) if report.state.is_terminal() => {
                        return Ok(report.clone())
                    }
                    AppEntry::Pending(_) => None,
                    AppEntry::Started(master) => Some(Arc::clone(master)),
                }
            };
            match master {
                Some(master) => {
                    let mut rx = master.state_receiver();
                    rx.wait_for(|state| *state >= ApplicationState::Running)
                        .await
                        .map_err(|_| RpcError::Internal("application master went away".into()))?;
                    return Ok(master.report());
                }
                // Submission still in flight; check again shortly.
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    pub async fn kill(&self, id: ApplicationId) -> RpcResult<()> {
        let master = {
            let entry = self.apps.get(&id).ok_or_else(|| not_found(id))?;
            match entry.value() {
                AppEntry::Pending(report) if report.state.is_terminal() => return Ok(()),
                AppEntry::Pending(_) => {
                    return Err(RpcError::FailedPrecondition(format!(
                        "application `{}` is still being submitted",
                        id
                    )))
                }
                AppEntry::Started(master) => Arc::clone(master),
            }
        };
        match master.request_shutdown(FinalStatus::Killed, "Killed by user request".into()).await {
            Ok(()) => Ok(()),
            // Already finished; killing is a no-op.
            Err(RpcError::FailedPrecondition(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn pending_report(&self, id: ApplicationId, spec: &ApplicationSpec) -> ApplicationReport {
        ApplicationReport {
            id,
            name: spec.name.clone(),
            user: self.config.user.clone(),
            queue: spec.queue.clone(),
            tags: spec.tags.clone(),
            host: String::new(),
            port: 0,
            tracking_url: String::new(),
            state: ApplicationState::Submitted,
            final_status: FinalStatus::Undefined,
            progress: 0.0,
            usage: ResourceUsageReport::default(),
            diagnostics: String::new(),
            start_time: Some(now_millis()),
            finish_time: None,
        }
    }

    fn set_pending_state(&self, id: ApplicationId, state: ApplicationState) {
        if let Some(mut entry) = self.apps.get_mut(&id) {
            if let AppEntry::Pending(report) = entry.value_mut() {
                report.state = state;
            }
        }
    }

    /// A submission that never produced a serving master stays visible as a
    /// failed application.
    fn fail_pending(&self, id: ApplicationId, diagnostics: &str) {
        warn!(app_id = %id, diagnostics, "submission failed");
        if let Some(mut entry) = self.apps.get_mut(&id) {
            if let AppEntry::Pending(report) = entry.value_mut() {
                report.state = ApplicationState::Failed;
                report.final_status = FinalStatus::Failed;
                report.diagnostics = diagnostics.to_owned();
                report.finish_time = Some(now_millis());
            }
        }
    }
}

fn not_found(id: ApplicationId) -> RpcError {
    RpcError::NotFound(format!("application `{}` does not exist", id))
}

impl DaemonRpc for Arc<Daemon> {
    async fn ping(self, _cx: Context) {}

    async fn submit(self, _cx: Context, spec: ApplicationSpec) -> RpcResult<ApplicationId> {
        Daemon::submit(&self, spec).await
    }

    async fn get_status(self, _cx: Context, id: ApplicationId) -> RpcResult<ApplicationReport> {
        Daemon::status(&self, id)
    }

    async fn get_applications(
        self,
        _cx: Context,
        states: Option<Vec<ApplicationState>>,
    ) -> Vec<ApplicationReport> {
        Daemon::applications(&self, states)
    }

    async fn wait_for_start(self, _cx: Context, id: ApplicationId) -> RpcResult<ApplicationReport> {
        Daemon::wait_for_start(&self, id).await
    }

    async fn kill(self, _cx: Context, id: ApplicationId) -> RpcResult<()> {
        Daemon::kill(&self, id).await
    }
}

/// Bind the daemon rpc server, walking forward from the configured port if it
/// is taken.
pub async fn bind_daemon(
    daemon: Arc<Daemon>,
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
            .map(|channel| channel.execute(Arc::clone(&daemon).serve()).for_each(rpc::spawn))
            .buffer_unordered(64)
            .for_each(|()| async {})
            .await;
    });

    info!(%addr, "daemon rpc bound");
    Ok((addr, handle))
}

/// Connect to a running daemon.
pub async fn connect_daemon(addr: SocketAddr) -> SkeinResult<DaemonRpcClient> {
    let mk_codec = Bincode::default;
    let connect = tarpc::serde_transport::tcp::connect(addr, mk_codec);
    let transport = tokio::time::timeout(Duration::from_secs(5), connect)
        .await
        .map_err(|_| eyre!("connection to daemon at `{}` timed out", addr))??;
    Ok(DaemonRpcClient::new(tarpc::client::Config::default(), transport).spawn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Resources;

    fn daemon() -> Arc<Daemon> {
        let config = DaemonConfig {
            workdir: std::env::temp_dir().join("skein-daemon-tests"),
            ..DaemonConfig::default()
        };
        Daemon::new(config)
    }

    #[tokio::test]
    async fn submit_rejects_invalid_specs_without_creating_applications() {
        let daemon = daemon();
        let spec = ApplicationSpec::from_yaml(
            r#"
services:
  a:
    resources:
      memory: 128
      vcores: 1
    commands:
      - true
    depends:
      - a
"#,
        );
        // The cycle is caught at parse-time validation already.
        assert!(spec.is_err());

        // Rebuild the same invalid spec by hand to exercise the daemon path.
        let mut spec = ApplicationSpec::from_yaml(
            r#"
services:
  a:
    resources:
      memory: 128
      vcores: 1
    commands:
      - true
"#,
        )
        .unwrap();
        spec.services.get_mut("a").unwrap().depends.insert("a".into());
        assert!(matches!(Daemon::submit(&daemon, spec).await, Err(RpcError::InvalidArgument(_))));
        assert!(daemon.applications(None).is_empty());
    }

    #[tokio::test]
    async fn submit_rejects_oversized_resource_requests() {
        let daemon = daemon();
        let mut spec = ApplicationSpec::from_yaml(
            r#"
services:
  a:
    resources:
      memory: 128
      vcores: 1
    commands:
      - true
"#,
        )
        .unwrap();
        spec.services.get_mut("a").unwrap().resources = Resources::new(1 << 40, 1);
        assert!(matches!(Daemon::submit(&daemon, spec).await, Err(RpcError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn failed_submission_stays_visible_as_a_failed_application() {
        let config = DaemonConfig {
            // create_dir_all cannot succeed under a non-directory
            workdir: std::path::PathBuf::from("/dev/null/skein"),
            ..DaemonConfig::default()
        };
        let daemon = Daemon::new(config);
        let spec = ApplicationSpec::from_yaml(
            r#"
services:
  a:
    resources:
      memory: 128
      vcores: 1
    commands:
      - true
"#,
        )
        .unwrap();

        assert!(matches!(Daemon::submit(&daemon, spec).await, Err(RpcError::Internal(_))));

        let reports = daemon.applications(None);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, ApplicationState::Failed);
        assert_eq!(reports[0].final_status, FinalStatus::Failed);

        let report = daemon.status(reports[0].id).unwrap();
        assert!(!report.diagnostics.is_empty());
        // The failed submission is terminal, so killing it is a no-op.
        Daemon::kill(&daemon, reports[0].id).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_applications_are_not_found() {
        let daemon = daemon();
        let id = ApplicationId { cluster_timestamp: 1, seq: 99 };
        assert!(matches!(daemon.status(id), Err(RpcError::NotFound(_))));
        assert!(matches!(Daemon::kill(&daemon, id).await, Err(RpcError::NotFound(_))));
    }
}
