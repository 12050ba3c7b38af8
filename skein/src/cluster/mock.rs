use super::*;
use crate::report::ApplicationId;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    next_container: u64,
    requests: Vec<Resources>,
    launched: Vec<(YarnContainerId, LaunchContext)>,
    released: Vec<YarnContainerId>,
    stopped: Vec<YarnContainerId>,
    registration: Option<SocketAddr>,
    unregistration: Option<(FinalStatus, String)>,
}

/// In-memory cluster for tests: every request is granted immediately and
/// deterministically, launches are recorded rather than executed, and tests
/// drive completions by hand via [`MockCluster::complete`].
pub struct MockCluster {
    app_id: ApplicationId,
    sink: ClusterEventSink,
    maximum: Resources,
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new(app_id: ApplicationId, sink: ClusterEventSink) -> Arc<Self> {
        Self::with_maximum(app_id, sink, Resources::new(65536, 64))
    }

    pub fn with_maximum(app_id: ApplicationId, sink: ClusterEventSink, maximum: Resources) -> Arc<Self> {
        Arc::new(Self { app_id, sink, maximum, state: Mutex::new(MockState::default()) })
    }

    fn next_id(&self, state: &mut MockState) -> YarnContainerId {
        state.next_container += 1;
        YarnContainerId(format!(
            "container_{}_{:04}_01_{:06}",
            self.app_id.cluster_timestamp, self.app_id.seq, state.next_container
        ))
    }

    /// Report a launched container as finished with the given exit status.
    pub fn complete(&self, id: &YarnContainerId, exit_status: i32, diagnostics: &str) {
        let _ = self.sink.send(ClusterEvent::ContainersCompleted(vec![Completed {
            id: id.clone(),
            exit_status,
            diagnostics: diagnostics.into(),
        }]));
    }

    /// Inject a grant the application master never asked for.
    pub fn inject_allocation(&self, resources: Resources) -> YarnContainerId {
        let id = self.next_id(&mut self.state.lock().unwrap());
        let _ = self
            .sink
            .send(ClusterEvent::ContainersAllocated(vec![Allocation { id: id.clone(), resources }]));
        id
    }

    pub fn request_shutdown(&self) {
        let _ = self.sink.send(ClusterEvent::ShutdownRequested);
    }

    pub fn requests(&self) -> Vec<Resources> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn launched(&self) -> Vec<(YarnContainerId, LaunchContext)> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn released(&self) -> Vec<YarnContainerId> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn stopped(&self) -> Vec<YarnContainerId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn registered(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().registration
    }

    pub fn unregistration(&self) -> Option<(FinalStatus, String)> {
        self.state.lock().unwrap().unregistration.clone()
    }
}

#[async_trait]
impl ClusterInterface for MockCluster {
    async fn register(&self, addr: SocketAddr, _tracking_url: &str) -> SkeinResult<Registration> {
        self.state.lock().unwrap().registration = Some(addr);
        Ok(Registration { maximum_resources: self.maximum })
    }

    async fn unregister(&self, final_status: FinalStatus, diagnostics: &str) -> SkeinResult<()> {
        self.state.lock().unwrap().unregistration = Some((final_status, diagnostics.into()));
        Ok(())
    }

    async fn request_containers(&self, requests: &[Resources]) -> SkeinResult<()> {
        let allocations = {
            let mut state = self.state.lock().unwrap();
            requests
                .iter()
                .map(|&resources| {
                    state.requests.push(resources);
                    Allocation { id: self.next_id(&mut state), resources }
                })
                .collect::<Vec<_>>()
        };
        let _ = self.sink.send(ClusterEvent::ContainersAllocated(allocations));
        Ok(())
    }

    async fn release_container(&self, id: &YarnContainerId) -> SkeinResult<()> {
        self.state.lock().unwrap().released.push(id.clone());
        Ok(())
    }

    async fn launch_container(&self, id: &YarnContainerId, ctx: LaunchContext) -> SkeinResult<()> {
        self.state.lock().unwrap().launched.push((id.clone(), ctx));
        Ok(())
    }

    async fn stop_container(&self, id: &YarnContainerId) -> SkeinResult<()> {
        self.state.lock().unwrap().stopped.push(id.clone());
        self.complete(id, exit_status::KILLED_BY_APPMASTER, "Stopped by application master");
        Ok(())
    }
}
