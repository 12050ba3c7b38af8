mod reconciler;
mod registry;
mod scheduler;

#[cfg(test)]
mod tests;

use crate::cluster::{
    classify_exit_status, Allocation, ClusterEvent, ClusterEventStream, ClusterInterface, Completed,
    LaunchContext, YarnContainerId,
};
use crate::kv::KvStore;
use crate::report::{
    now_millis, ApplicationId, ApplicationReport, ApplicationState, Container, ContainerState,
    FinalStatus, ResourceUsageReport,
};
use crate::rpc::{self, RpcError, RpcResult};
use crate::spec::{ApplicationSpec, Resources, ServiceSpec};
use crate::SkeinResult;
use reconciler::{launch_context, Reconciler};
use registry::Registry;
use scheduler::DependencyScheduler;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

static_assertions::assert_impl_all!(Arc<ApplicationMaster>: Send, Sync);

/// The per-application coordinator that runs inside the cluster.
///
/// Owns all mutable application state: the container registry, the dependency
/// scheduler, the reconciler queue, and the key-value store. External readers
/// only ever observe this state through the master rpc surface.
pub struct ApplicationMaster {
    app_id: ApplicationId,
    user: String,
    spec: ApplicationSpec,
    cluster: Arc<dyn ClusterInterface>,
    kv: KvStore,
    /// Coarse lock over registry + scheduler + reconciler. The kv store is an
    /// independent lock domain; the two are never held together.
    core: Mutex<AmCore>,
    state_tx: watch::Sender<ApplicationState>,
    bind_addr: OnceLock<SocketAddr>,
    tracking_url: String,
    start_time: u64,
}

struct AmCore {
    registry: Registry,
    scheduler: DependencyScheduler,
    reconciler: Reconciler,
    state: ApplicationState,
    final_status: FinalStatus,
    diagnostics: String,
    finish_time: Option<u64>,
    shutting_down: bool,
}

/// Cluster calls collected under the core lock and executed after it is
/// released, so reconciler work never blocks rpc handlers.
#[derive(Default)]
struct Actions {
    requests: Vec<Resources>,
    launches: Vec<(YarnContainerId, LaunchContext)>,
    stops: Vec<YarnContainerId>,
    releases: Vec<YarnContainerId>,
    finish: Option<(FinalStatus, String)>,
}

impl ApplicationMaster {
    pub async fn start(
        app_id: ApplicationId,
        user: impl Into<String>,
        spec: ApplicationSpec,
        cluster: Arc<dyn ClusterInterface>,
        events: ClusterEventStream,
    ) -> SkeinResult<Arc<Self>> {
        spec.validate()?;
        let am = Arc::new(Self {
            app_id,
            user: user.into(),
            core: Mutex::new(AmCore {
                registry: Registry::new(&spec),
                scheduler: DependencyScheduler::new(&spec),
                reconciler: Reconciler::new(),
                state: ApplicationState::Accepted,
                final_status: FinalStatus::Undefined,
                diagnostics: String::new(),
                finish_time: None,
                shutting_down: false,
            }),
            spec,
            cluster,
            kv: KvStore::new(),
            state_tx: watch::channel(ApplicationState::Accepted).0,
            bind_addr: OnceLock::new(),
            tracking_url: String::new(),
            start_time: now_millis(),
        });

        let config_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let (addr, _rpc_handle) = rpc::bind_master(Arc::clone(&am), config_addr).await?;
        am.bind_addr.set(addr).expect("bind address already set");
        info!(app_id = %am.app_id, %addr, "application master rpc bound");

        let registration = retry("register", || am.cluster.register(addr, &am.tracking_url)).await?;
        // Reject the whole spec before any container is requested.
        if let Err(err) = am.spec.validate_resources(&registration.maximum_resources) {
            am.finalize(FinalStatus::Failed, err.to_string()).await;
            return Ok(am);
        }

        let actions = {
            let mut core = am.core.lock().unwrap();
            let mut actions = Actions::default();
            {
                let AmCore { registry, scheduler, reconciler, state, .. } = &mut *core;
                for (name, service) in &am.spec.services {
                    for _ in 0..service.instances {
                        registry.create_instance(name);
                    }
                }
                for name in scheduler.initialize(registry, &am.kv) {
                    schedule_waiting(registry, reconciler, &name, &mut actions);
                }
                *state = ApplicationState::Running;
            }
            // A spec whose services all want zero instances is already done.
            check_finished(&mut core, &mut actions);
            actions
        };
        am.state_tx.send_replace(ApplicationState::Running);
        am.perform(actions).await;

        tokio::spawn(Arc::clone(&am).run(events));
        Ok(am)
    }

    pub fn app_id(&self) -> ApplicationId {
        self.app_id
    }

    pub fn application_spec(&self) -> &ApplicationSpec {
        &self.spec
    }

    /// The address the master rpc is actually bound to.
    pub fn address(&self) -> SocketAddr {
        *self.bind_addr.get().expect("rpc server not bound")
    }

    pub fn state_receiver(&self) -> watch::Receiver<ApplicationState> {
        self.state_tx.subscribe()
    }

    /// Block until the application reaches a terminal state, returning the
    /// final status and diagnostics.
    pub async fn wait_finished(&self) -> (FinalStatus, String) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        let core = self.core.lock().unwrap();
        (core.final_status, core.diagnostics.clone())
    }

    async fn run(self: Arc<Self>, mut events: ClusterEventStream) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
            if self.core.lock().unwrap().state.is_terminal() {
                break;
            }
        }
        debug!(app_id = %self.app_id, "cluster event loop exited");
    }

    async fn handle_event(&self, event: ClusterEvent) {
        let actions = {
            let mut core = self.core.lock().unwrap();
            let mut actions = Actions::default();
            match event {
                ClusterEvent::ContainersAllocated(allocations) =>
                    self.handle_allocated(&mut core, allocations, &mut actions),
                ClusterEvent::ContainersCompleted(completed) =>
                    self.handle_completed(&mut core, completed, &mut actions),
                ClusterEvent::ShutdownRequested => {
                    if !core.shutting_down && !core.state.is_terminal() {
                        actions.finish =
                            Some((FinalStatus::Killed, "Shutdown requested by the cluster".into()));
                    }
                }
                ClusterEvent::NodesUpdated { updated } => debug!(updated, "cluster nodes updated"),
            }
            actions
        };
        self.perform(actions).await;
    }

    /// Bind each grant to the oldest compatible pending instance; grants with
    /// no pending match are handed back.
    fn handle_allocated(&self, core: &mut AmCore, allocations: Vec<Allocation>, actions: &mut Actions) {
        let AmCore { registry, reconciler, shutting_down, .. } = core;
        for allocation in allocations {
            if *shutting_down {
                actions.releases.push(allocation.id);
                continue;
            }
            match reconciler.match_allocation(registry, allocation.resources) {
                Some((service, instance)) => {
                    if registry.bind_allocation(&service, instance, allocation.id.clone()) {
                        let spec = &registry.service(&service).expect("bound service exists").spec;
                        let ctx = launch_context(
                            spec,
                            self.app_id,
                            self.address(),
                            &service,
                            instance,
                            &allocation.id,
                        );
                        actions.launches.push((allocation.id, ctx));
                    } else {
                        actions.releases.push(allocation.id);
                    }
                }
                None => {
                    debug!(id = %allocation.id, "no pending instance matches allocation, releasing");
                    actions.releases.push(allocation.id);
                }
            }
        }
    }

    fn handle_completed(&self, core: &mut AmCore, completed: Vec<Completed>, actions: &mut Actions) {
        for done in completed {
            let AmCore { registry, reconciler, shutting_down, .. } = &mut *core;
            let Some((service, instance)) = registry.lookup(&done.id) else {
                debug!(id = %done.id, "completion event for unknown container");
                continue;
            };
            let state = classify_exit_status(done.exit_status);
            if !registry.on_completed(&service, instance, state) {
                continue;
            }
            if state == ContainerState::Failed && !*shutting_down {
                let (restart, resources, eligible) = {
                    let svc = registry.service_mut(&service).expect("completed service exists");
                    svc.failures += 1;
                    (svc.can_restart(), svc.spec.resources, svc.eligible)
                };
                if restart {
                    let replacement = registry.create_instance(&service);
                    info!(service = %service, instance = replacement, "restarting failed container");
                    if eligible {
                        reconciler.enqueue(&service, replacement);
                        actions.requests.push(resources);
                    }
                } else {
                    let svc = registry.service_mut(&service).expect("completed service exists");
                    svc.failed = true;
                    svc.failure_diagnostics = format!(
                        "service `{}` failed: container {}_{} exited with status {}{}",
                        service,
                        service,
                        instance,
                        done.exit_status,
                        if done.diagnostics.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", done.diagnostics)
                        },
                    );
                    warn!(service = %service, "restart budget exhausted, marking service failed");
                }
            }
        }
        check_finished(core, actions);
    }

    /// Execute the cluster calls collected under the lock. A call that keeps
    /// failing past the retry budget takes the whole application down with a
    /// diagnostic naming the operation.
    async fn perform(&self, actions: Actions) {
        let Actions { requests, launches, stops, releases, finish } = actions;
        if !requests.is_empty() {
            if let Err(err) = retry("request_containers", || self.cluster.request_containers(&requests)).await
            {
                self.finalize(FinalStatus::Failed, format!("{:#}", err)).await;
                return;
            }
        }
        for (id, ctx) in launches {
            match retry("launch_container", || self.cluster.launch_container(&id, ctx.clone())).await {
                Ok(()) => {
                    let acked = {
                        let mut core = self.core.lock().unwrap();
                        match core.registry.lookup(&id) {
                            Some((service, instance)) => core.registry.on_launched(&service, instance),
                            None => false,
                        }
                    };
                    if !acked {
                        // Killed while the launch was in flight.
                        let _ = self.cluster.stop_container(&id).await;
                    }
                }
                Err(err) => {
                    self.finalize(FinalStatus::Failed, format!("{:#}", err)).await;
                    return;
                }
            }
        }
        for id in stops {
            if let Err(err) = retry("stop_container", || self.cluster.stop_container(&id)).await {
                self.finalize(FinalStatus::Failed, format!("{:#}", err)).await;
                return;
            }
        }
        for id in releases {
            if let Err(err) = retry("release_container", || self.cluster.release_container(&id)).await {
                self.finalize(FinalStatus::Failed, format!("{:#}", err)).await;
                return;
            }
        }
        if let Some((status, diagnostics)) = finish {
            self.finalize(status, diagnostics).await;
        }
    }

    /// Graceful teardown: stop granting work, kill everything non-terminal,
    /// unregister, and publish the terminal state. Only the first caller
    /// performs the transition; returns whether this call was the one.
    async fn finalize(&self, status: FinalStatus, diagnostics: String) -> bool {
        let stops = {
            let mut core = self.core.lock().unwrap();
            if core.shutting_down || core.state.is_terminal() {
                return false;
            }
            core.shutting_down = true;
            core.reconciler.clear();
            let mut stops = Vec::new();
            for service in core.registry.services_mut() {
                for container in service.containers.iter_mut().filter(|c| !c.state.is_terminal()) {
                    if let Some(id) = &container.yarn_container_id {
                        stops.push(id.clone());
                    }
                    container.state = ContainerState::Killed;
                    container.finish_time = Some(now_millis());
                }
            }
            core.final_status = status;
            core.diagnostics = diagnostics.clone();
            core.finish_time = Some(now_millis());
            core.state = match status {
                FinalStatus::Succeeded | FinalStatus::Undefined => ApplicationState::Finished,
                FinalStatus::Failed => ApplicationState::Failed,
                FinalStatus::Killed => ApplicationState::Killed,
            };
            stops
        };
        if diagnostics.is_empty() {
            info!(app_id = %self.app_id, %status, "application finished");
        } else {
            warn!(app_id = %self.app_id, %status, diagnostics = %diagnostics, "application finished");
        }
        for id in stops {
            let _ = self.cluster.stop_container(&id).await;
        }
        let _ = self.cluster.unregister(status, &diagnostics).await;
        let final_state = self.core.lock().unwrap().state;
        self.state_tx.send_replace(final_state);
        true
    }

    // ---- operations behind the master rpc surface ----

    pub fn get_key(&self, key: &str) -> RpcResult<String> {
        validate_key(key)?;
        self.kv
            .get(key)
            .ok_or_else(|| RpcError::NotFound(format!("key `{}` is not set", key)))
    }

    /// Blocks until the key has a value. Cancellation (client disconnect or
    /// deadline) drops the future, which deregisters the waiter.
    pub async fn wait_key(&self, key: &str) -> RpcResult<String> {
        validate_key(key)?;
        Ok(self.kv.wait(key).await)
    }

    pub async fn set_key(&self, key: String, value: String) -> RpcResult<()> {
        validate_key(&key)?;
        self.kv.set(key.clone(), value);
        let actions = {
            let mut core = self.core.lock().unwrap();
            let mut actions = Actions::default();
            if !core.shutting_down {
                let AmCore { registry, scheduler, reconciler, .. } = &mut *core;
                for service in scheduler.on_key_set(registry, &self.kv, &key) {
                    schedule_waiting(registry, reconciler, &service, &mut actions);
                }
            }
            actions
        };
        self.perform(actions).await;
        Ok(())
    }

    pub fn del_key(&self, key: &str) -> RpcResult<()> {
        validate_key(key)?;
        self.kv.del(key);
        Ok(())
    }

    pub fn kv_snapshot(&self) -> BTreeMap<String, String> {
        self.kv.snapshot()
    }

    pub fn service_spec(&self, name: &str) -> RpcResult<ServiceSpec> {
        self.spec
            .service(name)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("service `{}` does not exist", name)))
    }

    pub fn container_snapshot(
        &self,
        states: Option<Vec<ContainerState>>,
        services: Option<Vec<String>>,
    ) -> RpcResult<Vec<Container>> {
        if let Some(services) = &services {
            for name in services {
                if self.spec.service(name).is_none() {
                    return Err(RpcError::NotFound(format!("service `{}` does not exist", name)));
                }
            }
        }
        let core = self.core.lock().unwrap();
        Ok(core.registry.containers(states.as_deref(), services.as_deref()))
    }

    /// Kill one instance. Killing does not count against the restart budget
    /// and is idempotent on terminal instances.
    pub async fn kill_instance(&self, service: &str, instance: u32) -> RpcResult<()> {
        let actions = {
            let mut core = self.core.lock().unwrap();
            let AmCore { registry, reconciler, .. } = &mut *core;
            let Some(svc) = registry.service(service) else {
                return Err(RpcError::NotFound(format!("service `{}` does not exist", service)));
            };
            let Some(container) = svc.container(instance) else {
                return Err(RpcError::NotFound(format!(
                    "service `{}` has no container instance {}",
                    service, instance
                )));
            };
            let mut actions = Actions::default();
            if !container.state.is_terminal() {
                let yarn_id = container.yarn_container_id.clone();
                if container.state == ContainerState::Waiting {
                    reconciler.remove(service, instance);
                } else if let Some(id) = yarn_id {
                    actions.stops.push(id);
                }
                registry.on_completed(service, instance, ContainerState::Killed);
                check_finished(&mut core, &mut actions);
            }
            actions
        };
        self.perform(actions).await;
        Ok(())
    }

    /// Set a new desired instance count. Scale-up creates fresh WAITING
    /// instances; scale-down discards WAITING instances first (no cluster
    /// traffic) and then kills the highest-indexed live instances.
    pub async fn rescale(&self, service: &str, count: u32) -> RpcResult<()> {
        let actions = {
            let mut core = self.core.lock().unwrap();
            if core.shutting_down || core.state.is_terminal() {
                return Err(RpcError::FailedPrecondition("application is shutting down".into()));
            }
            let AmCore { registry, reconciler, .. } = &mut *core;
            let (live, eligible, resources) = {
                let Some(svc) = registry.service(service) else {
                    return Err(RpcError::NotFound(format!("service `{}` does not exist", service)));
                };
                if svc.failed {
                    return Err(RpcError::FailedPrecondition(format!(
                        "service `{}` has failed",
                        service
                    )));
                }
                (svc.non_terminal_count(), svc.eligible, svc.spec.resources)
            };
            info!(service, from = live, to = count, "scaling service");
            registry.service_mut(service).expect("checked above").desired = count;

            let mut actions = Actions::default();
            if count > live {
                for _ in 0..count - live {
                    let instance = registry.create_instance(service);
                    if eligible {
                        reconciler.enqueue(service, instance);
                        actions.requests.push(resources);
                    }
                }
            } else if count < live {
                trim(registry, reconciler, service, count, &mut actions);
            }
            check_finished(&mut core, &mut actions);
            actions
        };
        self.perform(actions).await;
        Ok(())
    }

    /// Explicit shutdown overriding the automatic termination rules.
    /// Repeating the call with the same status is a no-op; losing a shutdown
    /// race to a different status is a precondition failure.
    pub async fn request_shutdown(&self, status: FinalStatus, diagnostics: String) -> RpcResult<()> {
        if self.finalize(status, diagnostics).await {
            return Ok(());
        }
        // Another shutdown got there first; finalize records its status and
        // shutting_down under one lock, so this read sees the winner.
        let final_status = self.core.lock().unwrap().final_status;
        if final_status == status {
            Ok(())
        } else {
            Err(RpcError::FailedPrecondition(format!(
                "application already finishing with status {}",
                final_status
            )))
        }
    }

    /// Projection of master state for reports, computed under the lock.
    pub fn report(&self) -> ApplicationReport {
        let core = self.core.lock().unwrap();
        let now = now_millis();
        let mut usage = ResourceUsageReport::default();
        let (mut finished, mut total) = (0u32, 0u32);
        for service in core.registry.services() {
            let resources = service.spec.resources;
            for container in &service.containers {
                total += 1;
                if container.state.is_terminal() {
                    finished += 1;
                }
                match container.state {
                    ContainerState::Running => {
                        usage.num_used_containers += 1;
                        usage.used_resources.memory += resources.memory;
                        usage.used_resources.vcores += resources.vcores;
                    }
                    ContainerState::Waiting | ContainerState::Requested => {
                        usage.needed_resources.memory += resources.memory;
                        usage.needed_resources.vcores += resources.vcores;
                    }
                    _ => {}
                }
                if let Some(start) = container.start_time {
                    let secs = container.finish_time.unwrap_or(now).saturating_sub(start) / 1000;
                    usage.memory_seconds += resources.memory * secs;
                    usage.vcore_seconds += u64::from(resources.vcores) * secs;
                }
            }
        }
        let addr = self.address();
        ApplicationReport {
            id: self.app_id,
            name: self.spec.name.clone(),
            user: self.user.clone(),
            queue: self.spec.queue.clone(),
            tags: self.spec.tags.clone(),
            host: addr.ip().to_string(),
            port: addr.port(),
            tracking_url: self.tracking_url.clone(),
            state: core.state,
            final_status: core.final_status,
            progress: if total == 0 { 0.0 } else { finished as f32 / total as f32 },
            usage,
            diagnostics: core.diagnostics.clone(),
            start_time: Some(self.start_time),
            finish_time: core.finish_time,
        }
    }
}

/// Hand every WAITING instance of a newly eligible service to the reconciler,
/// in instance order.
fn schedule_waiting(registry: &mut Registry, reconciler: &mut Reconciler, service: &str, actions: &mut Actions) {
    let Some(state) = registry.service(service) else { return };
    let resources = state.spec.resources;
    let waiting: Vec<u32> = state
        .containers
        .iter()
        .filter(|c| c.state == ContainerState::Waiting)
        .map(|c| c.instance)
        .collect();
    for instance in waiting {
        reconciler.enqueue(service, instance);
        actions.requests.push(resources);
    }
}

/// Kill instances until only `desired` non-terminal ones remain: WAITING
/// instances first, then the highest-indexed REQUESTED/RUNNING ones.
fn trim(
    registry: &mut Registry,
    reconciler: &mut Reconciler,
    service: &str,
    desired: u32,
    actions: &mut Actions,
) {
    let victims: Vec<u32> = {
        let svc = registry.service(service).expect("service exists");
        let excess = svc.non_terminal_count().saturating_sub(desired);
        let waiting = svc
            .containers
            .iter()
            .rev()
            .filter(|c| c.state == ContainerState::Waiting)
            .map(|c| c.instance);
        let live = svc
            .containers
            .iter()
            .rev()
            .filter(|c| matches!(c.state, ContainerState::Requested | ContainerState::Running))
            .map(|c| c.instance);
        waiting.chain(live).take(excess as usize).collect()
    };
    for instance in victims {
        let (state, yarn_id) = {
            let container = registry
                .service(service)
                .and_then(|s| s.container(instance))
                .expect("victim exists");
            (container.state, container.yarn_container_id.clone())
        };
        if state == ContainerState::Waiting {
            reconciler.remove(service, instance);
        } else if let Some(id) = yarn_id {
            actions.stops.push(id);
        }
        registry.on_completed(service, instance, ContainerState::Killed);
    }
}

/// Apply the automatic termination rules: any failed service fails the
/// application; every service complete finishes it successfully.
fn check_finished(core: &mut AmCore, actions: &mut Actions) {
    if core.shutting_down || core.state.is_terminal() || actions.finish.is_some() {
        return;
    }
    if let Some(failed) = core.registry.services().find(|s| s.failed) {
        actions.finish = Some((FinalStatus::Failed, failed.failure_diagnostics.clone()));
    } else if core.registry.services().all(|s| s.is_complete()) {
        actions.finish = Some((FinalStatus::Succeeded, String::new()));
    }
}

fn validate_key(key: &str) -> RpcResult<()> {
    if key.is_empty() {
        return Err(RpcError::InvalidArgument("keys must be non-empty".into()));
    }
    if key.contains('\0') {
        return Err(RpcError::InvalidArgument("keys must not contain null bytes".into()));
    }
    Ok(())
}

const RETRY_ATTEMPTS: u32 = 4;

/// Retry a cluster call with exponential backoff up to a bounded budget;
/// transient unavailability is absorbed here, persistent failure propagates.
async fn retry<T, F, Fut>(op: &'static str, mut f: F) -> SkeinResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SkeinResult<T>>,
{
    let mut delay = Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(op, %err, attempt, "cluster operation failed, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                return Err(err.wrap_err(format!("cluster operation `{}` failed permanently", op)))
            }
        }
    }
}
