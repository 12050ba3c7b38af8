use crate::cluster::YarnContainerId;
use crate::report::{now_millis, Container, ContainerState};
use crate::spec::{ApplicationSpec, ServiceSpec};
use std::collections::{BTreeMap, HashMap};

/// Runtime state of one service: its immutable spec, the mutable desired
/// instance count, and the full history of container records.
///
/// Instance ids are the indices into `containers` and only ever grow; a
/// restart appends a fresh record instead of reusing a terminal slot.
pub(crate) struct ServiceState {
    pub(crate) name: String,
    pub(crate) spec: ServiceSpec,
    pub(crate) desired: u32,
    pub(crate) containers: Vec<Container>,
    /// Cumulative count of FAILED containers, compared against max_restarts.
    pub(crate) failures: u32,
    pub(crate) failed: bool,
    pub(crate) failure_diagnostics: String,
    /// Set once all dependencies have published their readiness keys; never
    /// cleared afterwards.
    pub(crate) eligible: bool,
}

impl ServiceState {
    fn new(name: String, spec: ServiceSpec) -> Self {
        let desired = spec.instances;
        Self {
            name,
            spec,
            desired,
            containers: Vec::new(),
            failures: 0,
            failed: false,
            failure_diagnostics: String::new(),
            eligible: false,
        }
    }

    pub(crate) fn container(&self, instance: u32) -> Option<&Container> {
        self.containers.get(instance as usize)
    }

    pub(crate) fn non_terminal(&self) -> impl Iterator<Item = &Container> {
        self.containers.iter().filter(|c| !c.state.is_terminal())
    }

    pub(crate) fn non_terminal_count(&self) -> u32 {
        self.non_terminal().count() as u32
    }

    pub(crate) fn succeeded_count(&self) -> u32 {
        self.containers.iter().filter(|c| c.state == ContainerState::Succeeded).count() as u32
    }

    /// Whether another failure may still be absorbed by a restart.
    pub(crate) fn can_restart(&self) -> bool {
        self.spec.max_restarts == -1 || i64::from(self.failures) <= self.spec.max_restarts
    }

    /// A service is complete once nothing is in flight and every desired
    /// instance has succeeded (trivially true at zero desired instances).
    pub(crate) fn is_complete(&self) -> bool {
        !self.failed
            && self.non_terminal_count() == 0
            && (self.desired == 0 || self.succeeded_count() >= self.desired)
    }
}

/// Authoritative table of container instances across all services, plus the
/// mapping from cluster container ids back to instances. All transitions are
/// guarded: an event targeting a container in the wrong state is a logged
/// no-op rather than a coerced transition.
pub(crate) struct Registry {
    services: BTreeMap<String, ServiceState>,
    by_yarn: HashMap<YarnContainerId, (String, u32)>,
}

impl Registry {
    pub(crate) fn new(spec: &ApplicationSpec) -> Self {
        let services = spec
            .services
            .iter()
            .map(|(name, service)| (name.clone(), ServiceState::new(name.clone(), service.clone())))
            .collect();
        Self { services, by_yarn: HashMap::new() }
    }

    pub(crate) fn service(&self, name: &str) -> Option<&ServiceState> {
        self.services.get(name)
    }

    pub(crate) fn service_mut(&mut self, name: &str) -> Option<&mut ServiceState> {
        self.services.get_mut(name)
    }

    pub(crate) fn services(&self) -> impl Iterator<Item = &ServiceState> {
        self.services.values()
    }

    pub(crate) fn services_mut(&mut self) -> impl Iterator<Item = &mut ServiceState> {
        self.services.values_mut()
    }

    /// Create a new WAITING instance for `service` and return its instance id.
    pub(crate) fn create_instance(&mut self, service: &str) -> u32 {
        let state = self.services.get_mut(service).expect("unknown service");
        let instance = state.containers.len() as u32;
        state.containers.push(Container::new(service, instance));
        debug!(service, instance, "created container instance");
        instance
    }

    /// WAITING -> REQUESTED, recording the granted cluster container id.
    pub(crate) fn bind_allocation(&mut self, service: &str, instance: u32, yarn_id: YarnContainerId) -> bool {
        let Some(container) = self.container_mut(service, instance) else { return false };
        if container.state != ContainerState::Waiting {
            warn!(service, instance, state = %container.state, "ignoring allocation for non-waiting container");
            return false;
        }
        container.state = ContainerState::Requested;
        container.yarn_container_id = Some(yarn_id.clone());
        self.by_yarn.insert(yarn_id, (service.to_owned(), instance));
        true
    }

    /// REQUESTED -> RUNNING once the launch is acknowledged.
    pub(crate) fn on_launched(&mut self, service: &str, instance: u32) -> bool {
        let Some(container) = self.container_mut(service, instance) else { return false };
        if container.state != ContainerState::Requested {
            warn!(service, instance, state = %container.state, "ignoring launch ack for container");
            return false;
        }
        container.state = ContainerState::Running;
        container.start_time = Some(now_millis());
        true
    }

    /// Transition to a terminal state. Events targeting an already-terminal
    /// instance are dropped.
    pub(crate) fn on_completed(&mut self, service: &str, instance: u32, state: ContainerState) -> bool {
        debug_assert!(state.is_terminal());
        let Some(container) = self.container_mut(service, instance) else { return false };
        if container.state.is_terminal() {
            debug!(service, instance, state = %container.state, "dropping completion event for terminal container");
            return false;
        }
        container.state = state;
        container.finish_time = Some(now_millis());
        if container.start_time.is_none() {
            container.start_time = container.finish_time;
        }
        info!(service, instance, %state, "container finished");
        true
    }

    pub(crate) fn lookup(&self, yarn_id: &YarnContainerId) -> Option<(String, u32)> {
        self.by_yarn.get(yarn_id).cloned()
    }

    /// Filtered snapshot of container records, copied out under the lock.
    pub(crate) fn containers(
        &self,
        states: Option<&[ContainerState]>,
        services: Option<&[String]>,
    ) -> Vec<Container> {
        let selected: Box<dyn Iterator<Item = &ServiceState> + '_> = match services {
            Some(names) => Box::new(names.iter().filter_map(|name| self.services.get(name))),
            None => Box::new(self.services.values()),
        };
        selected
            .flat_map(|service| service.containers.iter())
            .filter(|container| states.map_or(true, |states| states.contains(&container.state)))
            .cloned()
            .collect()
    }

    fn container_mut(&mut self, service: &str, instance: u32) -> Option<&mut Container> {
        match self.services.get_mut(service).and_then(|s| s.containers.get_mut(instance as usize)) {
            Some(container) => Some(container),
            None => {
                warn!(service, instance, "event for unknown container instance");
                None
            }
        }
    }
}
