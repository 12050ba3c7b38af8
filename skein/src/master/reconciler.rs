use super::registry::Registry;
use crate::cluster::{LaunchContext, YarnContainerId};
use crate::config;
use crate::report::ApplicationId;
use crate::spec::{Resources, ServiceSpec};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Work queue of instances that need a container, in the order they became
/// runnable. Grants from the cluster are matched against this queue oldest
/// first; the cluster's own allocation order across services is honored.
#[derive(Default)]
pub(crate) struct Reconciler {
    pending: VecDeque<(String, u32)>,
}

impl Reconciler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, service: &str, instance: u32) {
        self.pending.push_back((service.to_owned(), instance));
    }

    pub(crate) fn remove(&mut self, service: &str, instance: u32) -> bool {
        match self.pending.iter().position(|(s, i)| s == service && *i == instance) {
            Some(idx) => {
                self.pending.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Pop the oldest pending instance whose resource request matches the
    /// granted allocation, if any.
    pub(crate) fn match_allocation(&mut self, registry: &Registry, granted: Resources) -> Option<(String, u32)> {
        let idx = self.pending.iter().position(|(service, _)| {
            registry.service(service).map_or(false, |s| s.spec.resources == granted)
        })?;
        self.pending.remove(idx)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Build the launch context for one instance: the service's localized files
/// and commands, the user environment, and the identity/rendezvous variables
/// every skein container receives.
pub(crate) fn launch_context(
    spec: &ServiceSpec,
    app_id: ApplicationId,
    master_addr: SocketAddr,
    service: &str,
    instance: u32,
    yarn_id: &YarnContainerId,
) -> LaunchContext {
    let mut env = spec.env.clone();
    env.insert(config::ENV_APPMASTER_ADDRESS.into(), master_addr.to_string());
    env.insert(config::ENV_APPLICATION_ID.into(), app_id.to_string());
    env.insert(config::ENV_SERVICE.into(), service.to_owned());
    env.insert(config::ENV_INSTANCE.into(), instance.to_string());
    env.insert(config::ENV_CONTAINER_ID.into(), yarn_id.to_string());
    LaunchContext { files: spec.files.clone(), env, commands: spec.commands.clone() }
}
