use super::registry::Registry;
use crate::kv::KvStore;
use crate::spec::{ApplicationSpec, ServiceSpec};
use std::collections::HashMap;

/// Decides when a service becomes launch-eligible.
///
/// A service is eligible once every dependency has a readiness key (the
/// dependency's own name) present in the key-value store. Readiness is
/// published by the dependency's containers themselves, so "ready" can mean
/// whatever the user's code wants it to mean, not merely "process started".
pub(crate) struct DependencyScheduler {
    /// Reverse dependency index: readiness key -> services waiting on it.
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyScheduler {
    pub(crate) fn new(spec: &ApplicationSpec) -> Self {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (name, service) in &spec.services {
            for dep in &service.depends {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
        }
        Self { dependents }
    }

    /// Compute initial eligibility and return the services that may launch
    /// right away (those with no unsatisfied dependencies).
    pub(crate) fn initialize(&self, registry: &mut Registry, kv: &KvStore) -> Vec<String> {
        let mut eligible = Vec::new();
        for service in registry.services_mut() {
            if satisfied(&service.spec, kv) {
                service.eligible = true;
                eligible.push(service.name.clone());
            }
        }
        eligible
    }

    /// React to a key appearing in the store: any service whose last missing
    /// dependency this was becomes eligible. Eligibility is never revoked, so
    /// deleting a readiness key later does not un-launch anything.
    pub(crate) fn on_key_set(&self, registry: &mut Registry, kv: &KvStore, key: &str) -> Vec<String> {
        let Some(dependents) = self.dependents.get(key) else { return Vec::new() };
        let mut newly = Vec::new();
        for name in dependents {
            let Some(service) = registry.service_mut(name) else { continue };
            if !service.eligible && satisfied(&service.spec, kv) {
                service.eligible = true;
                info!(service = %name, readiness_key = key, "service became launch-eligible");
                newly.push(name.clone());
            }
        }
        newly
    }
}

fn satisfied(spec: &ServiceSpec, kv: &KvStore) -> bool {
    spec.depends.iter().all(|dep| kv.contains(dep))
}
