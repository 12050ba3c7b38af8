use crate::cluster::YarnContainerId;
use crate::spec::Resources;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("time went backwards").as_millis() as u64
}

/// Identifier assigned by the submission layer, formatted like yarn's
/// `application_<cluster-timestamp>_<sequence>` ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    pub cluster_timestamp: u64,
    pub seq: u32,
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "application_{}_{:04}", self.cluster_timestamp, self.seq)
    }
}

impl FromStr for ApplicationId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        let invalid = || format!("invalid application id `{}`", s);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("application"), Some(ts), Some(seq), None) => Ok(ApplicationId {
                cluster_timestamp: ts.parse().map_err(|_| invalid())?,
                seq: seq.parse().map_err(|_| invalid())?,
            }),
            _ => Err(invalid()),
        }
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $repr:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $($name::$variant => $repr),+
                })
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($repr => Ok($name::$variant),)+
                    _ => Err(format!(
                        concat!("`{}` is not a valid ", stringify!($name), " (expected one of {})"),
                        s,
                        [$($repr),+].join(", "),
                    )),
                }
            }
        }
    };
}

string_enum! {
    /// Lifecycle of an application as seen by the submission layer.
    ApplicationState {
        New => "NEW",
        NewSaving => "NEW_SAVING",
        Submitted => "SUBMITTED",
        Accepted => "ACCEPTED",
        Running => "RUNNING",
        Finished => "FINISHED",
        Failed => "FAILED",
        Killed => "KILLED",
    }
}

impl ApplicationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ApplicationState::Finished | ApplicationState::Failed | ApplicationState::Killed)
    }
}

string_enum! {
    FinalStatus {
        Undefined => "UNDEFINED",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Killed => "KILLED",
    }
}

string_enum! {
    /// Container lifecycle. `Waiting` also covers instances that exist but are
    /// dependency-blocked; restarts create a fresh instance rather than
    /// reusing a terminal slot.
    ContainerState {
        Waiting => "WAITING",
        Requested => "REQUESTED",
        Running => "RUNNING",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Killed => "KILLED",
    }
}

impl ContainerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerState::Succeeded | ContainerState::Failed | ContainerState::Killed)
    }

    pub fn active() -> Vec<ContainerState> {
        vec![ContainerState::Waiting, ContainerState::Requested, ContainerState::Running]
    }
}

/// A single container record. Instances are indexed monotonically within
/// their service; a restarted instance gets a new record and a new index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub service_name: String,
    pub instance: u32,
    pub state: ContainerState,
    pub yarn_container_id: Option<YarnContainerId>,
    pub start_time: Option<u64>,
    pub finish_time: Option<u64>,
}

impl Container {
    pub fn new(service_name: impl Into<String>, instance: u32) -> Self {
        Self {
            service_name: service_name.into(),
            instance,
            state: ContainerState::Waiting,
            yarn_container_id: None,
            start_time: None,
            finish_time: None,
        }
    }

    /// The `<service>_<instance>` identity used in listings.
    pub fn id(&self) -> String {
        format!("{}_{}", self.service_name, self.instance)
    }

    pub fn runtime(&self) -> Duration {
        match self.start_time {
            None => Duration::ZERO,
            Some(start) => {
                let end = self.finish_time.unwrap_or_else(now_millis);
                Duration::from_millis(end.saturating_sub(start))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageReport {
    pub memory_seconds: u64,
    pub vcore_seconds: u64,
    pub num_used_containers: u32,
    pub needed_resources: Resources,
    pub reserved_resources: Resources,
    pub used_resources: Resources,
}

/// Projection of application master state consumed by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationReport {
    pub id: ApplicationId,
    pub name: String,
    pub user: String,
    pub queue: String,
    pub tags: BTreeSet<String>,
    pub host: String,
    pub port: u16,
    pub tracking_url: String,
    pub state: ApplicationState,
    pub final_status: FinalStatus,
    pub progress: f32,
    pub usage: ResourceUsageReport,
    pub diagnostics: String,
    pub start_time: Option<u64>,
    pub finish_time: Option<u64>,
}

impl ApplicationReport {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn runtime(&self) -> Duration {
        match self.start_time {
            None => Duration::ZERO,
            Some(start) => {
                let end = self.finish_time.unwrap_or_else(now_millis);
                Duration::from_millis(end.saturating_sub(start))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_id_roundtrip() {
        let id = ApplicationId { cluster_timestamp: 1526134340424, seq: 12 };
        assert_eq!(id.to_string(), "application_1526134340424_0012");
        assert_eq!("application_1526134340424_0012".parse::<ApplicationId>().unwrap(), id);
        assert!("application_x_12".parse::<ApplicationId>().is_err());
        assert!("app_1_2".parse::<ApplicationId>().is_err());
    }

    #[test]
    fn state_parsing() {
        assert_eq!("running".parse::<ApplicationState>().unwrap(), ApplicationState::Running);
        assert_eq!("NEW_SAVING".parse::<ApplicationState>().unwrap(), ApplicationState::NewSaving);
        assert!("nope".parse::<ContainerState>().is_err());
        assert_eq!("killed".parse::<FinalStatus>().unwrap(), FinalStatus::Killed);
    }

    #[test]
    fn container_identity() {
        let container = Container::new("web", 3);
        assert_eq!(container.id(), "web_3");
        assert_eq!(container.state, ContainerState::Waiting);
        assert!(!container.state.is_terminal());
    }
}
