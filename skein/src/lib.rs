mod error;

pub mod cluster;
pub mod config;
pub mod daemon;
pub mod kv;
pub mod master;
pub mod report;
pub mod rpc;
pub mod spec;

pub use error::{SkeinError, SkeinResult};
pub use master::ApplicationMaster;
pub use report::{ApplicationId, ApplicationReport, ApplicationState, Container, ContainerState, FinalStatus};
pub use spec::{ApplicationSpec, Resources, ServiceSpec};

#[macro_use]
extern crate eyre;

#[macro_use]
extern crate tracing;
