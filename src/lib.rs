//! Core library for the KubeVirt image builder.
//!
//! A build deploys a virtual machine from a source image, forwards its
//! communicator port for provisioning, strips machine identity from the
//! disk, and publishes it through a VM export. The upload stage then copies
//! the export into object storage with an in-cluster job.

pub mod artifact;
pub mod builder;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod resources;
pub mod startup_script;
pub mod steps;
pub mod test_support;
pub mod tunnel;
pub mod ui;
pub mod upload;
pub mod watch;

pub use builder::BuildOrchestrator;
pub use cluster::{Cluster, ClusterError, RestCluster};
pub use config::{BuilderConfig, ClusterConfig, ConfigError, UploadConfig};
pub use context::{BuildArtifact, BuildContext};
pub use error::BuildError;
pub use steps::ProcessCommandRunner;
pub use ui::{ConsoleUi, Ui};
pub use upload::{UploadError, UploadOrchestrator};
