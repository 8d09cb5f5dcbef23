pub mod akkacluster;

pub use akkacluster::{AkkaCluster, AkkaClusterSpec, AkkaClusterStatus};
