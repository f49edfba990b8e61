// Cluster membership contract

use crate::Result;
use async_trait::async_trait;

/// A group of cooperating container instances.
///
/// Only the contract lives here; replication protocols are provided by
/// implementations outside the core.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Descriptive implementation string, `name/version`
    fn info(&self) -> &str;

    fn cluster_name(&self) -> &str;

    /// Replication protocol identifier
    fn protocol(&self) -> &str;

    /// Join the cluster
    async fn start(&self) -> Result<()>;

    /// Leave the cluster
    async fn stop(&self) -> Result<()>;
}
