//! Auxiliary (non-endpoint) resources a test starts before its scenarios,
//! such as a mock application server. Terminated in reverse start order.

pub mod mock;

pub use self::mock::MockServer;

use anyhow::Result;

#[async_trait::async_trait]
pub trait Auxiliary: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn terminate(&self) -> Result<()>;
}
