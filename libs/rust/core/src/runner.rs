//! Execution-mode seam. Each binary builds exactly one runner at startup from
//! `PipelineConfig::mode` and hands control to it.

use async_trait::async_trait;

#[async_trait]
pub trait Runner: Send {
    async fn run(self: Box<Self>) -> anyhow::Result<()>;
}
