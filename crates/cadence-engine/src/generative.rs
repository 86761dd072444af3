use async_trait::async_trait;
use cadence_protocol::{Generation, GenerationRequest};

use crate::context::ExecutionContext;

/// Port to the generative capability. Usage is recorded by
/// [`ExecutionContext::generate`], never by the implementation.
#[async_trait]
pub trait GenerativePort: Send + Sync {
    async fn generate(
        &self,
        ctx: &ExecutionContext,
        request: GenerationRequest,
    ) -> anyhow::Result<Generation>;
}
