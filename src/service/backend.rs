//! Dispatch backend for the tool service.
//!
//! The `/run` pipeline needs two things from the provider layer: the
//! tool's schemas and a single invocation attempt. The registry-backed
//! implementation discards its session on transport errors, so the
//! pipeline's one retry lands on a fresh session.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use sandcell_providers::{ProviderError, ProviderRegistry, ProviderResult};

#[derive(Clone)]
pub struct ToolDescriptor {
    pub input_schema: Arc<Map<String, Value>>,
    pub has_output_schema: bool,
}

#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Describe a tool, starting its provider lazily.
    async fn describe(&self, provider: &str, tool: &str) -> ProviderResult<ToolDescriptor>;

    /// One invocation attempt, returning the provider's text result.
    async fn invoke(
        &self,
        provider: &str,
        tool: &str,
        args: Option<Map<String, Value>>,
    ) -> ProviderResult<String>;
}

pub struct RegistryBackend {
    registry: Arc<ProviderRegistry>,
}

impl RegistryBackend {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolBackend for RegistryBackend {
    async fn describe(&self, provider: &str, tool: &str) -> ProviderResult<ToolDescriptor> {
        let session = self.registry.session_for(provider).await?;
        let schema = session
            .tool(tool)
            .ok_or_else(|| ProviderError::ToolNotFound(format!("{provider}:{tool}")))?;
        Ok(ToolDescriptor {
            input_schema: Arc::clone(&schema.input_schema),
            has_output_schema: schema.output_schema.is_some(),
        })
    }

    async fn invoke(
        &self,
        provider: &str,
        tool: &str,
        args: Option<Map<String, Value>>,
    ) -> ProviderResult<String> {
        let session = self.registry.session_for(provider).await?;
        match session.invoke(tool, args).await {
            Err(e) if e.is_transport() => {
                // The caller retries once; make sure it gets a new session.
                self.registry.invalidate(provider, session.generation());
                Err(e)
            }
            other => other,
        }
    }
}
