//! Live provider sessions.
//!
//! A session bundles the open connection with the tool list declared at
//! connect time and a generation counter. Generations are how the
//! registry tells a stale session from a fresh one: a caller that saw a
//! transport error reports the generation it used, and only that
//! generation is discarded.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    client::{self, ConnectOptions, ProviderClient, Tool},
    error::{ProviderError, ProviderResult},
    spec::ProviderSpec,
};

pub struct ProviderSession {
    name: String,
    generation: u64,
    client: ProviderClient,
    tools: HashMap<String, Tool>,
}

impl ProviderSession {
    /// Connect and load the provider's declared tools.
    pub async fn establish(
        name: &str,
        spec: &ProviderSpec,
        opts: &ConnectOptions,
        generation: u64,
    ) -> ProviderResult<Self> {
        let client = client::connect(name, spec, opts).await?;
        let tools = match client::list_tools(name, &client).await {
            Ok(tools) => tools,
            Err(e) => {
                client::close(name, client).await;
                return Err(e);
            }
        };

        Ok(Self {
            name: name.to_string(),
            generation,
            client,
            tools: tools
                .into_iter()
                .map(|tool| (tool.name.to_string(), tool))
                .collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tool(&self, tool_name: &str) -> Option<&Tool> {
        self.tools.get(tool_name)
    }

    /// Tools sorted by name, for deterministic consumers.
    pub fn tools_sorted(&self) -> Vec<&Tool> {
        let mut tools: Vec<&Tool> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Invoke a declared tool on this session.
    pub async fn invoke(
        &self,
        tool_name: &str,
        args: Option<Map<String, Value>>,
    ) -> ProviderResult<String> {
        if !self.tools.contains_key(tool_name) {
            return Err(ProviderError::ToolNotFound(format!(
                "{}:{tool_name}",
                self.name
            )));
        }
        client::invoke(&self.client, tool_name, args).await
    }

    /// Consume the session and close its connection.
    pub async fn close(self) {
        client::close(&self.name, self.client).await;
    }
}

/// Best-effort close of a shared session.
///
/// If callers still hold the session (an in-flight invoke), the
/// connection stays open until they drop it; the in-flight call
/// completes against the old session.
pub(crate) fn close_shared(session: Arc<ProviderSession>) {
    match Arc::try_unwrap(session) {
        Ok(session) => {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(session.close());
            }
        }
        Err(session) => {
            warn!(
                "Provider session '{}' still in use at close; leaving connection to in-flight calls",
                session.name()
            );
        }
    }
}
