//! Low-level provider client: connect, list tools, invoke, close.
//!
//! Local providers are spawned as child processes speaking the tool
//! protocol on their standard streams; remote providers are reached via
//! framed HTTP or a long-poll streaming channel. Remote connects retry
//! with exponential backoff inside the connect timeout; child-process
//! spawns fail fast.

use std::borrow::Cow;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use tracing::{info, warn};

pub use rmcp::model::Tool;

use crate::{
    error::{ProviderError, ProviderResult},
    spec::{ProviderSpec, RemoteTransport},
};

/// Live connection to one provider.
pub type ProviderClient = RunningService<RoleClient, ()>;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Connect to a provider described by `spec`.
pub async fn connect(
    name: &str,
    spec: &ProviderSpec,
    opts: &ConnectOptions,
) -> ProviderResult<ProviderClient> {
    spec.validate()?;

    match spec {
        ProviderSpec::Local { .. } => {
            let client = tokio::time::timeout(opts.connect_timeout, connect_once(name, spec))
                .await
                .map_err(|_| {
                    ProviderError::ConnectionFailed(format!("connect to '{name}' timed out"))
                })??;
            Ok(client)
        }
        ProviderSpec::Remote { .. } => connect_with_retry(name, spec, opts).await,
    }
}

/// Exponential backoff for remote connects, bounded by the connect timeout.
async fn connect_with_retry(
    name: &str,
    spec: &ProviderSpec,
    opts: &ConnectOptions,
) -> ProviderResult<ProviderClient> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(Some(opts.connect_timeout))
        .build();

    backoff::future::retry(backoff, || async {
        match tokio::time::timeout(opts.connect_timeout, connect_once(name, spec)).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => {
                if matches!(e, ProviderError::Spec(_) | ProviderError::UnresolvedEnv { .. }) {
                    Err(backoff::Error::permanent(e))
                } else {
                    warn!("Failed to connect to '{}', retrying: {}", name, e);
                    Err(backoff::Error::transient(e))
                }
            }
            Err(_) => Err(backoff::Error::permanent(ProviderError::ConnectionFailed(
                format!("connect to '{name}' timed out"),
            ))),
        }
    })
    .await
}

async fn connect_once(name: &str, spec: &ProviderSpec) -> ProviderResult<ProviderClient> {
    match spec {
        ProviderSpec::Local { command, args, .. } => {
            let env = spec.resolved_env()?;
            let transport = TokioChildProcess::new(tokio::process::Command::new(command)
                .configure(|cmd| {
                    cmd.args(args)
                        .envs(env.iter())
                        .stderr(std::process::Stdio::inherit());
                }))
            .map_err(|e| ProviderError::Transport(format!("create stdio transport: {e}")))?;

            let client = ().serve(transport).await.map_err(|e| {
                ProviderError::ConnectionFailed(format!("initialize stdio client: {e}"))
            })?;

            info!("Connected to local provider '{}'", name);
            Ok(client)
        }

        ProviderSpec::Remote { url, headers, .. } => {
            match spec.effective_transport() {
                Some(RemoteTransport::LongPoll) => {
                    let mut builder =
                        reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

                    if !headers.is_empty() {
                        let mut header_map = reqwest::header::HeaderMap::new();
                        for (key, value) in headers {
                            let header_name: reqwest::header::HeaderName =
                                key.parse().map_err(|e| {
                                    ProviderError::Spec(format!("header name '{key}': {e}"))
                                })?;
                            let header_value = value.parse().map_err(|e| {
                                ProviderError::Spec(format!("header value for '{key}': {e}"))
                            })?;
                            header_map.insert(header_name, header_value);
                        }
                        builder = builder.default_headers(header_map);
                    }

                    let http_client = builder
                        .build()
                        .map_err(|e| ProviderError::Transport(format!("build HTTP client: {e}")))?;

                    let config = SseClientConfig {
                        sse_endpoint: url.clone().into(),
                        ..Default::default()
                    };

                    let transport = SseClientTransport::start_with_client(http_client, config)
                        .await
                        .map_err(|e| {
                            ProviderError::Transport(format!("create streaming transport: {e}"))
                        })?;

                    let client = ().serve(transport).await.map_err(|e| {
                        ProviderError::ConnectionFailed(format!(
                            "initialize streaming client: {e}"
                        ))
                    })?;

                    info!("Connected to streaming provider '{}' at {}", name, url);
                    Ok(client)
                }

                _ => {
                    // Framed transport carries only the Authorization header.
                    let auth = headers
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
                        .map(|(_, v)| v.clone());
                    if headers.len() > usize::from(auth.is_some()) {
                        warn!(
                            "Provider '{}': non-authorization headers are not applied on the framed transport",
                            name
                        );
                    }

                    let transport = if let Some(auth) = auth {
                        let mut config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                        config.auth_header = Some(auth);
                        StreamableHttpClientTransport::from_config(config)
                    } else {
                        StreamableHttpClientTransport::from_uri(url.as_str())
                    };

                    let client = ().serve(transport).await.map_err(|e| {
                        ProviderError::ConnectionFailed(format!("initialize framed client: {e}"))
                    })?;

                    info!("Connected to framed provider '{}' at {}", name, url);
                    Ok(client)
                }
            }
        }
    }
}

/// List the tools a connected provider declares.
pub async fn list_tools(name: &str, client: &ProviderClient) -> ProviderResult<Vec<Tool>> {
    let tools = client
        .peer()
        .list_all_tools()
        .await
        .map_err(|e| ProviderError::Protocol(format!("list tools from '{name}': {e}")))?;
    info!("Discovered {} tools from '{}'", tools.len(), name);
    Ok(tools)
}

/// Invoke one tool and return its textual result.
///
/// Tool-level failures arrive in-band (`is_error`) and are reported
/// verbatim as [`ProviderError::Tool`]; failures of the call itself are
/// transport errors, which the dispatch layer retries once against a
/// fresh session.
pub async fn invoke(
    client: &ProviderClient,
    tool_name: &str,
    args: Option<Map<String, Value>>,
) -> ProviderResult<String> {
    let request = CallToolRequestParam {
        name: Cow::Owned(tool_name.to_string()),
        arguments: args,
    };

    let result = client
        .call_tool(request)
        .await
        .map_err(|e| ProviderError::Transport(format!("call tool '{tool_name}': {e}")))?;

    let text = result_text(&result);
    if result.is_error.unwrap_or(false) {
        return Err(ProviderError::Tool(text));
    }
    Ok(text)
}

/// Concatenate the textual content items of a call result.
fn result_text(result: &CallToolResult) -> String {
    let content = match serde_json::to_value(&result.content) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to serialize tool result content: {}", e);
            return String::new();
        }
    };

    let mut text = String::new();
    if let Some(items) = content.as_array() {
        for item in items {
            if let Some(chunk) = item.get("text").and_then(Value::as_str) {
                text.push_str(chunk);
            }
        }
    }
    text
}

/// Tear down a provider connection.
pub async fn close(name: &str, client: ProviderClient) {
    if let Err(e) = client.cancel().await {
        warn!("Error disconnecting from provider '{}': {}", name, e);
    }
}
