//! Shared fixtures: a scripted in-process kernel and a scripted tool
//! backend, so end-to-end scenarios run without a Python interpreter or
//! live providers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use sandcell::kernel::{bus, Envelope, KernelBus, StreamChannel};
use sandcell::service::{ToolBackend, ToolDescriptor};
use sandcell::{ExecutorConfig, KernelFactory};
use sandcell_providers::{ProviderError, ProviderResult};

pub const FAKE_PNG: &[u8] = b"not-really-a-png";

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Config pointed at a temp workspace.
pub fn test_config(workspace: &Path, approval_timeout_ms: Option<u64>) -> ExecutorConfig {
    ExecutorConfig {
        workspace: workspace.to_path_buf(),
        approval_timeout_ms,
        ..ExecutorConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Fake kernel
// ---------------------------------------------------------------------------

/// Launches scripted in-process kernels. Counts launches so reset tests
/// can assert a fresh kernel was started.
pub struct FakeKernelFactory {
    pub launches: AtomicUsize,
}

impl FakeKernelFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl KernelFactory for FakeKernelFactory {
    async fn launch(
        &self,
        workspace: &Path,
    ) -> sandcell::ExecutorResult<Arc<dyn KernelBus>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (bus_half, handle) = bus::in_process(64);
        tokio::spawn(run_fake_kernel(handle, workspace.to_path_buf()));
        Ok(Arc::new(bus_half))
    }
}

/// Interprets a tiny line language in place of Python:
///
/// ```text
/// print <text>                      stdout <text>\n
/// stderr <text>                     stderr <text>\n
/// sleep_ms <n>                      sleep
/// set <name> <value>                store a variable
/// print_var <name>                  stdout variable value\n
/// image                             emit an inline PNG
/// raise <name> <message...>         error + done
/// call <provider> <tool> <json>     POST /run, stdout the JSON result
/// call_field <provider> <tool> <field> <json>
///                                   POST /run, stdout result[field]
/// ```
///
/// Tool calls read the service address and secret from the generated
/// preamble, like real kernel code would. A failed call raises
/// `ToolCallError` with a traceback naming the generated call site.
async fn run_fake_kernel(mut handle: bus::KernelHandle, workspace: PathBuf) {
    let vars: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut worker: Option<(String, tokio::task::JoinHandle<()>)> = None;

    while let Some(envelope) = handle.recv().await {
        match envelope {
            Envelope::Ping { seq } => {
                handle.send(Envelope::Pong { seq }).await;
            }
            Envelope::Execute { id, code, env } => {
                vars.lock().extend(env);
                let sender = handle.sender();
                let vars = Arc::clone(&vars);
                let workspace = workspace.clone();
                let task_id = id.clone();
                let task = tokio::spawn(async move {
                    run_submission(&sender, &task_id, &code, &vars, &workspace).await;
                });
                worker = Some((id, task));
            }
            Envelope::Interrupt { id } => {
                if let Some((current, task)) = worker.take() {
                    if current == id {
                        task.abort();
                        let _ = task.await;
                        handle
                            .send(Envelope::Error {
                                id: id.clone(),
                                name: "KeyboardInterrupt".to_string(),
                                message: "interrupted".to_string(),
                                traceback: vec![],
                            })
                            .await;
                        handle.send(Envelope::Done { id }).await;
                    } else {
                        worker = Some((current, task));
                    }
                }
            }
            _ => {}
        }
    }
}

async fn run_submission(
    sender: &mpsc::Sender<Envelope>,
    id: &str,
    code: &str,
    vars: &Mutex<HashMap<String, String>>,
    workspace: &Path,
) {
    for line in code.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "print" => {
                stream(sender, id, StreamChannel::Stdout, &format!("{rest}\n")).await;
            }
            "stderr" => {
                stream(sender, id, StreamChannel::Stderr, &format!("{rest}\n")).await;
            }
            "sleep_ms" => {
                let millis: u64 = rest.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
            "set" => {
                if let Some((name, value)) = rest.split_once(' ') {
                    vars.lock().insert(name.to_string(), value.to_string());
                }
            }
            "print_var" => {
                let value = vars.lock().get(rest).cloned().unwrap_or_default();
                stream(sender, id, StreamChannel::Stdout, &format!("{value}\n")).await;
            }
            "image" => {
                let data = base64::engine::general_purpose::STANDARD.encode(FAKE_PNG);
                let _ = sender
                    .send(Envelope::Display {
                        id: id.to_string(),
                        media_type: "image/png".to_string(),
                        data,
                    })
                    .await;
            }
            "raise" => {
                let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
                fail(sender, id, name, message, vec![]).await;
                return;
            }
            "call" | "call_field" => {
                let mut parts = rest.splitn(if command == "call" { 3 } else { 4 }, ' ');
                let provider = parts.next().unwrap_or_default();
                let tool = parts.next().unwrap_or_default();
                let field = if command == "call_field" {
                    parts.next()
                } else {
                    None
                };
                let args: Value =
                    serde_json::from_str(parts.next().unwrap_or("{}")).unwrap_or(json!({}));

                match call_tool_service(workspace, provider, tool, args).await {
                    Ok(result) => {
                        let text = match field {
                            Some(field) => match result.get(field) {
                                Some(Value::String(s)) => s.clone(),
                                Some(other) => other.to_string(),
                                None => "null".to_string(),
                            },
                            None => match &result {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            },
                        };
                        stream(sender, id, StreamChannel::Stdout, &format!("{text}\n")).await;
                    }
                    Err(message) => {
                        let traceback = vec![
                            "Traceback (most recent call last):".to_string(),
                            "  File \"<cell>\", line 1, in <module>".to_string(),
                            format!("  File \"tools/{provider}/{tool}.py\", in run"),
                            format!("ToolCallError: {message}"),
                        ];
                        fail(sender, id, "ToolCallError", &message, traceback).await;
                        return;
                    }
                }
            }
            _ => {}
        }
    }
    let _ = sender
        .send(Envelope::Done { id: id.to_string() })
        .await;
}

async fn stream(sender: &mpsc::Sender<Envelope>, id: &str, channel: StreamChannel, text: &str) {
    let _ = sender
        .send(Envelope::Stream {
            id: id.to_string(),
            channel,
            text: text.to_string(),
        })
        .await;
}

async fn fail(
    sender: &mpsc::Sender<Envelope>,
    id: &str,
    name: &str,
    message: &str,
    traceback: Vec<String>,
) {
    let _ = sender
        .send(Envelope::Error {
            id: id.to_string(),
            name: name.to_string(),
            message: message.to_string(),
            traceback,
        })
        .await;
    let _ = sender
        .send(Envelope::Done { id: id.to_string() })
        .await;
}

/// POST to the tool service the way generated modules do: address and
/// secret come from the preamble in the workspace.
async fn call_tool_service(
    workspace: &Path,
    provider: &str,
    tool: &str,
    args: Value,
) -> Result<Value, String> {
    let (base_url, secret) =
        read_preamble(workspace).ok_or_else(|| "internal: preamble missing".to_string())?;

    let response = reqwest::Client::new()
        .post(format!("{base_url}/run"))
        .bearer_auth(secret)
        .json(&json!({"provider": provider, "tool": tool, "args": args}))
        .send()
        .await
        .map_err(|e| format!("internal: {e}"))?;

    let payload: Value = response
        .json()
        .await
        .map_err(|e| format!("internal: {e}"))?;

    if payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    } else {
        let error = payload.get("error").cloned().unwrap_or(json!({}));
        let kind = error.get("kind").and_then(Value::as_str).unwrap_or("internal");
        let message = error.get("message").and_then(Value::as_str).unwrap_or("");
        Err(format!("{kind}: {message}"))
    }
}

pub fn read_preamble(workspace: &Path) -> Option<(String, String)> {
    let contents = std::fs::read_to_string(workspace.join("tools/_preamble.py")).ok()?;
    let mut base_url = None;
    let mut secret = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("BASE_URL = \"") {
            base_url = rest.strip_suffix('"').map(str::to_string);
        } else if let Some(rest) = line.strip_prefix("SECRET = \"") {
            secret = rest.strip_suffix('"').map(str::to_string);
        }
    }
    Some((base_url?, secret?))
}

// ---------------------------------------------------------------------------
// Fake tool backend
// ---------------------------------------------------------------------------

pub enum Behavior {
    /// Returns `{"echoed": <args.input>}` as JSON text.
    Echo,
    /// Returns fixed text.
    Text(String),
    /// Sleeps, then returns fixed text.
    Slow(Duration, String),
    /// Fails with a transport error N times, then returns fixed text.
    TransportThen(usize, String),
}

pub struct FakeTool {
    pub input_schema: Value,
    pub has_output_schema: bool,
    pub behavior: Behavior,
}

pub struct FakeBackend {
    tools: HashMap<(String, String), FakeTool>,
    failures_left: Mutex<HashMap<(String, String), usize>>,
    pub invocations: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            failures_left: Mutex::new(HashMap::new()),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn with_tool(mut self, provider: &str, tool: &str, spec: FakeTool) -> Self {
        if let Behavior::TransportThen(failures, _) = &spec.behavior {
            self.failures_left
                .lock()
                .insert((provider.to_string(), tool.to_string()), *failures);
        }
        self.tools
            .insert((provider.to_string(), tool.to_string()), spec);
        self
    }

    /// The standard `demo:echo` tool used by most scenarios.
    pub fn demo_echo() -> Self {
        Self::new().with_tool(
            "demo",
            "echo",
            FakeTool {
                input_schema: json!({
                    "type": "object",
                    "properties": {"input": {"type": "string"}},
                    "required": ["input"]
                }),
                has_output_schema: true,
                behavior: Behavior::Echo,
            },
        )
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for FakeBackend {
    async fn describe(&self, provider: &str, tool: &str) -> ProviderResult<ToolDescriptor> {
        let spec = self
            .tools
            .get(&(provider.to_string(), tool.to_string()))
            .ok_or_else(|| ProviderError::ToolNotFound(format!("{provider}:{tool}")))?;
        Ok(ToolDescriptor {
            input_schema: Arc::new(
                spec.input_schema.as_object().cloned().unwrap_or_default(),
            ),
            has_output_schema: spec.has_output_schema,
        })
    }

    async fn invoke(
        &self,
        provider: &str,
        tool: &str,
        args: Option<Map<String, Value>>,
    ) -> ProviderResult<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let key = (provider.to_string(), tool.to_string());
        let spec = self
            .tools
            .get(&key)
            .ok_or_else(|| ProviderError::ToolNotFound(format!("{provider}:{tool}")))?;

        match &spec.behavior {
            Behavior::Echo => {
                let input = args
                    .as_ref()
                    .and_then(|map| map.get("input"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(json!({"echoed": input}).to_string())
            }
            Behavior::Text(text) => Ok(text.clone()),
            Behavior::Slow(delay, text) => {
                tokio::time::sleep(*delay).await;
                Ok(text.clone())
            }
            Behavior::TransportThen(_, text) => {
                let mut failures = self.failures_left.lock();
                let left = failures.entry(key).or_insert(0);
                if *left > 0 {
                    *left -= 1;
                    Err(ProviderError::Transport("provider died".to_string()))
                } else {
                    Ok(text.clone())
                }
            }
        }
    }
}
