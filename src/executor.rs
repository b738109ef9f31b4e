//! The coordinator's public surface.
//!
//! An [`Executor`] owns the provider registry, the approval broker, the
//! tool service, and the kernel client for one session. `stream` drives
//! a single code submission: kernel fragments flow out as events, tool
//! calls made by the kernel surface as approval requests, and the
//! execution budget pauses while the host is deciding.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalBroker, ApprovalPeer};
use crate::budget::ExecutionBudget;
use crate::codegen::CodeGenerator;
use crate::config::{ExecutorConfig, KernelSpec};
use crate::errors::{ExecutorError, ExecutorResult};
use crate::events::{
    ApprovalRequestEvent, ExecutionChunk, ExecutionError, ExecutionResult, ImageOutput,
    StreamEvent,
};
use crate::kernel::{Fragment, KernelBus, KernelClient, ProcessBus};
use crate::service::{RegistryBackend, ToolBackend, ToolService};
use sandcell_providers::{ConnectOptions, ProviderRegistry, ProviderSpec};

/// Events channel capacity: one, so the host's consumption paces the
/// stream.
const EVENT_QUEUE_DEPTH: usize = 1;

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Execution budget. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Emit output chunks as they arrive, in addition to accumulating
    /// them into the final result.
    pub chunks: bool,
    /// Environment applied in the kernel before the code runs.
    pub kernel_env: std::collections::HashMap<String, String>,
    /// When set, inline images are also written here, named by content
    /// hash.
    pub images_dir: Option<PathBuf>,
}

/// How the executor obtains a kernel bus; `reset` launches a fresh one.
#[async_trait]
pub trait KernelFactory: Send + Sync {
    async fn launch(&self, workspace: &Path) -> ExecutorResult<Arc<dyn KernelBus>>;
}

/// Launches the kernel as a child process in the workspace.
pub struct ProcessKernelFactory {
    spec: KernelSpec,
}

impl ProcessKernelFactory {
    pub fn new(spec: KernelSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl KernelFactory for ProcessKernelFactory {
    async fn launch(&self, workspace: &Path) -> ExecutorResult<Arc<dyn KernelBus>> {
        Ok(Arc::new(ProcessBus::spawn(&self.spec, workspace).await?))
    }
}

/// Live state between `start` and `close`.
struct Runtime {
    service: ToolService,
    kernel: Arc<KernelClient>,
    peer: Arc<Mutex<ApprovalPeer>>,
}

pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<ProviderRegistry>,
    approvals: Arc<ApprovalBroker>,
    codegen: CodeGenerator,
    kernel_factory: Arc<dyn KernelFactory>,
    backend_override: Option<Arc<dyn ToolBackend>>,
    runtime: Mutex<Option<Runtime>>,
    /// Serializes submissions: at most one is in flight per session.
    submissions: Arc<Mutex<()>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let factory = Arc::new(ProcessKernelFactory::new(config.kernel.clone()));
        Self::with_kernel_factory(config, factory)
    }

    /// Executor with a custom kernel launcher (embedded or test kernels).
    pub fn with_kernel_factory(config: ExecutorConfig, factory: Arc<dyn KernelFactory>) -> Self {
        let registry = Arc::new(ProviderRegistry::new(ConnectOptions {
            connect_timeout: config.connect_timeout(),
        }));
        let approvals = Arc::new(ApprovalBroker::new(config.approval_timeout()));
        let codegen = CodeGenerator::new(config.workspace.clone());

        Self {
            config,
            registry,
            approvals,
            codegen,
            kernel_factory: factory,
            backend_override: None,
            runtime: Mutex::new(None),
            submissions: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the registry-backed dispatch with a custom backend.
    /// Must be called before `start`.
    #[must_use]
    pub fn with_tool_backend(mut self, backend: Arc<dyn ToolBackend>) -> Self {
        self.backend_override = Some(backend);
        self
    }

    /// Register or replace a provider. Idempotent; the provider starts
    /// lazily on its first tool call (or on `generate_tools`).
    pub fn register_provider(
        &self,
        name: impl Into<String>,
        spec: ProviderSpec,
    ) -> ExecutorResult<()> {
        spec.validate()?;
        self.registry.register(name, spec);
        Ok(())
    }

    pub fn deregister_provider(&self, name: &str) {
        self.registry.deregister(name);
    }

    /// Connect to a provider (if not already connected), list its
    /// tools, and write the generated modules into the workspace.
    pub async fn generate_tools(&self, name: &str) -> ExecutorResult<Vec<String>> {
        let session = self.registry.session_for(name).await?;
        self.codegen.generate_provider(name, &session.tools_sorted())
    }

    /// Bind the tool service, write the preamble, and launch the kernel.
    pub async fn start(&self) -> ExecutorResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.config.workspace)?;

        let backend: Arc<dyn ToolBackend> = match &self.backend_override {
            Some(backend) => Arc::clone(backend),
            None => Arc::new(RegistryBackend::new(Arc::clone(&self.registry))),
        };
        let service = ToolService::bind(backend, Arc::clone(&self.approvals)).await?;
        self.codegen
            .write_preamble(&service.base_url(), &service.secret())?;

        let bus = self.kernel_factory.launch(&self.config.workspace).await?;
        let kernel = Arc::new(KernelClient::start(
            bus,
            self.config.heartbeat_interval(),
            self.config.heartbeat_misses,
        ));

        let peer = self.approvals.attach()?;

        info!(workspace = %self.config.workspace.display(), "Executor started");
        *runtime = Some(Runtime {
            service,
            kernel,
            peer: Arc::new(Mutex::new(peer)),
        });
        Ok(())
    }

    /// Tear everything down. Safe to call on every exit path; a second
    /// call is a no-op.
    pub async fn close(&self) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return;
        };
        self.approvals.cancel_all();
        runtime.kernel.shutdown().await;
        runtime.service.close().await;
        self.registry.close_all();
        info!("Executor closed");
    }

    /// Interrupt any running stream, restart the kernel, and close the
    /// provider sessions. Registered provider specs and generated
    /// modules survive; the preamble is rewritten with a fresh secret.
    pub async fn reset(&self) -> ExecutorResult<()> {
        let mut runtime_slot = self.runtime.lock().await;
        let Some(runtime) = runtime_slot.as_mut() else {
            return Err(ExecutorError::NotStarted);
        };

        let _ = runtime.kernel.interrupt().await;
        self.approvals.cancel_all();
        runtime.kernel.shutdown().await;
        self.registry.close_all();

        let bus = self.kernel_factory.launch(&self.config.workspace).await?;
        runtime.kernel = Arc::new(KernelClient::start(
            bus,
            self.config.heartbeat_interval(),
            self.config.heartbeat_misses,
        ));

        let secret = runtime.service.rotate_secret();
        self.codegen
            .write_preamble(&runtime.service.base_url(), &secret)?;

        info!("Executor reset");
        Ok(())
    }

    /// Convenience over [`Executor::stream`]: accepts every approval
    /// request on the host's behalf (the decision still passes through
    /// the approval broker) and returns the final result.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> ExecutorResult<ExecutionResult> {
        let mut events = self
            .stream(
                code,
                StreamOptions {
                    timeout,
                    ..StreamOptions::default()
                },
            )
            .await?;

        while let Some(event) = events.recv().await {
            match event? {
                StreamEvent::ApprovalRequest(request) => request.accept(),
                StreamEvent::Result(result) => return Ok(result),
                StreamEvent::Chunk(_) => {}
            }
        }
        Err(ExecutorError::KernelLost)
    }

    /// Submit `code` and stream its events.
    ///
    /// The returned channel yields chunks (when enabled) and approval
    /// requests, then exactly one terminal item: `Ok(Result(...))` on
    /// completion, or `Err` on budget timeout / kernel loss.
    pub async fn stream(
        &self,
        code: &str,
        opts: StreamOptions,
    ) -> ExecutorResult<mpsc::Receiver<ExecutorResult<StreamEvent>>> {
        let (kernel, peer) = {
            let runtime = self.runtime.lock().await;
            let runtime = runtime.as_ref().ok_or(ExecutorError::NotStarted)?;
            (Arc::clone(&runtime.kernel), Arc::clone(&runtime.peer))
        };

        let guard = Arc::clone(&self.submissions).lock_owned().await;

        let budget = ExecutionBudget::new(opts.timeout);
        let resolutions = self.approvals.subscribe_resolutions();
        let fragments = kernel.submit(code, opts.kernel_env.clone()).await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let pump = StreamPump {
            kernel,
            peer,
            fragments,
            resolutions,
            budget,
            opts,
            events: events_tx,
            approvals: Arc::downgrade(&self.approvals),
            interrupt_grace: self.config.interrupt_grace(),
            _guard: guard,
        };
        tokio::spawn(pump.run());

        Ok(events_rx)
    }
}

/// State of one in-flight stream.
struct StreamPump {
    kernel: Arc<KernelClient>,
    peer: Arc<Mutex<ApprovalPeer>>,
    fragments: mpsc::Receiver<Fragment>,
    resolutions: broadcast::Receiver<Uuid>,
    budget: ExecutionBudget,
    opts: StreamOptions,
    events: mpsc::Sender<ExecutorResult<StreamEvent>>,
    approvals: Weak<ApprovalBroker>,
    interrupt_grace: Duration,
    _guard: OwnedMutexGuard<()>,
}

impl StreamPump {
    async fn run(mut self) {
        let peer = Arc::clone(&self.peer);
        let mut peer = peer.lock().await;
        let mut accumulator = ResultAccumulator::default();
        let mut pending: HashSet<Uuid> = HashSet::new();

        loop {
            let remaining = self.budget.remaining();
            let budget_armed = remaining.is_some() && !self.budget.is_paused();

            tokio::select! {
                // Checked in order: expiry preempts further processing,
                // and approval traffic is observed before fragments.
                biased;

                _ = tokio::time::sleep(remaining.unwrap_or(Duration::from_secs(86400))), if budget_armed => {
                    debug!("Execution budget exhausted, interrupting kernel");
                    let _ = self.kernel.interrupt().await;
                    self.drain_after_interrupt().await;
                    if let Some(approvals) = self.approvals.upgrade() {
                        approvals.cancel_all();
                    }
                    let _ = self.events.send(Err(ExecutorError::BudgetTimeout)).await;
                    return;
                }

                request = peer.recv() => {
                    let Some(request) = request else { continue };
                    pending.insert(request.id);
                    self.budget.pause();
                    let event = StreamEvent::ApprovalRequest(ApprovalRequestEvent {
                        id: request.id,
                        provider: request.provider,
                        tool: request.tool,
                        args: request.args,
                        broker: self.approvals.clone(),
                    });
                    if self.events.send(Ok(event)).await.is_err() {
                        self.abandon().await;
                        return;
                    }
                }

                resolved = self.resolutions.recv() => {
                    match resolved {
                        Ok(id) => {
                            if pending.remove(&id) && pending.is_empty() {
                                self.budget.resume();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            // Missed resolution notices; resume rather
                            // than pause forever.
                            pending.clear();
                            self.budget.resume();
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }

                fragment = self.fragments.recv() => {
                    match fragment {
                        Some(Fragment::Done) => {
                            let result = accumulator.finish();
                            let _ = self.events.send(Ok(StreamEvent::Result(result))).await;
                            return;
                        }
                        Some(fragment) => {
                            let chunk = accumulator.absorb(fragment, self.opts.images_dir.as_deref()).await;
                            if self.opts.chunks {
                                if let Some(chunk) = chunk {
                                    if self.events.send(Ok(StreamEvent::Chunk(chunk))).await.is_err() {
                                        self.abandon().await;
                                        return;
                                    }
                                }
                            }
                        }
                        None => {
                            warn!("Kernel stream closed without completion");
                            let _ = self.events.send(Err(ExecutorError::KernelLost)).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Host dropped the event stream: interrupt the kernel, cancel any
    /// in-flight approvals, and let the kernel wind down.
    async fn abandon(&mut self) {
        debug!("Event receiver dropped, cancelling stream");
        let _ = self.kernel.interrupt().await;
        if let Some(approvals) = self.approvals.upgrade() {
            approvals.cancel_all();
        }
        self.drain_after_interrupt().await;
    }

    /// Consume fragments until the interrupted submission completes, the
    /// bus closes, or the grace period elapses.
    async fn drain_after_interrupt(&mut self) {
        let deadline = tokio::time::Instant::now() + self.interrupt_grace;
        loop {
            match tokio::time::timeout_at(deadline, self.fragments.recv()).await {
                Ok(Some(Fragment::Done)) | Ok(None) => return,
                Ok(Some(_)) => {}
                Err(_) => {
                    warn!("Kernel did not wind down within the interrupt grace period");
                    return;
                }
            }
        }
    }
}

/// Accumulates fragments into the terminal result.
#[derive(Default)]
struct ResultAccumulator {
    text: String,
    saw_text: bool,
    images: Vec<ImageOutput>,
    error: Option<ExecutionError>,
}

impl ResultAccumulator {
    /// Fold one fragment in; returns the chunk to emit when chunked
    /// streaming is on.
    async fn absorb(
        &mut self,
        fragment: Fragment,
        images_dir: Option<&Path>,
    ) -> Option<ExecutionChunk> {
        match fragment {
            Fragment::Stdout(text) => {
                self.saw_text = true;
                self.text.push_str(&text);
                Some(ExecutionChunk::Stdout(text))
            }
            Fragment::Stderr(text) => {
                self.saw_text = true;
                self.text.push_str(&text);
                Some(ExecutionChunk::Stderr(text))
            }
            Fragment::Image { media_type, data } => {
                let path = match images_dir {
                    Some(dir) => write_image(dir, &media_type, &data).await,
                    None => None,
                };
                self.images.push(ImageOutput {
                    media_type: media_type.clone(),
                    data: data.clone(),
                    path,
                });
                Some(ExecutionChunk::Image { media_type, data })
            }
            Fragment::Error {
                name,
                message,
                traceback,
            } => {
                self.error = Some(ExecutionError {
                    name,
                    message,
                    traceback,
                });
                None
            }
            Fragment::Done => None,
        }
    }

    fn finish(self) -> ExecutionResult {
        ExecutionResult {
            text: self.saw_text.then_some(self.text),
            images: self.images,
            error: self.error,
        }
    }
}

/// Write an inline image under `dir`, named by content hash.
async fn write_image(dir: &Path, media_type: &str, data: &[u8]) -> Option<PathBuf> {
    let extension = match media_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/svg+xml" => "svg",
        "image/gif" => "gif",
        _ => "bin",
    };
    let digest = blake3::hash(data).to_hex();
    let path = dir.join(format!("{}.{extension}", &digest.as_str()[..16]));

    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("Cannot create images directory: {}", e);
        return None;
    }
    match tokio::fs::write(&path, data).await {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("Cannot write image file: {}", e);
            None
        }
    }
}
