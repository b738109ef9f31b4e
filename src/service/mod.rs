//! The tool service: a loopback HTTP endpoint the kernel calls to
//! invoke tools.
//!
//! `POST /run` runs the approval → validation → dispatch pipeline;
//! `GET /approvals` serves the host approval channel as a WebSocket.
//! Both require the session's bearer secret, which is handed to the
//! kernel only through the generated preamble module.

pub mod backend;
mod channel;
mod run;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use rand::{distr::Alphanumeric, Rng};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use backend::{RegistryBackend, ToolBackend, ToolDescriptor};

use crate::approval::ApprovalBroker;
use crate::errors::{ExecutorError, ExecutorResult};

const SECRET_LEN: usize = 48;

#[derive(Clone)]
pub struct ServiceState {
    pub backend: Arc<dyn ToolBackend>,
    pub approvals: Arc<ApprovalBroker>,
    pub secret: Arc<RwLock<String>>,
}

pub struct ToolService {
    addr: SocketAddr,
    secret: Arc<RwLock<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ToolService {
    /// Bind to a loopback ephemeral port and start serving.
    pub async fn bind(
        backend: Arc<dyn ToolBackend>,
        approvals: Arc<ApprovalBroker>,
    ) -> ExecutorResult<Self> {
        let secret = Arc::new(RwLock::new(generate_secret()));
        let state = ServiceState {
            backend,
            approvals,
            secret: Arc::clone(&secret),
        };

        let router = Router::new()
            .route("/run", post(run::handle_run))
            .route("/approvals", get(channel::handle_approvals))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                require_bearer,
            ))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ExecutorError::Service(format!("bind tool service: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ExecutorError::Service(format!("tool service address: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("Tool service terminated: {}", e);
            }
        });

        info!(%addr, "Tool service listening");
        Ok(Self {
            addr,
            secret,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn secret(&self) -> String {
        self.secret.read().clone()
    }

    /// Replace the bearer secret, invalidating every copy handed out so
    /// far. Used by `reset`, which rewrites the preamble afterwards.
    pub fn rotate_secret(&self) -> String {
        let fresh = generate_secret();
        *self.secret.write() = fresh.clone();
        fresh
    }

    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn require_bearer(
    State(state): State<ServiceState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.secret.read().as_str());

    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

fn generate_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
