//! Kernel client: submission bookkeeping, stream demultiplexing, and
//! liveness monitoring over a [`KernelBus`].
//!
//! One submission is in flight at a time (the executor serializes
//! them). The client pings the kernel on a fixed interval; enough
//! consecutive missed pongs and the bus counts as lost, which closes
//! the current fragment stream without a completion marker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::{Envelope, KernelBus, StreamChannel};
use super::fragment::Fragment;
use crate::errors::{ExecutorError, ExecutorResult};

const FRAGMENT_QUEUE_DEPTH: usize = 64;

struct Submission {
    id: String,
    tx: mpsc::Sender<Fragment>,
}

pub struct KernelClient {
    bus: Arc<dyn KernelBus>,
    current: Arc<Mutex<Option<Submission>>>,
    alive: Arc<AtomicBool>,
    demux: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl KernelClient {
    /// Start the demultiplexer and heartbeat over an open bus.
    pub fn start(
        bus: Arc<dyn KernelBus>,
        heartbeat_interval: Duration,
        heartbeat_misses: u32,
    ) -> Self {
        let current: Arc<Mutex<Option<Submission>>> = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));
        let last_pong = Arc::new(Mutex::new(Instant::now()));

        let demux = tokio::spawn(demux_loop(
            Arc::clone(&bus),
            Arc::clone(&current),
            Arc::clone(&alive),
            Arc::clone(&last_pong),
        ));

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&bus),
            Arc::clone(&current),
            Arc::clone(&alive),
            last_pong,
            heartbeat_interval,
            heartbeat_misses,
        ));

        Self {
            bus,
            current,
            alive,
            demux,
            heartbeat,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Submit code and receive its fragment stream. `env` is applied to
    /// the kernel's environment before the code runs.
    ///
    /// The stream ends with [`Fragment::Done`]; a stream that closes
    /// without it means the kernel was lost mid-execution.
    pub async fn submit(
        &self,
        code: &str,
        env: std::collections::HashMap<String, String>,
    ) -> ExecutorResult<mpsc::Receiver<Fragment>> {
        if !self.is_alive() {
            return Err(ExecutorError::KernelLost);
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(FRAGMENT_QUEUE_DEPTH);

        {
            let mut current = self.current.lock();
            if current.is_some() {
                return Err(ExecutorError::Kernel(
                    "a submission is already in flight".to_string(),
                ));
            }
            *current = Some(Submission { id: id.clone(), tx });
        }

        if let Err(e) = self
            .bus
            .send(Envelope::Execute {
                id,
                code: code.to_string(),
                env,
            })
            .await
        {
            self.current.lock().take();
            return Err(e);
        }
        Ok(rx)
    }

    /// Ask the kernel to abort the current submission.
    ///
    /// The stream subsequently yields an interrupt error fragment and
    /// then completion.
    pub async fn interrupt(&self) -> ExecutorResult<()> {
        let id = match self.current.lock().as_ref() {
            Some(submission) => submission.id.clone(),
            None => return Ok(()),
        };
        self.bus.send(Envelope::Interrupt { id }).await
    }

    /// Tear down the bus and stop the background tasks.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.current.lock().take();
        self.bus.shutdown().await;
        self.heartbeat.abort();
        // The demultiplexer exits on its own once the bus reports closed.
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.demux.abort();
        self.heartbeat.abort();
    }
}

fn mark_lost(alive: &AtomicBool, current: &Mutex<Option<Submission>>) {
    alive.store(false, Ordering::SeqCst);
    // Dropping the sender closes the fragment stream without `Done`.
    current.lock().take();
}

async fn demux_loop(
    bus: Arc<dyn KernelBus>,
    current: Arc<Mutex<Option<Submission>>>,
    alive: Arc<AtomicBool>,
    last_pong: Arc<Mutex<Instant>>,
) {
    loop {
        let Some(envelope) = bus.recv().await else {
            if alive.load(Ordering::SeqCst) {
                warn!("Kernel bus closed");
            }
            mark_lost(&alive, &current);
            return;
        };

        match envelope {
            Envelope::Pong { .. } => {
                *last_pong.lock() = Instant::now();
            }
            Envelope::Stream { id, channel, text } => {
                let fragment = match channel {
                    StreamChannel::Stdout => Fragment::Stdout(text),
                    StreamChannel::Stderr => Fragment::Stderr(text),
                };
                deliver(&current, &id, fragment, false).await;
            }
            Envelope::Display {
                id,
                media_type,
                data,
            } => match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(bytes) => {
                    deliver(
                        &current,
                        &id,
                        Fragment::Image {
                            media_type,
                            data: bytes,
                        },
                        false,
                    )
                    .await;
                }
                Err(e) => warn!("Dropping undecodable display payload: {}", e),
            },
            Envelope::Error {
                id,
                name,
                message,
                traceback,
            } => {
                deliver(
                    &current,
                    &id,
                    Fragment::Error {
                        name,
                        message,
                        traceback,
                    },
                    false,
                )
                .await;
            }
            Envelope::Done { id } => {
                deliver(&current, &id, Fragment::Done, true).await;
            }
            Envelope::Execute { .. } | Envelope::Interrupt { .. } | Envelope::Ping { .. } => {
                debug!("Ignoring coordinator-bound envelope from kernel");
            }
        }
    }
}

/// Send a fragment to the submission it belongs to. `terminal` clears
/// the in-flight slot after delivery.
async fn deliver(
    current: &Mutex<Option<Submission>>,
    id: &str,
    fragment: Fragment,
    terminal: bool,
) {
    let tx = {
        let guard = current.lock();
        match guard.as_ref() {
            Some(submission) if submission.id == id => submission.tx.clone(),
            _ => {
                debug!("Dropping fragment for inactive submission {}", id);
                return;
            }
        }
    };

    if tx.send(fragment).await.is_err() {
        debug!("Fragment receiver dropped for submission {}", id);
    }

    if terminal {
        let mut guard = current.lock();
        if guard.as_ref().is_some_and(|s| s.id == id) {
            guard.take();
        }
    }
}

async fn heartbeat_loop(
    bus: Arc<dyn KernelBus>,
    current: Arc<Mutex<Option<Submission>>>,
    alive: Arc<AtomicBool>,
    last_pong: Arc<Mutex<Instant>>,
    interval: Duration,
    misses: u32,
) {
    let seq = AtomicU64::new(0);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the pong deadline
    // starts one full interval out.
    ticker.tick().await;

    let allowance = interval * misses.max(1);
    loop {
        ticker.tick().await;
        if !alive.load(Ordering::SeqCst) {
            return;
        }

        if last_pong.lock().elapsed() > allowance {
            warn!("Kernel missed {} heartbeats; marking lost", misses);
            mark_lost(&alive, &current);
            return;
        }

        let seq = seq.fetch_add(1, Ordering::Relaxed);
        if bus.send(Envelope::Ping { seq }).await.is_err() {
            warn!("Kernel heartbeat send failed; marking lost");
            mark_lost(&alive, &current);
            return;
        }
    }
}
