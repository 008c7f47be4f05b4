//! Encode thread
//!
//! A dedicated OS thread owns the backend for its whole life. Producer-side
//! calls reach it through a bounded command channel; calls that need an
//! answer carry their own response channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::backend::BackendFactory;
use crate::config::PipelineSettings;

use super::engine::EncoderCore;
use super::{EncodeError, EncodeResult, Shared, SlotId};

/// Commands sent to the encode thread
pub(crate) enum EncodeCommand {
    /// Submit a `Captured` slot to the backend
    Submit(SlotId),

    /// Drain completed output
    ProcessOutput {
        response_tx: Sender<EncodeResult<usize>>,
    },

    /// Flush the backend and drain
    Flush {
        response_tx: Sender<EncodeResult<usize>>,
    },

    /// Finish outstanding work and exit
    Shutdown,
}

/// Handle to the encode thread
pub(crate) struct EncodeWorker {
    command_tx: Sender<EncodeCommand>,
    thread_handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    backend_name: &'static str,
}

impl EncodeWorker {
    /// Start the encode thread and create the backend on it
    ///
    /// Blocks until the backend has been created and initialized.
    pub fn spawn(
        shared: Arc<Shared>,
        factory: Arc<dyn BackendFactory>,
        codec: &str,
        settings: &PipelineSettings,
    ) -> EncodeResult<Self> {
        // One Submit per slot can be pending, plus room for a request or
        // Shutdown, so `encode` never waits on the encode thread
        let depth = settings.command_queue_depth.max(settings.pool_size + 1);
        let (command_tx, command_rx) = bounded::<EncodeCommand>(depth);
        let (init_tx, init_rx) = bounded::<EncodeResult<&'static str>>(1);
        let drain_interval = settings.drain_interval();
        let codec = codec.to_string();

        let thread_handle = thread::Builder::new()
            .name("encode-worker".to_string())
            .spawn(move || {
                let core = match create_core(shared, factory.as_ref(), &codec) {
                    Ok(core) => {
                        let _ = init_tx.send(Ok(core.backend_name()));
                        core
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                run_encode_loop(core, command_rx, drain_interval);
            })
            .map_err(|e| EncodeError::WorkerSpawn(format!("Thread spawn failed: {}", e)))?;

        let thread_id = thread_handle.thread().id();
        let init = init_rx.recv();
        match init {
            Ok(Ok(backend_name)) => {
                info!("Encode thread started with backend '{}'", backend_name);
                Ok(Self {
                    command_tx,
                    thread_handle: Some(thread_handle),
                    thread_id,
                    backend_name,
                })
            }
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread_handle.join();
                Err(EncodeError::WorkerSpawn(
                    "encode thread exited during initialization".to_string(),
                ))
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Queue a command without waiting for it
    pub fn send(&self, command: EncodeCommand) -> EncodeResult<()> {
        self.command_tx
            .send(command)
            .map_err(|_| EncodeError::WorkerStopped)
    }

    /// Send a command and wait for its answer
    ///
    /// # Panics
    ///
    /// Panics when called on the encode thread itself (from a listener),
    /// which would otherwise deadlock.
    pub fn request(
        &self,
        command: impl FnOnce(Sender<EncodeResult<usize>>) -> EncodeCommand,
    ) -> EncodeResult<usize> {
        assert!(
            thread::current().id() != self.thread_id,
            "encoder request issued from the encode thread (inside a packet listener)"
        );
        let (response_tx, response_rx) = bounded(1);
        self.send(command(response_tx))?;
        response_rx
            .recv()
            .map_err(|_| EncodeError::WorkerStopped)?
    }

    /// Stop the thread and wait for it
    ///
    /// Returns false if it was already stopped.
    pub fn shutdown(&mut self) -> bool {
        let Some(handle) = self.thread_handle.take() else {
            return false;
        };

        debug!("Shutting down encode thread");
        if self.send(EncodeCommand::Shutdown).is_err() {
            warn!("Encode thread already gone");
        }
        if handle.join().is_err() {
            error!("Encode thread panicked");
        }
        true
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn create_core(
    shared: Arc<Shared>,
    factory: &dyn BackendFactory,
    codec: &str,
) -> EncodeResult<EncoderCore> {
    let mut backend = factory.create_backend(codec)?;
    let config = shared.config.read().clone();
    backend.initialize(&config).map_err(|e| {
        error!("{} initialization failed: {}", backend.name(), e);
        e
    })?;
    Ok(EncoderCore::new(shared, backend))
}

/// Command loop of the encode thread
///
/// With a drain interval configured, a drain also runs whenever that much
/// time has passed since the last one, busy or not.
fn run_encode_loop(
    mut core: EncoderCore,
    command_rx: Receiver<EncodeCommand>,
    drain_interval: Option<Duration>,
) {
    let mut next_drain = drain_interval.map(|interval| Instant::now() + interval);

    loop {
        let received = match next_drain {
            Some(deadline) => command_rx.recv_deadline(deadline),
            None => command_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(EncodeCommand::Submit(id)) => core.submit(id),
            Ok(EncodeCommand::ProcessOutput { response_tx }) => {
                let _ = response_tx.send(core.process_output());
            }
            Ok(EncodeCommand::Flush { response_tx }) => {
                let _ = response_tx.send(core.flush());
            }
            Ok(EncodeCommand::Shutdown) => {
                info!("Shutdown command received");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Command channel closed without shutdown");
                break;
            }
        }

        if let (Some(deadline), Some(interval)) = (next_drain, drain_interval) {
            let now = Instant::now();
            if now >= deadline {
                core.background_drain();
                next_drain = Some(now + interval);
            }
        }
    }

    core.shutdown();
    debug!("Encode thread exiting");
}
