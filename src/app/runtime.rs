use super::{Orchestrator, ShutdownReason};
use crate::error::{OrchestratorError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

type SharedSender = Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>;

impl Orchestrator {
    /// Run until a signal or a shutdown request arrives, then shut down
    pub async fn run(&self) -> Result<i32> {
        info!("Conductor is running");

        let shutdown_receiver = self
            .shutdown_receiver
            .lock()
            .take()
            .ok_or_else(|| OrchestratorError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers(Arc::clone(&self.shutdown_sender));

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| OrchestratorError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {}", shutdown_reason);

        let exit_code = self.shutdown(shutdown_reason).await;

        info!("Conductor shutdown complete");
        Ok(exit_code)
    }

    fn setup_signal_handlers(&self, shutdown_sender: SharedSender) {
        #[cfg(unix)]
        {
            let sender = Arc::clone(&shutdown_sender);
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    let cancel = self.ctx.child_token();
                    self.ctx.spawn_task("sigterm", async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            received = sigterm.recv() => {
                                if received.is_some() {
                                    info!("Received SIGTERM signal");
                                    send_reason(&sender, ShutdownReason::Signal("SIGTERM".to_string()));
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!("Failed to register SIGTERM handler: {}", e),
            }
        }

        let cancel = self.ctx.child_token();
        self.ctx.spawn_task("sigint", async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("Received SIGINT signal (Ctrl+C)");
                        send_reason(&shutdown_sender, ShutdownReason::Signal("SIGINT".to_string()));
                    }
                }
            }
        });
    }
}

fn send_reason(sender: &SharedSender, reason: ShutdownReason) {
    if let Some(sender) = sender.lock().take() {
        let _ = sender.send(reason);
    }
}
