use tokio::sync::mpsc;
use tracing::error;

/// Funnels ctrl-c and SIGTERM into one shutdown signal.
pub struct ShutdownManager {
    rx: mpsc::Receiver<()>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);

        let ctrl_c_tx = tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                // no printing here, the terminal may already be gone
                Ok(()) => {
                    let _ = ctrl_c_tx.send(()).await;
                }
                Err(err) => error!("listening for ctrl-c failed: {err}"),
            }
        });

        #[cfg(unix)]
        {
            let term_tx = tx.clone();
            tokio::spawn(async move {
                let mut term_signal =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("installing the SIGTERM handler failed");

                term_signal.recv().await;
                let _ = term_tx.send(()).await;
            });
        }

        ShutdownManager { rx }
    }

    /// Block until a shutdown signal arrives; the caller tears down and
    /// flushes state itself.
    pub async fn wait(&mut self) {
        self.rx.recv().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
