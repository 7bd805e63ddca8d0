use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 100;
const SHUTDOWN_TIMEOUT_SEC: u64 = 30;

#[derive(Clone, Debug)]
pub struct ConnectionState {
    pub id: u64,
    pub peer: SocketAddr,
    pub established_at: Instant,
    pub last_activity: Instant,
    pub destination: Option<String>,
}

impl ConnectionState {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer,
            established_at: now,
            last_activity: now,
            destination: None,
        }
    }

    pub fn mark_activity(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Registry of open relay connections plus the process-wide stop signal.
pub struct GracefulShutdown {
    connections: RwLock<HashMap<u64, ConnectionState>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    pub fn register_connection(&self, peer: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().insert(id, ConnectionState::new(id, peer));
        id
    }

    pub fn unregister_connection(&self, id: u64) -> Option<ConnectionState> {
        self.connections.write().remove(&id)
    }

    pub fn set_destination(&self, id: u64, destination: &str) {
        if let Some(state) = self.connections.write().get_mut(&id) {
            state.destination = Some(destination.to_string());
        }
    }

    pub fn mark_activity(&self, id: u64) {
        if let Some(state) = self.connections.write().get_mut(&id) {
            state.mark_activity();
        }
    }

    pub fn get_active_connections(&self) -> usize {
        self.connections.read().len()
    }

    pub fn initiate_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Resolves once shutdown has been initiated, including when that
    /// happened before the call.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits for registered connections to finish. Returns how many were
    /// still open when the deadline passed.
    pub async fn graceful_close_all(&self, deadline: Duration) -> usize {
        let result = timeout(deadline, async {
            while self.get_active_connections() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match result {
            Ok(_) => {
                log::info!("All connections closed gracefully");
                0
            }
            Err(_) => {
                let remaining = self.get_active_connections();
                log::warn!("Shutdown timeout: {} connections remaining", remaining);
                self.connections.write().clear();
                remaining
            }
        }
    }

    pub fn default_deadline() -> Duration {
        Duration::from_secs(SHUTDOWN_TIMEOUT_SEC)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionRecovery {
    max_retries: u32,
    backoff_ms: u64,
}

impl ConnectionRecovery {
    pub fn new() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_ms: RETRY_BACKOFF_MS,
        }
    }

    pub fn with_policy(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff_ms,
        }
    }

    pub async fn retry_with_backoff<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_error = Some(e);

                    if attempt < self.max_retries - 1 {
                        let delay = self.backoff_ms * (2_u64.pow(attempt));
                        log::debug!("Retry attempt {} after {}ms", attempt + 1, delay);
                        sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Max retries exceeded")))
    }
}

impl Default for ConnectionRecovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Closes the write half with a FIN rather than letting a drop reset it.
pub async fn shutdown_without_rst<S>(stream: &mut S) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    match stream.shutdown().await {
        Ok(_) => {
            log::debug!("Socket shutdown gracefully (FIN sent)");
            Ok(())
        }
        Err(e) => {
            log::debug!("Error during graceful shutdown: {}", e);
            Err(e.into())
        }
    }
}
