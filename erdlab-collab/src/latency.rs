//! Round-trip latency probing.
//!
//! While a session is up, the prober fires a ping at a fixed cadence and
//! matches replies by probe id on the pong queue. Each matched reply
//! updates the observable latency; probes that outlive the timeout are
//! purged on the next tick so an unanswered probe can never match a late
//! reply. The observable resets to `None` whenever probing stops, so a
//! stale reading never survives a disconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::Connection;

pub struct LatencyProber {
    connection: Arc<Connection>,
    pending: Arc<StdMutex<HashMap<String, Instant>>>,
    latency_tx: Arc<watch::Sender<Option<Duration>>>,
    interval: Duration,
    timeout: Duration,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl LatencyProber {
    pub fn new(connection: Arc<Connection>, interval: Duration, timeout: Duration) -> Self {
        let (latency_tx, _) = watch::channel(None);
        Self {
            connection,
            pending: Arc::new(StdMutex::new(HashMap::new())),
            latency_tx: Arc::new(latency_tx),
            interval,
            timeout,
            task: StdMutex::new(None),
        }
    }

    /// Observe the most recent round-trip sample. `None` until the first
    /// reply arrives, and again after `stop()`.
    pub fn watch_latency(&self) -> watch::Receiver<Option<Duration>> {
        self.latency_tx.subscribe()
    }

    /// Begin probing. Idempotent while running.
    pub fn start(&self) {
        let mut guard = match self.task.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }
        let connection = self.connection.clone();
        let pending = self.pending.clone();
        let interval = self.interval;
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Ok(mut pending) = pending.lock() {
                    pending.retain(|_, sent| sent.elapsed() < timeout);
                }
                if !connection.is_connected() || connection.current_diagram().is_none() {
                    continue;
                }
                let probe_id = Uuid::new_v4().to_string();
                if let Ok(mut pending) = pending.lock() {
                    pending.insert(probe_id.clone(), Instant::now());
                }
                if connection.send_ping(&probe_id).await.is_err() {
                    if let Ok(mut pending) = pending.lock() {
                        pending.remove(&probe_id);
                    }
                }
            }
        });
        *guard = Some(handle);
    }

    /// Record a reply. Unknown probe ids (expired or duplicated) are
    /// ignored.
    pub fn handle_pong(&self, probe_id: &str) {
        let sent = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(probe_id));
        if let Some(sent) = sent {
            let sample = sent.elapsed();
            log::debug!("latency sample: {sample:?}");
            let _ = self.latency_tx.send(Some(sample));
        }
    }

    /// Stop probing and reset the observable.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        let _ = self.latency_tx.send(None);
    }

    #[cfg(test)]
    fn record_probe(&self, probe_id: &str, sent: Instant) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(probe_id.to_owned(), sent);
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Drop for LatencyProber {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
