//! NAT-style datagram relay
//!
//! A single receive loop reads from the from-side datagram handle. The first
//! packet from a source dials a dedicated destination session and spawns a
//! reverse task for it; later packets reuse the mapping from the
//! [`PseudoConnTable`] until it sits idle for longer than the purge window.
//!
//! Dials are serialised by their own lock. The table lock is only held for
//! lookups and refreshes, so replies on established sessions keep flowing
//! while a new source is being dialed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use meshtunnel_core::{DialConfig, Result, TunnelError};
use meshtunnel_transport::{DatagramConn, DatagramSession, Dialer, PeerAddr, Shutdown, MAX_UDP_PACKET};

use crate::table::PseudoConnTable;

/// Shortest janitor sweep period
const MIN_SWEEP: Duration = Duration::from_millis(50);

pub(crate) type SessionTable = PseudoConnTable<Arc<dyn DatagramSession>>;

/// Relay from one datagram listener to a fixed destination
pub struct UdpRelay {
    to: String,
    dialer: Arc<dyn Dialer>,
    dial_config: DialConfig,
    table: Mutex<SessionTable>,
    dial_lock: tokio::sync::Mutex<()>,
    idle: Option<Duration>,
    shutdown: Shutdown,
    verbose: bool,
}

impl UdpRelay {
    /// `idle` of `None` keeps mappings until the relay closes.
    ///
    /// The relay stops once `shutdown` fires.
    pub fn new(
        to: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        dial_config: DialConfig,
        idle: Option<Duration>,
        shutdown: Shutdown,
        verbose: bool,
    ) -> Self {
        Self {
            to: to.into(),
            dialer,
            dial_config,
            table: Mutex::new(PseudoConnTable::new(idle)),
            dial_lock: tokio::sync::Mutex::new(()),
            idle,
            shutdown,
            verbose,
        }
    }

    /// Live pseudo-connections
    pub fn session_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether `source` currently has a live pseudo-connection
    pub fn has_session(&self, source: &PeerAddr) -> bool {
        self.table.lock().contains(&source.to_string())
    }

    /// Read from `from_conn` until it fails or the relay shuts down.
    ///
    /// Returns `Ok` when stopped by shutdown, the read error otherwise.
    pub async fn run(self: Arc<Self>, from_conn: Arc<dyn DatagramConn>) -> Result<()> {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        let result = loop {
            if self.shutdown.is_triggered() {
                break Ok(());
            }

            let received = tokio::select! {
                res = from_conn.recv_from(&mut buf) => res,
                _ = self.shutdown.wait() => break Ok(()),
            };
            let (n, source) = match received {
                Ok(received) => received,
                Err(e) => {
                    if self.shutdown.is_triggered() {
                        break Ok(());
                    }
                    warn!("UDP receive failed: {}", e);
                    break Err(e);
                }
            };

            let key = source.to_string();
            let (session, fresh) = match self.session_for(&key).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("UDP dial to {} for {} failed: {}", self.to, key, e);
                    continue;
                }
            };

            // Every mapped session gets its reverse task, even if the first
            // send below fails.
            if fresh {
                verbose!(self.verbose, "UDP session {} -> {}", key, self.to);
                self.spawn_reverse(from_conn.clone(), source, session.clone());
            }

            if let Err(e) = session.send(&buf[..n]).await {
                warn!("UDP send to {} for {} failed: {}", self.to, key, e);
                continue;
            }
            self.table.lock().touch(&key);
        };

        if let Err(e) = from_conn.close().await {
            debug!("Closing UDP listener: {}", e);
        }
        result
    }

    /// Existing session for `key`, or a freshly dialed one (`true`).
    ///
    /// Dials one at a time, so one source never gets two sessions.
    async fn session_for(&self, key: &str) -> Result<(Arc<dyn DatagramSession>, bool)> {
        if let Some(session) = self.table.lock().get(key) {
            return Ok((session, false));
        }

        let _dialing = self.dial_lock.lock().await;
        if let Some(session) = self.table.lock().get(key) {
            return Ok((session, false));
        }

        let session = match self.dial_config.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.dialer.dial_udp(&self.to, &self.dial_config))
                .await
                .map_err(|_| TunnelError::DialTimeout(self.dial_config.dial_timeout_ms))??,
            None => self.dialer.dial_udp(&self.to, &self.dial_config).await?,
        };

        // Whatever was left under this key has expired.
        let stale = self.table.lock().insert(key, session.clone());
        if let Some(stale) = stale {
            close_session(&stale).await;
        }
        Ok((session, true))
    }

    /// Copy replies from `session` back to `source`
    fn spawn_reverse(
        self: &Arc<Self>,
        from_conn: Arc<dyn DatagramConn>,
        source: PeerAddr,
        session: Arc<dyn DatagramSession>,
    ) {
        let relay = self.clone();
        tokio::spawn(async move {
            let key = source.to_string();
            let mut buf = vec![0u8; MAX_UDP_PACKET];
            loop {
                if relay.shutdown.is_triggered() {
                    break;
                }

                let received = tokio::select! {
                    res = session.recv(&mut buf) => res,
                    _ = relay.shutdown.wait() => break,
                };
                let n = match received {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("UDP session for {} ended: {}", key, e);
                        break;
                    }
                };

                relay.table.lock().touch(&key);

                if let Err(e) = from_conn.send_to(&buf[..n], &source).await {
                    debug!("UDP reply to {} failed: {}", key, e);
                    break;
                }
            }

            // Forget the mapping if it still points at this session.
            {
                let mut table = relay.table.lock();
                if table
                    .get(&key)
                    .map_or(false, |current| Arc::ptr_eq(&current, &session))
                {
                    table.remove(&key);
                }
            }
            close_session(&session).await;
        });
    }

    /// Periodically close idle sessions; `None` when nothing ever expires
    pub fn spawn_janitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = (self.idle? / 4).max(MIN_SWEEP);
        let relay = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = relay.shutdown.wait() => break,
                }
                let expired = relay.table.lock().purge_expired();
                if !expired.is_empty() {
                    debug!("Evicting {} idle UDP sessions", expired.len());
                }
                for session in expired {
                    close_session(&session).await;
                }
            }
        }))
    }

    /// Drop every mapping and close its session
    pub async fn close_all(&self) -> Result<()> {
        let sessions = self.table.lock().drain();
        let mut errors = Vec::new();
        for session in sessions {
            if let Err(e) = session.close().await {
                errors.push(e);
            }
        }
        match TunnelError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn close_session(session: &Arc<dyn DatagramSession>) {
    if let Err(e) = session.close().await {
        debug!("Closing UDP session: {}", e);
    }
}
