//! Connection registry: the five listening endpoints and the pending
//! pool of sessions not yet coupled to an `ObservationSystem`
//!.
//!
//! The registry only accepts connections and tracks which sessions are
//! still unclaimed; the coupling decision itself — matching a
//! `register` message's `(gid, uid)` against the live `ObservationSystem`
//! set — is the `Coordinator`'s job, since only it holds that set.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use super::session::{Endpoint, Session, SessionEvent, SessionId};

/// Ports for the five listening endpoints.
#[derive(Debug, Clone, Copy)]
pub struct ListenerPorts {
    pub client: u16,
    pub mount: u16,
    pub camera: u16,
    pub telescope_generic: u16,
    pub annex: u16,
}

impl Default for ListenerPorts {
    fn default() -> Self {
        ListenerPorts {
            client: 4010,
            mount: 4011,
            camera: 4012,
            telescope_generic: 4013,
            annex: 4014,
        }
    }
}

/// Owns the pending pool: sessions accepted but not yet coupled to an
/// `ObservationSystem`. Client sessions never enter this pool — they're
/// active as soon as they're accepted.
#[derive(Clone)]
pub struct Registry {
    pending: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds all five listeners and spawns their accept loops. Returns
    /// immediately; connections and their events stream through `events`.
    pub async fn bind(
        ports: ListenerPorts,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> std::io::Result<Self> {
        let registry = Registry::new();

        registry
            .spawn_listener(Endpoint::Client, ports.client, events.clone(), false)
            .await?;
        registry
            .spawn_listener(Endpoint::Mount, ports.mount, events.clone(), true)
            .await?;
        registry
            .spawn_listener(Endpoint::Camera, ports.camera, events.clone(), true)
            .await?;
        registry
            .spawn_listener(
                Endpoint::TelescopeGeneric,
                ports.telescope_generic,
                events.clone(),
                true,
            )
            .await?;
        registry
            .spawn_listener(Endpoint::Annex, ports.annex, events, true)
            .await?;

        Ok(registry)
    }

    async fn spawn_listener(
        &self,
        endpoint: Endpoint,
        port: u16,
        events: mpsc::UnboundedSender<SessionEvent>,
        pending_until_coupled: bool,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("listening for {:?} sessions on port {}", endpoint, port);
        let pending = self.pending.clone();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("{:?} listener accept error: {}", endpoint, err);
                        continue;
                    }
                };
                info!("accepted {:?} session from {}", endpoint, peer);
                let session = Session::spawn(stream, endpoint, events.clone());
                if pending_until_coupled {
                    pending.lock().await.insert(session.id, session);
                }
            }
        });

        Ok(())
    }

    /// Removes and returns a pending session, if it is still unclaimed.
    /// Used by the Coordinator when a `register` message names a valid
    /// `(gid, uid)` and the session transfers to an `ObservationSystem`.
    pub async fn take_pending(&self, id: SessionId) -> Option<Session> {
        self.pending.lock().await.remove(&id)
    }

    /// Drops a pending session without coupling it, e.g. on malformed
    /// addressing.
    pub async fn discard_pending(&self, id: SessionId) {
        self.pending.lock().await.remove(&id);
    }

    pub async fn is_pending(&self, id: SessionId) -> bool {
        self.pending.lock().await.contains_key(&id)
    }
}
