//! Connection event handling.
//!
//! Each actor owns an [`EventTable`] built when it is constructed. A
//! dispatcher task reads the transport's event stream and fans each event
//! out to the handlers registered for its kind.

use std::collections::HashMap;
use std::sync::Arc;
use testplan_env::{ConnectionEvent, ConnectionEventKind, ProfileId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reacts to one kind of connection event.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &ConnectionEvent);
}

/// Event kind → handlers, in registration order.
#[derive(Default, Clone)]
pub struct EventTable {
    handlers: HashMap<ConnectionEventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn on(mut self, kind: ConnectionEventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    pub fn handler_count(&self, kind: ConnectionEventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Runs every handler registered for the event's kind.
    pub fn dispatch(&self, event: &ConnectionEvent) {
        if let Some(handlers) = self.handlers.get(&event.kind()) {
            for handler in handlers {
                handler.handle(event);
            }
        }
    }

    /// Spawns the dispatcher task.
    ///
    /// The task ends when `cancel` fires or the transport drops its sender.
    pub fn spawn_dispatcher(
        self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => self.dispatch(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("event dispatcher lagged, {} events dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("connection event stream closed");
                            break;
                        }
                    },
                }
            }
        })
    }
}

/// Logs every connection.
pub struct LogConnections {
    pub peername: String,
}

impl EventHandler for LogConnections {
    fn handle(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::PeerConnected(endpoint) => {
                info!("{} connected to peer {}", self.peername, endpoint.id);
            }
            ConnectionEvent::ProfileConnected { profile_id, peername } => {
                info!("{} exchanged profiles with {} ({})", self.peername, peername, profile_id);
            }
        }
    }
}

/// Forwards profile ids of profile-connected events to a watcher.
pub struct ForwardProfileConnections {
    tx: mpsc::UnboundedSender<ProfileId>,
}

impl ForwardProfileConnections {
    pub fn new(tx: mpsc::UnboundedSender<ProfileId>) -> Self {
        Self { tx }
    }
}

impl EventHandler for ForwardProfileConnections {
    fn handle(&self, event: &ConnectionEvent) {
        if let ConnectionEvent::ProfileConnected { profile_id, .. } = event {
            // The watcher may already be done
            let _ = self.tx.send(*profile_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use testplan_env::{PeerEndpoint, PeerId};

    struct Count(AtomicUsize);

    impl EventHandler for Count {
        fn handle(&self, _event: &ConnectionEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer_connected() -> ConnectionEvent {
        ConnectionEvent::PeerConnected(PeerEndpoint::new(PeerId::from_string("abcdef0123"), vec![]))
    }

    fn profile_connected(seed: u64) -> ConnectionEvent {
        ConnectionEvent::ProfileConnected {
            profile_id: ProfileId::from_seed(seed),
            peername: format!("peer_{seed}"),
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let peers = Arc::new(Count(AtomicUsize::new(0)));
        let profiles = Arc::new(Count(AtomicUsize::new(0)));
        let table = EventTable::new()
            .on(ConnectionEventKind::PeerConnected, peers.clone())
            .on(ConnectionEventKind::ProfileConnected, profiles.clone())
            .on(ConnectionEventKind::ProfileConnected, profiles.clone());
        assert_eq!(table.handler_count(ConnectionEventKind::PeerConnected), 1);
        assert_eq!(table.handler_count(ConnectionEventKind::ProfileConnected), 2);

        table.dispatch(&peer_connected());
        table.dispatch(&profile_connected(1));
        table.dispatch(&profile_connected(2));

        assert_eq!(peers.0.load(Ordering::SeqCst), 1);
        assert_eq!(profiles.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_dispatcher_forwards_profiles() {
        let (events_tx, events_rx) = broadcast::channel(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let table = EventTable::new().on(
            ConnectionEventKind::ProfileConnected,
            Arc::new(ForwardProfileConnections::new(tx)),
        );
        let handle = table.spawn_dispatcher(events_rx, cancel.clone());

        events_tx.send(peer_connected()).unwrap();
        events_tx.send(profile_connected(7)).unwrap();

        assert_eq!(rx.recv().await, Some(ProfileId::from_seed(7)));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_stops_when_stream_closes() {
        let (events_tx, events_rx) = broadcast::channel::<ConnectionEvent>(4);
        let handle = EventTable::new().spawn_dispatcher(events_rx, CancellationToken::new());

        drop(events_tx);
        handle.await.unwrap();
    }
}
