//! Actor info exchange.
//!
//! Every node publishes its [`ActorInfo`] once, waits until all nodes have
//! published, then reads the topic until it knows every other node. Because
//! the barrier is entered only after publishing, every value is already on
//! the topic when subscribers start reading.

use crate::error::PlanError;
use crate::plan::within;
use crate::role::{Role, RoleAssigner};
use crate::states::{ACTOR_INFO_PUBLISHED, ACTOR_INFO_TOPIC};
use std::collections::BTreeMap;
use testplan_env::{ActorInfo, EnvError, PeerId, PeerTransport, SyncService, SyncServiceExt};
use tokio::time::Instant;
use tracing::{debug, info};

/// Peers learned during info exchange, keyed by peer id.
///
/// Never holds the local node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTable {
    peers: BTreeMap<PeerId, ActorInfo>,
}

impl PeerTable {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&ActorInfo> {
        self.peers.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Peers ordered by sequence number.
    pub fn by_seq(&self) -> Vec<&ActorInfo> {
        let mut infos: Vec<_> = self.peers.values().collect();
        infos.sort_by_key(|info| info.seq);
        infos
    }

    /// Peers holding `role`, ordered by sequence number.
    pub fn with_role(&self, roles: &RoleAssigner, role: Role) -> Vec<&ActorInfo> {
        self.by_seq()
            .into_iter()
            .filter(|info| roles.role(info.seq) == role)
            .collect()
    }

    fn insert(&mut self, info: ActorInfo) {
        self.peers.insert(info.peer_id().clone(), info);
    }
}

/// One node's side of the info exchange.
pub struct ActorInfoExchange<'a> {
    sync: &'a dyn SyncService,
    transport: &'a dyn PeerTransport,
    instances: u64,
    deadline: Instant,
}

impl<'a> ActorInfoExchange<'a> {
    pub fn new(
        sync: &'a dyn SyncService,
        transport: &'a dyn PeerTransport,
        instances: u64,
        deadline: Instant,
    ) -> Self {
        Self {
            sync,
            transport,
            instances,
            deadline,
        }
    }

    /// Publishes `own` and collects every other node's info.
    pub async fn run(&self, own: &ActorInfo) -> Result<PeerTable, PlanError> {
        let expected = self.instances.saturating_sub(1) as usize;

        self.sync.publish(&ACTOR_INFO_TOPIC, own).await?;
        within(self.deadline, ACTOR_INFO_PUBLISHED.as_str(), async {
            self.sync.signal_and_wait(&ACTOR_INFO_PUBLISHED, self.instances).await?;
            Ok(())
        })
        .await?;
        info!("all {} actors published their info", self.instances);

        let table = within(self.deadline, ACTOR_INFO_TOPIC.name(), self.collect(own, expected)).await?;

        if table.len() != expected {
            return Err(PlanError::IncompleteExchange {
                received: table.len(),
                expected,
            });
        }
        info!("peer table complete with {} peers", table.len());
        Ok(table)
    }

    async fn collect(&self, own: &ActorInfo, expected: usize) -> Result<PeerTable, PlanError> {
        let mut table = PeerTable::default();
        if expected == 0 {
            return Ok(table);
        }

        let mut infos = self.sync.subscribe(&ACTOR_INFO_TOPIC).await?;
        while table.len() < expected {
            let info = match infos.next().await {
                Ok(info) => info,
                Err(EnvError::SubscriptionClosed(_)) => {
                    return Err(PlanError::IncompleteExchange {
                        received: table.len(),
                        expected,
                    })
                }
                Err(err) => return Err(err.into()),
            };

            if info.peer_id() == own.peer_id() || table.contains(info.peer_id()) {
                continue;
            }
            debug!("learned peer {} ({}) seq {}", info.peername, info.peer_id(), info.seq);
            self.transport.add_addrs(info.peer_id(), &info.endpoint.addrs);
            table.insert(info);
        }
        Ok(table)
    }
}
