//! A barrier along the [Topology] tree: no process leaves the barrier before all processes
//!  have entered it.
//!
//! Arrival notifications travel up the tree (a process reports to its parent once it and its
//!  whole subtree have arrived), and once the root has seen everybody, a release travels back
//!  down.
//!
//! Processes enter a barrier at arbitrary times, so a child's arrival can reach a process
//!  before that process entered the barrier itself. All barrier traffic therefore goes through
//!  a single channel ([BARRIER_CHANNEL]) that is registered for the lifetime of the [Barriers]
//!  object, and each message names the barrier it belongs to. Arrivals for a barrier this
//!  process has not entered yet are recorded and counted once it enters.

use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::messaging::channel::{SingleTransactionChannel, Transaction};
use crate::messaging::message::{ChannelId, Message, PeerId, EPHEMERAL_CHANNEL_BASE};
use crate::messaging::registry::ChannelRegistry;
use crate::messaging::transport::Transport;
use crate::topology::Topology;


/// The channel carrying all barrier messages. It is reserved: applications can not register it.
pub const BARRIER_CHANNEL: ChannelId = ChannelId(EPHEMERAL_CHANNEL_BASE - 1);

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum BarrierMessageKind {
    /// sent to the parent: the sender and its entire subtree have arrived
    Arrived,
    /// sent to the children: everybody has arrived
    Release,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct BarrierMessage {
    /// the channel id identifying the barrier
    pub barrier: u32,
    pub kind: BarrierMessageKind,
}

struct BarrierState {
    arrived: Vec<bool>,
    num_arrived: usize,
    /// `Some` once this process entered the barrier, until it is released
    done: Option<oneshot::Sender<()>>,
    entered: bool,
    reported_to_parent: bool,
}

impl BarrierState {
    fn new(num_children: usize) -> BarrierState {
        BarrierState {
            arrived: vec![false; num_children],
            num_arrived: 0,
            done: None,
            entered: false,
            reported_to_parent: false,
        }
    }
}

/// The barrier protocol of one process, keeping the state of all barriers that are in progress
///  on it.
pub struct Barriers {
    topology: Topology,
    transport: Arc<dyn Transport>,
    barriers: Mutex<FxHashMap<ChannelId, BarrierState>>,
}

impl Barriers {
    /// Creates the barrier protocol and registers it for [BARRIER_CHANNEL]
    pub async fn register(registry: &ChannelRegistry, topology: Topology, transport: Arc<dyn Transport>) -> anyhow::Result<Arc<Barriers>> {
        let barriers = Arc::new(Barriers {
            topology,
            transport,
            barriers: Default::default(),
        });
        registry.register_channel(BARRIER_CHANNEL, Arc::new(SingleTransactionChannel::new(barriers.clone()))).await?;
        Ok(barriers)
    }

    async fn send(&self, to: PeerId, barrier: ChannelId, kind: BarrierMessageKind) -> anyhow::Result<()> {
        let msg = BarrierMessage {
            barrier: barrier.0,
            kind,
        };
        self.transport.send(Message::freeze(to, BARRIER_CHANNEL, &msg)?).await
    }

    /// Enters the barrier identified by `barrier`. After this returns, the barrier can be
    ///  waited on.
    pub async fn start(&self, barrier: ChannelId) -> anyhow::Result<BarrierRun> {
        let (done, released) = oneshot::channel();

        let mut barriers = self.barriers.lock().await;
        let state = barriers.entry(barrier)
            .or_insert_with(|| BarrierState::new(self.topology.child_count()));
        if state.entered {
            bail!("entering barrier {:?} while it is still in progress", barrier);
        }
        debug!(?barrier, "entering barrier");
        state.entered = true;
        state.done = Some(done);

        self.progress(&mut barriers, barrier).await?;
        Ok(BarrierRun { barrier, released })
    }

    /// Waits until all processes have entered the barrier.
    pub async fn barrier(&self, barrier: ChannelId) -> anyhow::Result<()> {
        self.start(barrier).await?
            .wait().await
    }

    /// Reports to the parent (or releases everybody if this is the root) once this process and
    ///  its entire subtree have arrived.
    async fn progress(&self, barriers: &mut FxHashMap<ChannelId, BarrierState>, barrier: ChannelId) -> anyhow::Result<()> {
        let Some(state) = barriers.get_mut(&barrier) else {
            return Ok(());
        };
        if !state.entered || state.reported_to_parent || state.num_arrived < state.arrived.len() {
            return Ok(());
        }

        match self.topology.parent() {
            Some(parent) => {
                trace!(?barrier, ?parent, "subtree arrived at barrier, notifying parent");
                state.reported_to_parent = true;
                self.send(parent, barrier, BarrierMessageKind::Arrived).await
            }
            None => {
                debug!(?barrier, "all processes arrived at barrier");
                self.release(barriers, barrier).await
            }
        }
    }

    async fn release(&self, barriers: &mut FxHashMap<ChannelId, BarrierState>, barrier: ChannelId) -> anyhow::Result<()> {
        // removing the state before passing the release on makes the barrier id free for reuse
        //  by the time anybody in the subtree can leave this barrier
        let state = barriers.remove(&barrier)
            .ok_or_else(|| anyhow!("releasing barrier {:?} which is not in progress", barrier))?;

        for &child in self.topology.children() {
            self.send(child, barrier, BarrierMessageKind::Release).await?;
        }

        if let Some(done) = state.done {
            if done.send(()).is_err() {
                debug!(?barrier, "nobody is waiting for the barrier any more");
            }
        }
        Ok(())
    }

    async fn on_arrived(&self, message: &Message, barrier: ChannelId) -> anyhow::Result<()> {
        let child_index = self.topology.child_index(message.peer)
            .ok_or_else(|| anyhow!("arrival notification from {:?} which is not a child, barrier {:?}", message.peer, barrier))?;

        let mut barriers = self.barriers.lock().await;
        let state = barriers.entry(barrier)
            .or_insert_with(|| BarrierState::new(self.topology.child_count()));
        if state.arrived[child_index] {
            bail!("multiple arrival notifications from {:?} at barrier {:?}", message.peer, barrier);
        }
        state.arrived[child_index] = true;
        state.num_arrived += 1;
        if !state.entered {
            trace!(?barrier, peer = ?message.peer, "child arrived at barrier before this process entered it");
        }

        self.progress(&mut barriers, barrier).await
    }

    async fn on_release(&self, message: &Message, barrier: ChannelId) -> anyhow::Result<()> {
        if Some(message.peer) != self.topology.parent() {
            bail!("release from {:?} which is not the parent, barrier {:?}", message.peer, barrier);
        }

        let mut barriers = self.barriers.lock().await;
        let reported = barriers.get(&barrier)
            .map(|s| s.reported_to_parent)
            .unwrap_or(false);
        if !reported {
            bail!("release from {:?} before the subtree arrived at barrier {:?}", message.peer, barrier);
        }
        self.release(&mut barriers, barrier).await
    }
}

#[async_trait]
impl Transaction for Barriers {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        let (barrier, kind) = {
            let msg = message.thaw::<BarrierMessage>()?;
            let kind = match msg.kind {
                ArchivedBarrierMessageKind::Arrived => BarrierMessageKind::Arrived,
                ArchivedBarrierMessageKind::Release => BarrierMessageKind::Release,
            };
            (ChannelId(msg.barrier), kind)
        };

        match kind {
            BarrierMessageKind::Arrived => self.on_arrived(&message, barrier).await,
            BarrierMessageKind::Release => self.on_release(&message, barrier).await,
        }
    }
}


/// A barrier this process has entered, and that can be waited on
pub struct BarrierRun {
    barrier: ChannelId,
    released: oneshot::Receiver<()>,
}

impl BarrierRun {
    pub async fn wait(self) -> anyhow::Result<()> {
        self.released.await
            .map_err(|_| anyhow!("barrier {:?} was aborted", self.barrier))
    }
}
