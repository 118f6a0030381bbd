//! Tree reduction: every process contributes a value, and the values are folded up the
//!  [Topology] tree so that the root ends up with the fold of all contributions.
//!
//! The reduction operation is assumed to be associative but *not* commutative. Each process
//!  waits until all of its children's contributions are there and then folds them into its own
//!  value strictly in the order of the children in the topology, regardless of the order in
//!  which the messages arrived. That makes the result deterministic:
//!
//! ```ascii
//! root value = own . subtree(child 0) . subtree(child 1) . ...
//! ```

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rkyv::Archived;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::freeze::Freeze;
use crate::messaging::channel::{SingleTransactionChannel, Transaction};
use crate::messaging::message::{ChannelId, Message};
use crate::messaging::registry::ChannelRegistry;
use crate::messaging::transport::Transport;
use crate::topology::Topology;


/// The fold operation of a reduction. The right hand side is a contribution from a child's
///  subtree (thawed in place), the left hand side is the local accumulator that is modified.
///
/// Implementations should not rely on mutable state shared between calls.
pub trait Reductor<T: Freeze>: Send + Sync + 'static {
    fn reduce(&self, right_hand: &Archived<T>, left_hand: &mut T);
}

impl <T: Freeze, F> Reductor<T> for F
where
    F: Fn(&Archived<T>, &mut T) + Send + Sync + 'static,
{
    fn reduce(&self, right_hand: &Archived<T>, left_hand: &mut T) {
        self(right_hand, left_hand)
    }
}


struct ReduceState<T> {
    /// one slot per child, in topology order
    received: Vec<Option<Message>>,
    num_received: usize,
    value: Option<T>,
    done: Option<oneshot::Sender<T>>,
}

/// The protocol state of one reduction run on one process.
pub struct ReduceTransaction<T: Freeze, R: Reductor<T>> {
    channel: ChannelId,
    topology: Topology,
    reductor: R,
    registry: Arc<ChannelRegistry>,
    transport: Arc<dyn Transport>,
    state: Mutex<ReduceState<T>>,
}

impl <T: Freeze, R: Reductor<T>> Debug for ReduceTransaction<T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReduceTransaction{{channel:{:?},myself:{:?}}}", self.channel, self.topology.myself())
    }
}

impl <T: Freeze, R: Reductor<T>> ReduceTransaction<T, R> {
    fn new(channel: ChannelId, topology: Topology, reductor: R, registry: Arc<ChannelRegistry>, transport: Arc<dyn Transport>, value: T, done: oneshot::Sender<T>) -> ReduceTransaction<T, R> {
        let num_children = topology.child_count();
        ReduceTransaction {
            channel,
            topology,
            reductor,
            registry,
            transport,
            state: Mutex::new(ReduceState {
                received: (0..num_children).map(|_| None).collect(),
                num_received: 0,
                value: Some(value),
                done: Some(done),
            }),
        }
    }

    /// Folds the children's contributions into the own value, in topology order, and sends the
    ///  result to the parent (unless this is the root).
    async fn fold_and_forward(&self, received: Vec<Message>, mut value: T) -> anyhow::Result<T> {
        for message in &received {
            let contribution = message.thaw::<T>()
                .map_err(|e| anyhow!("contribution from {:?} during reduce on {:?}: {}", message.peer, self.channel, e))?;
            self.reductor.reduce(contribution, &mut value);
        }
        drop(received);

        if let Some(parent) = self.topology.parent() {
            trace!(channel = ?self.channel, ?parent, "sending subtree result to parent");
            self.transport.send(Message::freeze(parent, self.channel, &value)?).await?;
        }
        Ok(value)
    }

    fn complete(&self, done: Option<oneshot::Sender<T>>, value: T) {
        debug!(channel = ?self.channel, "reduce complete");
        if let Some(done) = done {
            if done.send(value).is_err() {
                debug!(channel = ?self.channel, "nobody is waiting for the result of the reduce any more");
            }
        }
    }
}

#[async_trait]
impl <T: Freeze, R: Reductor<T>> Transaction for ReduceTransaction<T, R> {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        let child_index = self.topology.child_index(message.peer)
            .ok_or_else(|| anyhow!("message from {:?} unexpected during reduce on {:?}", message.peer, self.channel))?;

        let ready = {
            let mut state = self.state.lock().await;
            if state.value.is_none() {
                bail!("message from {:?} after reduce on {:?} was complete", message.peer, self.channel);
            }
            if state.received[child_index].is_some() {
                bail!("multiple messages from {:?} during reduce on {:?}", message.peer, self.channel);
            }

            trace!(channel = ?self.channel, peer = ?message.peer, child_index, "received contribution");
            state.received[child_index] = Some(message);
            state.num_received += 1;

            if state.num_received == state.received.len() {
                let received = std::mem::take(&mut state.received)
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>();
                let value = state.value.take()
                    .ok_or_else(|| anyhow!("reduce on {:?} completed twice", self.channel))?;
                Some((received, value, state.done.take()))
            }
            else {
                None
            }
        };

        if let Some((received, value, done)) = ready {
            let folded = self.fold_and_forward(received, value).await;
            self.registry.unregister_channel(self.channel).await?;
            self.complete(done, folded?);
        }
        Ok(())
    }
}


/// A reduction run that was started and whose result can be waited for
pub struct ReduceRun<T> {
    channel: ChannelId,
    result: oneshot::Receiver<T>,
}

impl <T> ReduceRun<T> {
    /// Waits until this process' part of the reduction is complete. On the root, the result is
    ///  the fold of all processes' contributions, on other processes it is the fold of their
    ///  subtree (which was already sent to the parent).
    pub async fn wait(self) -> anyhow::Result<T> {
        self.result.await
            .map_err(|_| anyhow!("reduce on {:?} was aborted", self.channel))
    }
}

/// Starts a reduction run with `value` as this process' contribution: after this returns,
///  the channel is registered (unless this process is a leaf, which has nothing to wait for
///  and completes immediately).
pub async fn start_reduce<T: Freeze, R: Reductor<T>>(
    registry: &Arc<ChannelRegistry>,
    transport: &Arc<dyn Transport>,
    topology: &Topology,
    channel: ChannelId,
    reductor: R,
    value: T,
) -> anyhow::Result<ReduceRun<T>> {
    let (done, result) = oneshot::channel();
    let transaction = ReduceTransaction::new(channel, topology.clone(), reductor, registry.clone(), transport.clone(), value, done);

    if topology.child_count() == 0 {
        // a leaf's own contribution is the fold of its subtree
        let mut state = transaction.state.lock().await;
        let value = state.value.take()
            .ok_or_else(|| anyhow!("reduce on {:?} has no value", channel))?;
        let done = state.done.take();
        drop(state);

        let value = transaction.fold_and_forward(Vec::new(), value).await?;
        transaction.complete(done, value);
    }
    else {
        debug!(?channel, num_children = topology.child_count(), "starting reduce");
        registry.register_channel(channel, Arc::new(SingleTransactionChannel::new(Arc::new(transaction)))).await?;
    }

    Ok(ReduceRun {
        channel,
        result,
    })
}

/// Runs a complete reduction, returning the folded value.
pub async fn reduce<T: Freeze, R: Reductor<T>>(
    registry: &Arc<ChannelRegistry>,
    transport: &Arc<dyn Transport>,
    topology: &Topology,
    channel: ChannelId,
    reductor: R,
    value: T,
) -> anyhow::Result<T> {
    start_reduce(registry, transport, topology, channel, reductor, value).await?
        .wait().await
}
