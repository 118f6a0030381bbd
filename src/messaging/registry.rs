use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, trace};

use crate::messaging::channel::Channel;
use crate::messaging::message::{ChannelId, Message, EPHEMERAL_CHANNEL_BASE, NUM_REPLY_CHANNELS};
use crate::messaging::transport::MessageHandler;


/// The registry of channels that are currently bound on this process. Every received message is
///  dispatched through it to the transaction responsible for the message's channel.
///
/// There is typically one registry per process, shared via `Arc` between the receive loop and
///  everything that registers channels, but it is a regular object so that tests can run
///  several 'processes' with independent registries side by side.
pub struct ChannelRegistry {
    channels: RwLock<FxHashMap<ChannelId, Arc<dyn Channel>>>,
    next_reply_channel: AtomicU32,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        ChannelRegistry::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> ChannelRegistry {
        ChannelRegistry {
            channels: Default::default(),
            next_reply_channel: AtomicU32::new(0),
        }
    }

    /// Binds an application channel id. Binding an id that is already bound is an error, as is
    ///  using an id from the range that is reserved for reply channels.
    pub async fn register_channel(&self, id: ChannelId, channel: Arc<dyn Channel>) -> anyhow::Result<()> {
        if id.is_ephemeral() {
            bail!("channel id {:?} is reserved for replies and can not be registered explicitly", id);
        }
        self.do_register(id, channel).await
    }

    async fn do_register(&self, id: ChannelId, channel: Arc<dyn Channel>) -> anyhow::Result<()> {
        match self.channels.write().await
            .entry(id)
        {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for channel {:?} while the first is still registered", id))
            }
            Entry::Vacant(e) => {
                trace!(channel = ?id, "registering channel");
                e.insert(channel);
                Ok(())
            }
        }
    }

    /// Binds a channel under a freshly minted id from the reply range, returning that id
    pub async fn register_reply_channel(&self, channel: Arc<dyn Channel>) -> anyhow::Result<ChannelId> {
        let mut channels = self.channels.write().await;
        for _ in 0..NUM_REPLY_CHANNELS {
            let offset = self.next_reply_channel.fetch_add(1, Ordering::Relaxed) % NUM_REPLY_CHANNELS;
            let id = ChannelId(EPHEMERAL_CHANNEL_BASE + offset);
            if let Entry::Vacant(e) = channels.entry(id) {
                trace!(channel = ?id, "registering reply channel");
                e.insert(channel);
                return Ok(id);
            }
        }
        Err(anyhow!("all reply channel ids are in use"))
    }

    pub async fn unregister_channel(&self, id: ChannelId) -> anyhow::Result<()> {
        let prev = self.channels.write().await
            .remove(&id);
        if prev.is_none() {
            return Err(anyhow!("unregistering channel {:?} which is not registered", id));
        }
        trace!(channel = ?id, "unregistered channel");
        Ok(())
    }

    pub async fn is_registered(&self, id: ChannelId) -> bool {
        self.channels.read().await
            .contains_key(&id)
    }

    /// the number of currently bound channels
    pub async fn len(&self) -> usize {
        self.channels.read().await
            .len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Hands a received message to the transaction responsible for its channel. A message for a
    ///  channel that is not bound is a protocol violation.
    pub async fn dispatch(&self, message: Message) -> anyhow::Result<()> {
        // NB: the lock must be released before the transaction runs - transactions unregister
        //      their channels when they complete
        let channel = self.channels.read().await
            .get(&message.channel)
            .cloned();

        match channel {
            Some(channel) => {
                trace!(channel = ?message.channel, peer = ?message.peer, "dispatching message");
                let transaction = channel.transaction_for(&message);
                transaction.handle_message(message).await
            }
            None => {
                Err(anyhow!("received message from {:?} for channel {:?} which is not registered", message.peer, message.channel))
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ChannelRegistry {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        let channel = message.channel;
        let peer = message.peer;
        match self.dispatch(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(?channel, ?peer, "protocol violation: {}", e);
                Err(e)
            }
        }
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        let num_channels = self.channels.get_mut().len();
        if num_channels > 0 {
            debug!("dropping channel registry with {} channels still registered", num_channels);
        }
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::rstest;

    use crate::messaging::channel::SingleTransactionChannel;
    use crate::messaging::message::PeerId;
    use crate::test_util::transaction::RecordingTransaction;

    use super::*;

    fn recording_channel() -> (Arc<RecordingTransaction>, Arc<dyn Channel>) {
        let transaction = Arc::new(RecordingTransaction::new());
        let channel = Arc::new(SingleTransactionChannel::new(transaction.clone()));
        (transaction, channel)
    }

    #[tokio::test]
    async fn test_register_dispatch_unregister() {
        let registry = ChannelRegistry::new();
        let (transaction, channel) = recording_channel();

        registry.register_channel(ChannelId(5), channel).await.unwrap();
        assert!(registry.is_registered(ChannelId(5)).await);

        registry.dispatch(Message::freeze(PeerId(2), ChannelId(5), &7u32).unwrap()).await.unwrap();
        registry.dispatch(Message::freeze(PeerId(3), ChannelId(5), &8u32).unwrap()).await.unwrap();
        assert_eq!(transaction.received_u32().await, vec![(PeerId(2), 7), (PeerId(3), 8)]);

        registry.unregister_channel(ChannelId(5)).await.unwrap();
        assert!(!registry.is_registered(ChannelId(5)).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let registry = ChannelRegistry::new();
        registry.register_channel(ChannelId(1), recording_channel().1).await.unwrap();
        assert!(registry.register_channel(ChannelId(1), recording_channel().1).await.is_err());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_ephemeral_id_fails() {
        let registry = ChannelRegistry::new();
        assert!(registry.register_channel(ChannelId(EPHEMERAL_CHANNEL_BASE + 1), recording_channel().1).await.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_fails() {
        let registry = ChannelRegistry::new();
        assert!(registry.unregister_channel(ChannelId(3)).await.is_err());
    }

    #[rstest]
    #[case::nothing_registered(None)]
    #[case::other_channel_registered(Some(ChannelId(4)))]
    #[tokio::test]
    async fn test_dispatch_to_unregistered_channel_fails(#[case] registered: Option<ChannelId>) {
        let registry = ChannelRegistry::new();
        if let Some(id) = registered {
            registry.register_channel(id, recording_channel().1).await.unwrap();
        }

        let result = registry.handle_message(Message::freeze(PeerId(1), ChannelId(3), &1u32).unwrap()).await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("ch:3"), "{}", err);
        assert!(err.contains("#1"), "{}", err);
    }

    #[tokio::test]
    async fn test_reply_channels_are_unique_and_ephemeral() {
        let registry = ChannelRegistry::new();

        let a = registry.register_reply_channel(recording_channel().1).await.unwrap();
        let b = registry.register_reply_channel(recording_channel().1).await.unwrap();
        assert_ne!(a, b);
        assert!(a.is_ephemeral());
        assert!(b.is_ephemeral());

        registry.unregister_channel(a).await.unwrap();
        let c = registry.register_reply_channel(recording_channel().1).await.unwrap();
        assert_ne!(b, c);
        assert_eq!(registry.len().await, 2);
    }
}
