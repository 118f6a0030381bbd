use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, trace};

use crate::messaging::message::{Message, PeerId};
use crate::messaging::transport::{MessageHandler, Transport};


/// A transport connecting a number of 'processes' inside a single OS process through in-memory
///  queues. This is useful for tests and for simulating a cluster locally: it delivers messages
///  reliably and in order per sender / receiver pair, which is what the real transport
///  guarantees as well.
pub struct InMemoryTransport {
    myself: PeerId,
    peers: Arc<Vec<mpsc::UnboundedSender<Message>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    cancel_sender: broadcast::Sender<()>,
}

impl Debug for InMemoryTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InMemoryTransport{{myself:{:?}}}", self.myself)
    }
}

impl InMemoryTransport {
    /// Creates a fully connected network of `num_peers` transports, the transport at index `i`
    ///  being peer `#i`.
    pub fn network(num_peers: usize) -> Vec<InMemoryTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_peers)
            .map(|_| mpsc::unbounded_channel())
            .unzip();
        let peers = Arc::new(senders);

        receivers.into_iter()
            .enumerate()
            .map(|(i, receiver)| {
                let (cancel_sender, _) = broadcast::channel(1);
                InMemoryTransport {
                    myself: PeerId::from(i),
                    peers: peers.clone(),
                    receiver: Mutex::new(Some(receiver)),
                    cancel_sender,
                }
            })
            .collect()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn myself(&self) -> PeerId {
        self.myself
    }

    async fn send(&self, mut message: Message) -> anyhow::Result<()> {
        let to = message.peer;
        let queue = self.peers.get(to.index())
            .ok_or_else(|| anyhow!("sending to {:?} which is not part of the network", to))?;

        trace!(from = ?self.myself, ?to, channel = ?message.channel, "sending message");
        message.peer = self.myself;
        queue.send(message)
            .map_err(|_| anyhow!("peer {:?} does not receive messages any more", to))
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut receiver = self.receiver.lock().await
            .take()
            .ok_or_else(|| anyhow!("receive loop for {:?} is already running", self.myself))?;
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!(myself = ?self.myself, "starting in-memory receive loop");

        let result = loop {
            tokio::select! {
                msg = receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if let Err(e) = handler.handle_message(message).await {
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    }
                }
                _ = cancel_receiver.recv() => {
                    debug!(myself = ?self.myself, "receive loop cancelled");
                    break Ok(());
                }
            }
        };

        *self.receiver.lock().await = Some(receiver);
        result
    }

    fn cancel_recv_loop(&self) {
        if self.cancel_sender.send(()).is_err() {
            debug!(myself = ?self.myself, "call to cancel_recv_loop while no receive loop is running");
        }
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::messaging::message::ChannelId;
    use crate::test_util::transaction::RecordingHandler;

    use super::*;

    #[tokio::test]
    async fn test_send_replaces_peer_with_sender() {
        let mut network = InMemoryTransport::network(3);
        let t2 = network.pop().unwrap();
        let _t1 = network.pop().unwrap();
        let t0 = network.pop().unwrap();

        let handler = Arc::new(RecordingHandler::new(2));
        let recv = tokio::spawn({
            let handler = handler.clone();
            async move { t2.recv_loop(handler).await }
        });

        t0.send(Message::freeze(PeerId(2), ChannelId(1), &5u32).unwrap()).await.unwrap();
        t0.send(Message::freeze(PeerId(2), ChannelId(1), &6u32).unwrap()).await.unwrap();

        handler.wait_until_complete().await;
        assert_eq!(handler.received_u32().await, vec![(PeerId(0), 5), (PeerId(0), 6)]);
        recv.abort();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let network = InMemoryTransport::network(2);
        let result = network[0].send(Message::freeze(PeerId(2), ChannelId(1), &5u32).unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handler_error_ends_recv_loop() {
        let network = InMemoryTransport::network(2);
        let handler = Arc::new(RecordingHandler::failing());

        network[1].send(Message::freeze(PeerId(0), ChannelId(1), &5u32).unwrap()).await.unwrap();
        assert!(network[0].recv_loop(handler).await.is_err());
    }

    #[tokio::test]
    async fn test_second_recv_loop_fails() {
        let network = Arc::new(InMemoryTransport::network(1));
        let handler = Arc::new(RecordingHandler::new(0));

        let first = tokio::spawn({
            let network = network.clone();
            let handler = handler.clone();
            async move { network[0].recv_loop(handler).await }
        });
        tokio::task::yield_now().await;

        while network[0].receiver.lock().await.is_some() {
            tokio::task::yield_now().await;
        }
        assert!(network[0].recv_loop(handler).await.is_err());

        network[0].cancel_recv_loop();
        first.await.unwrap().unwrap();
    }
}
