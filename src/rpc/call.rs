use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rkyv::Archived;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::freeze::{Freeze, ThawOwned};
use crate::messaging::channel::{SingleTransactionChannel, Transaction};
use crate::messaging::message::{ChannelId, Message, PeerId};
use crate::messaging::registry::ChannelRegistry;
use crate::messaging::transport::Transport;


/// The response to an RPC call. It owns the response message, and it gives access to the
///  response as a view into that message's buffer - no copying involved.
///
/// Each call has its own response object, so this is intentionally not `Clone`.
pub struct RpcResponse<T: Freeze> {
    message: Message,
    pd: PhantomData<T>,
}

impl <T: Freeze> Debug for RpcResponse<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcResponse{{{:?}}}", self.message)
    }
}

impl <T: Freeze> RpcResponse<T> {
    fn new(message: Message) -> RpcResponse<T> {
        RpcResponse {
            message,
            pd: PhantomData,
        }
    }

    /// the peer that sent the response
    pub fn peer(&self) -> PeerId {
        self.message.peer
    }

    /// The response as a view into the response buffer. The buffer was validated on arrival,
    ///  so this only fails if a different `T` is used on the sending side.
    pub fn get(&self) -> anyhow::Result<&Archived<T>> {
        T::thaw(&self.message.data)
    }

    /// copies the response out of its buffer
    pub fn to_owned_value(&self) -> anyhow::Result<T> where T: ThawOwned {
        T::thaw_owned(&self.message.data)
    }
}


/// The caller side of a single RPC call: it waits for exactly one response on its reply
///  channel, validates it and hands it over to the waiting caller.
struct ReplyTransaction<Resp: Freeze> {
    registry: Arc<ChannelRegistry>,
    response_sender: Mutex<Option<oneshot::Sender<Message>>>,
    pd: PhantomData<Resp>,
}

impl <Resp: Freeze> ReplyTransaction<Resp> {
    /// Gives up on the response, unregistering the reply channel unless the response already
    ///  arrived.
    async fn abandon(&self, reply_channel: ChannelId) -> anyhow::Result<()> {
        let pending = self.response_sender.lock().await
            .take();
        if pending.is_some() {
            trace!(channel = ?reply_channel, "abandoning RPC call");
            self.registry.unregister_channel(reply_channel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl <Resp: Freeze> Transaction for ReplyTransaction<Resp> {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        let response_sender = self.response_sender.lock().await
            .take();

        let Some(response_sender) = response_sender else {
            bail!("second response from {:?} on {:?} - an RPC call expects exactly one response", message.peer, message.channel);
        };

        self.registry.unregister_channel(message.channel).await?;
        if let Err(e) = Resp::thaw(&message.data) {
            // dropping the sender lets the waiting caller fail too
            bail!("invalid RPC response from {:?} on {:?}: {}", message.peer, message.channel, e);
        }

        trace!(channel = ?message.channel, peer = ?message.peer, "received RPC response");
        if response_sender.send(message).is_err() {
            debug!("RPC caller stopped waiting for its response - discarding the response");
        }
        Ok(())
    }
}


/// Unregisters a call's reply channel if the call ends without a response, including when the
///  call's future is dropped (e.g. by a timeout around it).
struct PendingReply<Resp: Freeze> {
    transaction: Arc<ReplyTransaction<Resp>>,
    reply_channel: ChannelId,
    armed: bool,
}

impl <Resp: Freeze> PendingReply<Resp> {
    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn release(mut self) -> anyhow::Result<()> {
        self.disarm();
        self.transaction.abandon(self.reply_channel).await
    }
}

impl <Resp: Freeze> Drop for PendingReply<Resp> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let transaction = self.transaction.clone();
        let reply_channel = self.reply_channel;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transaction.abandon(reply_channel).await {
                        debug!(channel = ?reply_channel, "error unregistering reply channel of an abandoned RPC call: {}", e);
                    }
                });
            }
            Err(_) => {
                debug!(channel = ?reply_channel, "RPC call abandoned outside of a runtime - reply channel stays registered");
            }
        }
    }
}


/// Sends `request` to the service registered for `channel` on `peer`, and waits for the
///  response.
///
/// There is no timeout: if the peer never answers, this waits forever. A response that
///  arrives after the call was given up on hits an unregistered channel, which is a protocol
///  violation on the caller's side.
pub async fn call<Resp: Freeze, Req: Freeze>(
    registry: &Arc<ChannelRegistry>,
    transport: &dyn Transport,
    channel: ChannelId,
    peer: PeerId,
    request: &Req,
) -> anyhow::Result<RpcResponse<Resp>> {
    let (response_sender, response_receiver) = oneshot::channel();
    let transaction = Arc::new(ReplyTransaction::<Resp> {
        registry: registry.clone(),
        response_sender: Mutex::new(Some(response_sender)),
        pd: PhantomData,
    });

    let reply_channel = registry.register_reply_channel(Arc::new(SingleTransactionChannel::new(transaction.clone()))).await?;
    let mut pending = PendingReply {
        transaction,
        reply_channel,
        armed: true,
    };
    debug!(?channel, ?peer, ?reply_channel, "sending RPC request");

    let request = match Message::freeze(peer, channel, request) {
        Ok(msg) => msg.with_reply_to(reply_channel),
        Err(e) => {
            pending.release().await?;
            return Err(e);
        }
    };
    if let Err(e) = transport.send(request).await {
        pending.release().await?;
        return Err(e);
    }

    let response = response_receiver.await;
    pending.disarm();

    let response = response
        .map_err(|_| anyhow!("reply channel {:?} for RPC call to {:?} was dropped without a valid response", reply_channel, peer))?;
    Ok(RpcResponse::new(response))
}


#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use mockall::predicate::always;

    use crate::messaging::message::EPHEMERAL_CHANNEL_BASE;
    use crate::messaging::transport::MockTransport;

    use super::*;

    #[tokio::test]
    async fn test_call_receives_response() {
        let registry = Arc::new(ChannelRegistry::new());

        let (sent_sender, mut sent_receiver) = tokio::sync::mpsc::unbounded_channel();
        let mut transport = MockTransport::new();
        transport.expect_send()
            .with(always())
            .times(1)
            .returning(move |msg| {
                sent_sender.send(msg).unwrap();
                Ok(())
            });

        let call = tokio::spawn({
            let registry = registry.clone();
            async move {
                call::<String, u32>(&registry, &transport, ChannelId(4), PeerId(1), &17).await
            }
        });

        let request = sent_receiver.recv().await.unwrap();
        assert_eq!(request.peer, PeerId(1));
        assert_eq!(request.channel, ChannelId(4));
        assert_eq!(*request.thaw::<u32>().unwrap(), 17);
        let reply_channel = request.reply_to.unwrap();
        assert!(reply_channel.0 >= EPHEMERAL_CHANNEL_BASE);
        assert!(registry.is_registered(reply_channel).await);

        registry.dispatch(Message::freeze(PeerId(1), reply_channel, &"seventeen".to_string()).unwrap()).await.unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.peer(), PeerId(1));
        assert_eq!(response.get().unwrap().as_str(), "seventeen");
        assert_eq!(response.to_owned_value().unwrap(), "seventeen".to_string());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_send_unregisters_reply_channel() {
        let registry = Arc::new(ChannelRegistry::new());

        let mut transport = MockTransport::new();
        transport.expect_send()
            .times(1)
            .returning(|_| Err(anyhow!("network is down")));

        let result = call::<String, u32>(&registry, &transport, ChannelId(4), PeerId(1), &17).await;
        assert!(result.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_second_response_is_a_protocol_violation() {
        let registry = Arc::new(ChannelRegistry::new());
        let (response_sender, _response_receiver) = oneshot::channel();
        let transaction = ReplyTransaction::<u32> {
            registry: registry.clone(),
            response_sender: Mutex::new(Some(response_sender)),
            pd: PhantomData,
        };
        let reply_channel = registry.register_reply_channel(Arc::new(SingleTransactionChannel::new(Arc::new(RecordingNothing)))).await.unwrap();

        transaction.handle_message(Message::freeze(PeerId(1), reply_channel, &1u32).unwrap()).await.unwrap();
        assert!(transaction.handle_message(Message::freeze(PeerId(1), reply_channel, &2u32).unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_response_after_completion_hits_unregistered_channel() {
        let registry = Arc::new(ChannelRegistry::new());
        let (response_sender, _response_receiver) = oneshot::channel();
        let transaction = Arc::new(ReplyTransaction::<u32> {
            registry: registry.clone(),
            response_sender: Mutex::new(Some(response_sender)),
            pd: PhantomData,
        });
        let reply_channel = registry.register_reply_channel(Arc::new(SingleTransactionChannel::new(transaction))).await.unwrap();

        registry.dispatch(Message::freeze(PeerId(1), reply_channel, &1u32).unwrap()).await.unwrap();
        assert!(registry.dispatch(Message::freeze(PeerId(1), reply_channel, &2u32).unwrap()).await.is_err());
    }

    fn forwarding_transport() -> (MockTransport, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (sent_sender, sent_receiver) = tokio::sync::mpsc::unbounded_channel();
        let mut transport = MockTransport::new();
        transport.expect_send()
            .returning(move |msg| {
                sent_sender.send(msg).unwrap();
                Ok(())
            });
        (transport, sent_receiver)
    }

    #[tokio::test]
    async fn test_invalid_response_is_a_protocol_violation() {
        let registry = Arc::new(ChannelRegistry::new());
        let (transport, mut sent_receiver) = forwarding_transport();

        let call = tokio::spawn({
            let registry = registry.clone();
            async move {
                call::<String, u32>(&registry, &transport, ChannelId(4), PeerId(1), &17).await
            }
        });

        let request = sent_receiver.recv().await.unwrap();
        let mut garbage = Message::new(PeerId(1), request.reply_to.unwrap(), 3);
        garbage.data.extend_from_slice(&[1, 2, 3]);
        let err = registry.dispatch(garbage).await.unwrap_err();
        assert!(err.to_string().contains("invalid RPC response from #1"), "{}", err);

        assert!(call.await.unwrap().is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_response_of_wrong_type_is_a_protocol_violation() {
        let registry = Arc::new(ChannelRegistry::new());
        let (transport, mut sent_receiver) = forwarding_transport();

        let call = tokio::spawn({
            let registry = registry.clone();
            async move {
                call::<Vec<String>, u32>(&registry, &transport, ChannelId(4), PeerId(1), &17).await
            }
        });

        let request = sent_receiver.recv().await.unwrap();
        let response = Message::freeze(PeerId(1), request.reply_to.unwrap(), &1u8).unwrap();
        assert!(registry.dispatch(response).await.is_err());
        assert!(call.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_call_unregisters_reply_channel() {
        let registry = Arc::new(ChannelRegistry::new());
        let (transport, mut sent_receiver) = forwarding_transport();

        let result = tokio::time::timeout(
            Duration::from_millis(10),
            call::<String, u32>(&registry, &transport, ChannelId(4), PeerId(1), &17),
        ).await;
        assert!(result.is_err());

        let request = sent_receiver.recv().await.unwrap();
        let reply_channel = request.reply_to.unwrap();

        for _ in 0..100 {
            if !registry.is_registered(reply_channel).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registry.is_empty().await);

        // a late response is a protocol violation like any message for an unregistered channel
        let late = Message::freeze(PeerId(1), reply_channel, &"late".to_string()).unwrap();
        assert!(registry.dispatch(late).await.is_err());
    }

    struct RecordingNothing;

    #[async_trait]
    impl Transaction for RecordingNothing {
        async fn handle_message(&self, _message: Message) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
