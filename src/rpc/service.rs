use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rkyv::Archived;
use tracing::trace;

use crate::freeze::Freeze;
use crate::messaging::channel::{Channel, Transaction};
use crate::messaging::message::{ChannelId, Message};
use crate::messaging::registry::ChannelRegistry;
use crate::messaging::transport::Transport;


/// This is how a network object is defined on the server side: a service turns a request into
///  a response.
///
/// Requests are thawed in place, so the service sees a view into the request's buffer. The
///  response is frozen and sent back to the requester on the reply channel the request names.
pub trait Service: Send + Sync + 'static {
    type Request: Freeze;
    type Response: Freeze;

    fn handle_request(&self, request: &Archived<Self::Request>) -> Self::Response;
}


/// The [Channel] a service is registered with. Every incoming request gets its own
///  [ServiceTransaction], so that concurrent requests don't interfere with each other.
pub struct ServiceChannel<S: Service> {
    service: Arc<S>,
    transport: Arc<dyn Transport>,
}

impl <S: Service> Channel for ServiceChannel<S> {
    fn transaction_for(&self, _message: &Message) -> Arc<dyn Transaction> {
        Arc::new(ServiceTransaction {
            service: self.service.clone(),
            transport: self.transport.clone(),
        })
    }
}

/// Handles a single request: it thaws the request, calls the service, and sends the response.
///  It is complete after that, and dropped once the receive loop is done with it.
pub struct ServiceTransaction<S: Service> {
    service: Arc<S>,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl <S: Service> Transaction for ServiceTransaction<S> {
    async fn handle_message(&self, request: Message) -> anyhow::Result<()> {
        let reply_to = request.reply_to
            .ok_or_else(|| anyhow!("request from {:?} on {:?} has no reply channel", request.peer, request.channel))?;

        let response = {
            let thawed = request.thaw::<S::Request>()
                .map_err(|e| anyhow!("request from {:?} on {:?}: {}", request.peer, request.channel, e))?;
            self.service.handle_request(thawed)
        };

        trace!(peer = ?request.peer, channel = ?request.channel, ?reply_to, "sending RPC response");
        let response = Message::freeze(request.peer, reply_to, &response)?;
        drop(request);

        self.transport.send(response).await
    }
}


pub async fn register_service<S: Service>(registry: &ChannelRegistry, transport: Arc<dyn Transport>, channel: ChannelId, service: Arc<S>) -> anyhow::Result<()> {
    registry.register_channel(channel, Arc::new(ServiceChannel {
        service,
        transport,
    })).await
}
