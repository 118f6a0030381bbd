pub mod in_memory;
pub mod udp;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::message::{Message, PeerId};


/// A [Transport] delivers opaque messages between numbered peers. It is responsible for getting
///  a message's payload to the process identified by [Message::peer], and for replacing `peer`
///  with the sender's id on the receiving side.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn myself(&self) -> PeerId;

    /// Sends a message to the peer it is addressed to, taking ownership of it
    async fn send(&self, message: Message) -> anyhow::Result<()>;

    /// Receives messages, passing them to the handler one at a time. This returns when the loop
    ///  is cancelled, or with an error if the handler returns one (i.e. on a protocol violation).
    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}


/// This trait decouples the implementation of message transport (different strategies) from the
///  handling of a message once it is received (always the same, dispatch through the channel
///  registry).
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()>;
}
