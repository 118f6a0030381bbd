use std::sync::Arc;

use async_trait::async_trait;

use crate::messaging::message::Message;


/// A [Transaction] is the protocol state behind one logical exchange of messages - one RPC call,
///  one served request, one reduction run. It is never reused for a different exchange.
///
/// Its lifecycle is: created and initialized by its owner, then [Transaction::handle_message]
///  is called for every message that arrives for it, and once its protocol is complete it
///  unregisters its channel (if it owns one) and releases whoever is waiting for it.
#[async_trait]
pub trait Transaction: Send + Sync + 'static {
    /// Called by the receive loop for a message addressed to this transaction's channel. The
    ///  message is moved into the transaction.
    ///
    /// An `Err` signals a protocol violation which is fatal for the receive loop.
    async fn handle_message(&self, message: Message) -> anyhow::Result<()>;
}

/// A [Channel] is the handler bound to a [crate::messaging::message::ChannelId] in the registry.
///  It decides which [Transaction] handles a given message: a channel can hand out a single
///  long-lived transaction, or create a new transaction per incoming message.
pub trait Channel: Send + Sync + 'static {
    fn transaction_for(&self, message: &Message) -> Arc<dyn Transaction>;
}

/// A channel that routes all of its messages to one and the same transaction
pub struct SingleTransactionChannel {
    transaction: Arc<dyn Transaction>,
}

impl SingleTransactionChannel {
    pub fn new(transaction: Arc<dyn Transaction>) -> SingleTransactionChannel {
        SingleTransactionChannel { transaction }
    }
}

impl Channel for SingleTransactionChannel {
    fn transaction_for(&self, _message: &Message) -> Arc<dyn Transaction> {
        self.transaction.clone()
    }
}
