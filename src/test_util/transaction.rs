use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::messaging::channel::Transaction;
use crate::messaging::message::{Message, PeerId};
use crate::messaging::transport::MessageHandler;


/// A [Transaction] that accepts every message and keeps it for later inspection
#[derive(Default)]
pub struct RecordingTransaction {
    received: Mutex<Vec<Message>>,
}

impl RecordingTransaction {
    pub fn new() -> RecordingTransaction {
        Default::default()
    }

    /// sender and payload of all received messages, assuming they carry a frozen `u32`
    pub async fn received_u32(&self) -> Vec<(PeerId, u32)> {
        received_u32(&self.received.lock().await)
    }
}

#[async_trait]
impl Transaction for RecordingTransaction {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        self.received.lock().await
            .push(message);
        Ok(())
    }
}


/// A [MessageHandler] that keeps received messages, allowing tests to wait until an expected
///  number of messages has arrived
pub struct RecordingHandler {
    num_expected: usize,
    fail: bool,
    received: Mutex<Vec<Message>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new(num_expected: usize) -> RecordingHandler {
        RecordingHandler {
            num_expected,
            fail: false,
            received: Default::default(),
            notify: Notify::new(),
        }
    }

    /// a handler that treats every message as a protocol violation
    pub fn failing() -> RecordingHandler {
        RecordingHandler {
            fail: true,
            ..RecordingHandler::new(0)
        }
    }

    pub async fn is_complete(&self) -> bool {
        self.received.lock().await.len() >= self.num_expected
    }

    pub async fn wait_until_complete(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_complete().await {
                return;
            }
            notified.await;
        }
    }

    pub async fn received_u32(&self) -> Vec<(PeerId, u32)> {
        received_u32(&self.received.lock().await)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        if self.fail {
            bail!("unexpected message {:?}", message);
        }
        self.received.lock().await
            .push(message);
        self.notify.notify_waiters();
        Ok(())
    }
}


fn received_u32(messages: &[Message]) -> Vec<(PeerId, u32)> {
    messages.iter()
        .map(|m| (m.peer, *m.thaw::<u32>().expect("payload is not a frozen u32")))
        .collect()
}
