use std::fmt::{Debug, Formatter};

use rkyv::{AlignedVec, Archived};

use crate::freeze::Freeze;


/// Processes in a cluster are numbered `0..n` - this is a process' number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(pub u32);

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<usize> for PeerId {
    fn from(value: usize) -> Self {
        PeerId(value as u32)
    }
}

impl PeerId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}


/// A [ChannelId] is sent as part of every message to identify the [crate::messaging::channel::Channel]
///  that handles it on the receiving side.
///
/// Application code picks channel ids by convention (the same id on all processes taking part
///  in an exchange), but only from the range below [EPHEMERAL_CHANNEL_BASE]. Ids from that value
///  upwards are minted by the registry for RPC replies.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub u32);

pub const EPHEMERAL_CHANNEL_BASE: u32 = 1 << 31;

/// `u32::MAX` is not a valid channel id, it marks 'no reply channel' on the wire
pub const NUM_REPLY_CHANNELS: u32 = u32::MAX - EPHEMERAL_CHANNEL_BASE;

impl ChannelId {
    pub fn is_ephemeral(&self) -> bool {
        self.0 >= EPHEMERAL_CHANNEL_BASE
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_ephemeral() {
            write!(f, "ch:reply-{}", self.0 - EPHEMERAL_CHANNEL_BASE)
        }
        else {
            write!(f, "ch:{}", self.0)
        }
    }
}


/// A message as it travels between processes: an opaque (frozen) payload plus routing
///  information.
///
/// For a message that is about to be sent, `peer` is the *destination*. For a received message,
///  it is the *sender*.
///
/// A message has exactly one owner at any time. Sending it or handing it to a transaction moves
///  it, and dropping it releases the buffer.
pub struct Message {
    pub peer: PeerId,
    pub channel: ChannelId,
    /// the channel on the sender's side that a reply should be addressed to, if any
    pub reply_to: Option<ChannelId>,
    pub data: AlignedVec,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{peer:{:?},channel:{:?},reply_to:{:?},len:{}}}", self.peer, self.channel, self.reply_to, self.data.len())
    }
}

impl Message {
    /// Creates a message with an empty payload buffer that has room for exactly `size` bytes
    pub fn new(peer: PeerId, channel: ChannelId, size: usize) -> Message {
        Message {
            peer,
            channel,
            reply_to: None,
            data: AlignedVec::with_capacity(size),
        }
    }

    /// Creates a message with `value` frozen into its payload
    pub fn freeze<T: Freeze>(peer: PeerId, channel: ChannelId, value: &T) -> anyhow::Result<Message> {
        let mut message = Message::new(peer, channel, value.frozen_size()?);
        value.freeze_into(&mut message.data)?;
        Ok(message)
    }

    pub fn with_reply_to(mut self, reply_to: ChannelId) -> Message {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn thaw<T: Freeze>(&self) -> anyhow::Result<&Archived<T>> {
        T::thaw(&self.data)
    }
}
