use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use rkyv::AlignedVec;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, trace, warn};

use crate::config::NodeConfig;
use crate::messaging::envelope::{Checksum, Envelope};
use crate::messaging::message::{Message, PeerId};
use crate::messaging::transport::{MessageHandler, Transport};


/// Sends every message as a single UDP datagram, prefixed with an [Envelope].
///
/// UDP does not guarantee delivery, but the protocols running on top of this transport treat a
///  lost message as a hang rather than something to recover from. This transport is meant for
///  networks where loss is rare, e.g. inside a data center.
pub struct UdpTransport {
    config: Arc<NodeConfig>,
    cancel_sender: broadcast::Sender<()>,
    ipv4_send_socket: Option<UdpSocket>,
    ipv6_send_socket: Option<UdpSocket>,
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpTransport{{myself:{:?}}}", self.config.myself)
    }
}

impl UdpTransport {
    pub async fn new(config: Arc<NodeConfig>) -> anyhow::Result<UdpTransport> {
        config.validate()?;

        let (cancel_sender, _) = broadcast::channel(1);

        // sockets are bound only for the IP versions that are actually used in the cluster
        let ipv4_send_socket = match config.peer_addrs.iter().any(|a| a.is_ipv4()) {
            true => Some(UdpSocket::bind(SocketAddr::from_str("0.0.0.0:0")?).await?),
            false => None,
        };
        let ipv6_send_socket = match config.peer_addrs.iter().any(|a| a.is_ipv6()) {
            true => Some(UdpSocket::bind(SocketAddr::from_str("[::]:0")?).await?),
            false => None,
        };

        Ok(UdpTransport {
            config,
            cancel_sender,
            ipv4_send_socket,
            ipv6_send_socket,
        })
    }

    fn encode(&self, message: &Message) -> anyhow::Result<BytesMut> {
        let len = Envelope::SERIALIZED_LEN + message.data.len();
        if len > self.config.max_message_size {
            bail!("message for {:?} on {:?} has {} bytes, exceeding the maximum message size of {} bytes", message.peer, message.channel, len, self.config.max_message_size);
        }

        let envelope = Envelope {
            from: self.config.myself,
            to: message.peer,
            checksum: Checksum::new(&self.config.shared_secret, self.config.myself, message.peer, message.channel, message.reply_to, &message.data),
            channel: message.channel,
            reply_to: message.reply_to,
        };

        let mut buf = BytesMut::with_capacity(len);
        envelope.write(&mut buf);
        buf.extend_from_slice(&message.data);
        Ok(buf)
    }

    /// Turns a received datagram into a message, or returns `None` if the datagram is broken
    ///  in some way. Broken datagrams are a transport level problem (and logged), not a protocol
    ///  violation.
    fn decode(&self, msg_buf: &[u8], sender: SocketAddr) -> Option<Message> {
        if msg_buf.len() > self.config.max_message_size {
            warn!(?sender, "received a datagram exceeding max message size of {} bytes - skipping", self.config.max_message_size);
            return None;
        }

        let mut payload = msg_buf;
        let envelope = match Envelope::try_read(&mut payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(?sender, "received a datagram without a valid envelope - discarding: {}", e);
                return None;
            }
        };

        if envelope.to != self.config.myself {
            warn!(?sender, "received a message for {:?} - was the cluster configured inconsistently? Ignoring the message", envelope.to);
            return None;
        }

        let actual_checksum = Checksum::new(&self.config.shared_secret, envelope.from, envelope.to, envelope.channel, envelope.reply_to, payload);
        if envelope.checksum != actual_checksum {
            warn!(?sender, "checksum error in message - skipping");
            return None;
        }

        // copy into an aligned buffer so that the payload can be thawed in place
        let mut data = AlignedVec::with_capacity(payload.len());
        data.extend_from_slice(payload);

        Some(Message {
            peer: envelope.from,
            channel: envelope.channel,
            reply_to: envelope.reply_to,
            data,
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn myself(&self) -> PeerId {
        self.config.myself
    }

    async fn send(&self, message: Message) -> anyhow::Result<()> {
        let to_addr = *self.config.peer_addrs.get(message.peer.index())
            .ok_or_else(|| anyhow!("no network address configured for {:?}", message.peer))?;
        let buf = self.encode(&message)?;

        trace!(to = ?message.peer, ?to_addr, channel = ?message.channel, "sending message");

        let socket = if to_addr.is_ipv4() { &self.ipv4_send_socket } else { &self.ipv6_send_socket };
        let socket = socket.as_ref()
            .ok_or_else(|| anyhow!("no send socket for {:?}", to_addr))?;
        socket.send_to(&buf, to_addr).await?;
        Ok(())
    }

    #[tracing::instrument(skip(handler))]
    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(self.config.my_addr()?).await?;
        // one byte more than the maximum to detect oversized datagrams
        let mut buf = vec![0u8; self.config.max_message_size + 1];

        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop");

        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if let Some(message) = self.decode(&buf[..len], from) {
                                handler.handle_message(message).await?;
                            }
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        Ok(())
    }

    fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}
