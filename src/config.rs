use std::net::SocketAddr;

use anyhow::bail;

use crate::messaging::envelope::Envelope;
use crate::messaging::message::PeerId;
use crate::topology::Topology;

/// the biggest payload a UDP datagram can carry over IPV4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub myself: PeerId,
    /// network addresses of all processes in the cluster, indexed by their [PeerId]
    pub peer_addrs: Vec<SocketAddr>,

    /// the maximum number of children per process in the reduction tree
    pub tree_arity: usize,

    pub shared_secret: Vec<u8>,

    /// the maximum size of a message on the wire, including its envelope. Every message is
    ///  sent as a single datagram, so this is bounded by what UDP can carry
    pub max_message_size: usize,
}

impl NodeConfig {
    pub fn new(myself: PeerId, peer_addrs: Vec<SocketAddr>) -> NodeConfig {
        NodeConfig {
            myself,
            peer_addrs,
            tree_arity: 2,
            shared_secret: b"no secret".to_vec(),
            max_message_size: 65_000,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.peer_addrs.is_empty() {
            bail!("a cluster needs at least one process");
        }
        if self.myself.index() >= self.peer_addrs.len() {
            bail!("{:?} is not part of a cluster of {} processes", self.myself, self.peer_addrs.len());
        }
        if self.tree_arity == 0 {
            bail!("tree arity must be at least 1");
        }
        if self.max_message_size <= Envelope::SERIALIZED_LEN {
            bail!("max message size must leave room for a payload after the {} byte envelope", Envelope::SERIALIZED_LEN);
        }
        if self.max_message_size > MAX_UDP_PAYLOAD {
            bail!("max message size {} exceeds what a UDP datagram can carry ({})", self.max_message_size, MAX_UDP_PAYLOAD);
        }
        Ok(())
    }

    pub fn my_addr(&self) -> anyhow::Result<SocketAddr> {
        match self.peer_addrs.get(self.myself.index()) {
            Some(addr) => Ok(*addr),
            None => bail!("no network address configured for {:?}", self.myself),
        }
    }

    pub fn topology(&self) -> anyhow::Result<Topology> {
        Topology::k_ary_tree(self.myself, self.peer_addrs.len(), self.tree_arity)
    }
}


#[cfg(test)]
mod test {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    fn addrs(n: u16) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| SocketAddr::from_str(&format!("127.0.0.1:{}", 16385 + i)).unwrap())
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::new(PeerId(2), addrs(3));
        config.validate().unwrap();
        assert_eq!(config.my_addr().unwrap(), SocketAddr::from_str("127.0.0.1:16387").unwrap());
        assert_eq!(config.topology().unwrap().parent(), Some(PeerId(0)));
    }

    #[rstest]
    #[case::no_peers(|c: &mut NodeConfig| c.peer_addrs.clear())]
    #[case::myself_out_of_range(|c: &mut NodeConfig| c.myself = PeerId(3))]
    #[case::zero_arity(|c: &mut NodeConfig| c.tree_arity = 0)]
    #[case::message_size_too_small(|c: &mut NodeConfig| c.max_message_size = Envelope::SERIALIZED_LEN)]
    #[case::message_size_too_big(|c: &mut NodeConfig| c.max_message_size = MAX_UDP_PAYLOAD + 1)]
    fn test_validate_fails(#[case] f: fn(&mut NodeConfig)) {
        let mut config = NodeConfig::new(PeerId(1), addrs(3));
        f(&mut config);
        assert!(config.validate().is_err());
    }
}
