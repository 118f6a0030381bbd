use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, info};

use crate::collective::barrier::{BarrierRun, Barriers};
use crate::collective::reduce::{self, ReduceRun, Reductor};
use crate::config::NodeConfig;
use crate::freeze::{Freeze, ThawOwned};
use crate::messaging::message::{ChannelId, PeerId};
use crate::messaging::registry::ChannelRegistry;
use crate::messaging::transport::udp::UdpTransport;
use crate::messaging::transport::Transport;
use crate::rpc::call::{self, RpcResponse};
use crate::rpc::data_getter::{DataGetter, DataGetterRequest};
use crate::rpc::service::{self, Service};
use crate::topology::Topology;


/// This is the public API of a process taking part in collective communication. It ties
///  together the process' position in the tree, its channel registry and its transport.
///
/// A node's [Node::recv] loop must be running (typically in a spawned task) for anything to
///  arrive, so all other operations rely on it.
pub struct Node {
    topology: Topology,
    registry: Arc<ChannelRegistry>,
    transport: Arc<dyn Transport>,
    barriers: Arc<Barriers>,
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node{{{:?}}}", self.topology)
    }
}

impl Node {
    /// Creates a node with its own channel registry. The barrier protocol is registered right
    ///  away, so that barrier messages from peers can arrive before this node enters a barrier.
    pub async fn new(topology: Topology, transport: Arc<dyn Transport>) -> anyhow::Result<Node> {
        if topology.myself() != transport.myself() {
            bail!("topology is for {:?}, but the transport is for {:?}", topology.myself(), transport.myself());
        }

        let registry = Arc::new(ChannelRegistry::new());
        let barriers = Barriers::register(&registry, topology.clone(), transport.clone()).await?;

        Ok(Node {
            topology,
            registry,
            transport,
            barriers,
        })
    }

    /// Creates a node communicating over UDP, with the tree topology defined by the config
    pub async fn from_config(config: Arc<NodeConfig>) -> anyhow::Result<Node> {
        config.validate()?;
        let topology = config.topology()?;
        let transport = Arc::new(UdpTransport::new(config).await?);
        Node::new(topology, transport).await
    }

    pub fn myself(&self) -> PeerId {
        self.topology.myself()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Runs the loop that receives messages and dispatches them to registered channels. It
    ///  returns `Ok` when cancelled, and an error when a protocol violation occurred: that is
    ///  fatal, and the application should shut down.
    #[tracing::instrument(skip(self), fields(myself = ?self.myself()))]
    pub async fn recv(&self) -> anyhow::Result<()> {
        info!("starting receive loop");
        let result = self.transport.recv_loop(self.registry.clone()).await;
        debug!("receive loop terminated");
        result
    }

    pub fn cancel_recv(&self) {
        self.transport.cancel_recv_loop();
    }

    /// Calls the service registered for `channel` on `peer`. See [call::call].
    pub async fn call<Resp: Freeze, Req: Freeze>(&self, channel: ChannelId, peer: PeerId, request: &Req) -> anyhow::Result<RpcResponse<Resp>> {
        call::call(&self.registry, self.transport.as_ref(), channel, peer, request).await
    }

    pub async fn register_service<S: Service>(&self, channel: ChannelId, service: Arc<S>) -> anyhow::Result<()> {
        service::register_service(&self.registry, self.transport.clone(), channel, service).await
    }

    pub async fn unregister_service(&self, channel: ChannelId) -> anyhow::Result<()> {
        self.registry.unregister_channel(channel).await
    }

    /// Lets every peer fetch a copy of `data` through [Node::get_remote_data]
    pub async fn serve_data<T: Freeze + Clone>(&self, channel: ChannelId, data: Arc<T>) -> anyhow::Result<()> {
        self.register_service(channel, Arc::new(DataGetter::new(data))).await
    }

    /// Fetches a copy of the data `peer` serves on `channel`
    pub async fn get_remote_data<T: ThawOwned>(&self, channel: ChannelId, peer: PeerId) -> anyhow::Result<T> {
        let response: RpcResponse<T> = self.call(channel, peer, &DataGetterRequest::GetData).await?;
        response.to_owned_value()
    }

    /// Registers this process for a reduction run, returning a handle to wait for its result.
    ///  All processes of the run should have started it before contributions start to arrive,
    ///  which is what separating [Node::start_reduce] from waiting allows.
    pub async fn start_reduce<T: Freeze, R: Reductor<T>>(&self, channel: ChannelId, reductor: R, value: T) -> anyhow::Result<ReduceRun<T>> {
        reduce::start_reduce(&self.registry, &self.transport, &self.topology, channel, reductor, value).await
    }

    /// Takes part in a reduction run. At the root, this returns the fold of all processes'
    ///  values; everywhere else, it returns the fold of the process' subtree.
    pub async fn reduce<T: Freeze, R: Reductor<T>>(&self, channel: ChannelId, reductor: R, value: T) -> anyhow::Result<T> {
        reduce::reduce(&self.registry, &self.transport, &self.topology, channel, reductor, value).await
    }

    /// Enters the barrier identified by `channel`, returning a handle to wait for its release.
    ///  Barriers have their own channel, so `channel` only needs to be unique among barriers.
    pub async fn start_barrier(&self, channel: ChannelId) -> anyhow::Result<BarrierRun> {
        self.barriers.start(channel).await
    }

    pub async fn barrier(&self, channel: ChannelId) -> anyhow::Result<()> {
        self.barriers.barrier(channel).await
    }
}
