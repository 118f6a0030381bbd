use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::messaging::transport::in_memory::InMemoryTransport;
use crate::messaging::transport::Transport;
use crate::node::Node;
use crate::topology::Topology;


/// A number of [Node]s connected through an in-memory network and arranged in a k-ary tree,
///  each with its receive loop running in a spawned task. This must be created inside a
///  tokio runtime.
pub struct TestCluster {
    nodes: Vec<Arc<Node>>,
    transports: Vec<Arc<dyn Transport>>,
    recv_loops: Vec<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl TestCluster {
    pub async fn new(num_nodes: usize, arity: usize) -> anyhow::Result<TestCluster> {
        let mut nodes = Vec::new();
        let mut transports = Vec::new();
        let mut recv_loops = Vec::new();

        for transport in InMemoryTransport::network(num_nodes) {
            let transport: Arc<dyn Transport> = Arc::new(transport);
            let topology = Topology::k_ary_tree(transport.myself(), num_nodes, arity)?;
            let node = Arc::new(Node::new(topology, transport.clone()).await?);

            let recv_node = node.clone();
            recv_loops.push(Some(tokio::spawn(async move { recv_node.recv().await })));
            nodes.push(node);
            transports.push(transport);
        }

        Ok(TestCluster {
            nodes,
            transports,
            recv_loops,
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    /// Access to a node's raw transport, e.g. for injecting messages that bypass the regular
    ///  protocols
    pub fn transport(&self, i: usize) -> &Arc<dyn Transport> {
        &self.transports[i]
    }

    /// Waits until node `i`'s receive loop terminates on its own, returning its result
    pub async fn wait_for_recv_loop(&mut self, i: usize) -> anyhow::Result<()> {
        let handle = self.recv_loops[i].take()
            .ok_or_else(|| anyhow!("receive loop #{} was already awaited", i))?;
        handle.await?
    }

    /// Stops all receive loops that are still running, returning the result of each (`Ok` for
    ///  loops that were awaited before).
    pub async fn shutdown(mut self) -> Vec<anyhow::Result<()>> {
        let mut results = Vec::new();
        for (node, handle) in self.nodes.iter().zip(self.recv_loops.iter_mut()) {
            let Some(mut handle) = handle.take() else {
                results.push(Ok(()));
                continue;
            };

            // a cancellation that is sent before the loop is listening has no effect, so keep
            //  sending until the loop is gone
            let result = loop {
                node.cancel_recv();
                if let Ok(result) = tokio::time::timeout(Duration::from_millis(10), &mut handle).await {
                    break result;
                }
            };
            results.push(match result {
                Ok(r) => r,
                Err(e) => Err(e.into()),
            });
        }
        debug!("test cluster shut down");
        results
    }
}
