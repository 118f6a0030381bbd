use anyhow::bail;

use crate::messaging::message::PeerId;


/// The static parent / children tree that reductions and barriers run along. It is fixed for the
///  lifetime of a run, and the order of `children` defines the order in which their
///  contributions are folded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Topology {
    myself: PeerId,
    parent: Option<PeerId>,
    children: Vec<PeerId>,
}

impl Topology {
    pub fn new(myself: PeerId, parent: Option<PeerId>, children: Vec<PeerId>) -> anyhow::Result<Topology> {
        if parent == Some(myself) || children.contains(&myself) {
            bail!("{:?} can not be its own parent or child", myself);
        }
        for (i, child) in children.iter().enumerate() {
            if children[..i].contains(child) {
                bail!("{:?} is listed as a child of {:?} more than once", child, myself);
            }
            if Some(*child) == parent {
                bail!("{:?} is both parent and child of {:?}", child, myself);
            }
        }

        Ok(Topology {
            myself,
            parent,
            children,
        })
    }

    /// A process without parent or children, i.e. the only process of a 'cluster'
    pub fn single() -> Topology {
        Topology {
            myself: PeerId(0),
            parent: None,
            children: Vec::new(),
        }
    }

    /// The heap-ordered tree of `num_peers` processes where each process has up to `arity`
    ///  children: process `0` is the root, the parent of `r` is `(r-1) / arity`, and the children
    ///  of `r` are `r*arity + 1 ..= r*arity + arity`.
    pub fn k_ary_tree(myself: PeerId, num_peers: usize, arity: usize) -> anyhow::Result<Topology> {
        if arity == 0 {
            bail!("tree arity must be at least 1");
        }
        let rank = myself.index();
        if rank >= num_peers {
            bail!("{:?} is not part of a cluster of {} processes", myself, num_peers);
        }

        let parent = match rank {
            0 => None,
            r => Some(PeerId::from((r - 1) / arity)),
        };
        let children = (rank*arity + 1 ..= rank*arity + arity)
            .take_while(|&c| c < num_peers)
            .map(PeerId::from)
            .collect();

        Ok(Topology {
            myself,
            parent,
            children,
        })
    }

    pub fn myself(&self) -> PeerId {
        self.myself
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// `None` for the root
    pub fn parent(&self) -> Option<PeerId> {
        self.parent
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn child(&self, i: usize) -> PeerId {
        self.children[i]
    }

    pub fn children(&self) -> &[PeerId] {
        &self.children
    }

    /// the position of a peer in the list of children, or `None` if it is not a child
    pub fn child_index(&self, peer: PeerId) -> Option<usize> {
        self.children.iter()
            .position(|&c| c == peer)
    }
}
