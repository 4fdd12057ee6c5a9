//! Node graph model (C5): arena-backed credential/data node storage plus
//! the small amount of device-wide state (counter, CPZ/CTR list, favorites)
//! that management mode reads, edits, and writes back as one unit.

pub mod arena;
pub mod favorites;

pub use arena::{ascii_ci_cmp, ChainIter, CredChildNode, DataChildNode, Graph, NodeAddr, NodeBody, NodeId, ParentNode};
pub use favorites::{FavoriteSlot, Favorites};

use shared::node::{Cpz, Ctr};
use shared::protocol::Limits;

/// Everything the management-mode engine treats as one authoritative
/// snapshot; deep-cloned wholesale at the start of a session (see C6 phase
/// "Clone") and either replaces the authoritative copy on commit or is
/// discarded on cancellation/abort.
#[derive(Clone)]
pub struct NodeGraph {
    pub graph: Graph,
    pub cred_start: Option<NodeId>,
    pub data_start: Option<NodeId>,
    pub favorites: Favorites,
    pub ctr: Ctr,
    pub cpz_ctr_values: Vec<(Cpz, Ctr)>,
    pub credentials_change_number: u32,
    pub data_change_number: u32,
}

impl NodeGraph {
    pub fn empty(limits: &Limits) -> Self {
        Self {
            graph: Graph::new(),
            cred_start: None,
            data_start: None,
            favorites: Favorites::new(limits),
            ctr: Ctr::ZERO,
            cpz_ctr_values: Vec::new(),
            credentials_change_number: 0,
            data_change_number: 0,
        }
    }

    /// Deep copy used by the management-mode engine's clone phase. Since
    /// every field here is owned data (no borrowed references into the
    /// authoritative copy survive into the clone), a plain `.clone()` is
    /// already a full deep copy.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_clone_is_independent_of_the_original() {
        let limits = Limits::classic();
        let mut original = NodeGraph::empty(&limits);
        let parent_id = original.graph.insert_virtual(NodeBody::CredParent(ParentNode {
            service_name: "example.com".into(),
            prev: None,
            next: None,
            first_child: None,
        }));
        original.cred_start = Some(parent_id);

        let mut clone = original.deep_clone();
        clone.graph.get_mut(parent_id).unwrap().set_first_child(None);
        if let Some(NodeBody::CredParent(p)) = clone.graph.get_mut(parent_id) {
            p.service_name = "changed.example".into();
        }

        assert_eq!(
            original.graph.get(parent_id).unwrap().service_name(),
            Some("example.com")
        );
    }
}
