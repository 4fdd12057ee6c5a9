//! Node graph arena (C5): an index-based replacement for the source's
//! cyclic `prev`/`next`/`first_child` pointers. Live links are `NodeId`s;
//! a node only gets a real on-device [`Address`] once it has been written,
//! which is what lets the allocate phase hand a virtual node a real address
//! without rewriting every other node's links.

use std::cmp::Ordering;
use std::collections::HashMap;

use shared::node::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAddr {
    Real(Address),
    /// Pre-allocation placeholder assigned during an import/edit, swapped
    /// for a real address in the management-mode engine's allocate phase.
    Virtual(u32),
}

#[derive(Debug, Clone)]
pub struct ParentNode {
    pub service_name: String,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub first_child: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct CredChildNode {
    pub login: String,
    pub password_enc: Vec<u8>,
    pub description: String,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub date_created: u16,
    pub date_used: u16,
}

#[derive(Debug, Clone)]
pub struct DataChildNode {
    pub seq: u16,
    pub next: Option<NodeId>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum NodeBody {
    CredParent(ParentNode),
    DataParent(ParentNode),
    CredChild(CredChildNode),
    DataChild(DataChildNode),
}

impl NodeBody {
    pub fn is_parent(&self) -> bool {
        matches!(self, NodeBody::CredParent(_) | NodeBody::DataParent(_))
    }

    pub fn service_name(&self) -> Option<&str> {
        match self {
            NodeBody::CredParent(p) | NodeBody::DataParent(p) => Some(&p.service_name),
            _ => None,
        }
    }

    pub fn prev(&self) -> Option<NodeId> {
        match self {
            NodeBody::CredParent(p) | NodeBody::DataParent(p) => p.prev,
            NodeBody::CredChild(c) => c.prev,
            NodeBody::DataChild(_) => None,
        }
    }

    pub fn next(&self) -> Option<NodeId> {
        match self {
            NodeBody::CredParent(p) | NodeBody::DataParent(p) => p.next,
            NodeBody::CredChild(c) => c.next,
            NodeBody::DataChild(d) => d.next,
        }
    }

    pub fn set_prev(&mut self, id: Option<NodeId>) {
        match self {
            NodeBody::CredParent(p) | NodeBody::DataParent(p) => p.prev = id,
            NodeBody::CredChild(c) => c.prev = id,
            NodeBody::DataChild(_) => {}
        }
    }

    pub fn set_next(&mut self, id: Option<NodeId>) {
        match self {
            NodeBody::CredParent(p) | NodeBody::DataParent(p) => p.next = id,
            NodeBody::CredChild(c) => c.next = id,
            NodeBody::DataChild(d) => d.next = id,
        }
    }

    pub fn first_child(&self) -> Option<NodeId> {
        match self {
            NodeBody::CredParent(p) | NodeBody::DataParent(p) => p.first_child,
            _ => None,
        }
    }

    pub fn set_first_child(&mut self, id: Option<NodeId>) {
        if let NodeBody::CredParent(p) | NodeBody::DataParent(p) = self {
            p.first_child = id;
        }
    }

    pub fn login(&self) -> Option<&str> {
        match self {
            NodeBody::CredChild(c) => Some(&c.login),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct Entry {
    addr: NodeAddr,
    body: NodeBody,
    tagged: bool,
}

/// ASCII case-insensitive, locale-independent comparison for service names.
pub fn ascii_ci_cmp(a: &str, b: &str) -> Ordering {
    a.chars()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.chars().map(|c| c.to_ascii_lowercase()))
}

#[derive(Default, Clone)]
pub struct Graph {
    entries: Vec<Option<Entry>>,
    by_address: HashMap<Address, NodeId>,
    by_virtual: HashMap<u32, NodeId>,
    free_slots: Vec<NodeId>,
    next_virtual: u32,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_slot(&mut self, addr: NodeAddr, body: NodeBody) -> NodeId {
        let entry = Entry {
            addr,
            body,
            tagged: false,
        };
        if let Some(id) = self.free_slots.pop() {
            self.entries[id.0 as usize] = Some(entry);
            id
        } else {
            let id = NodeId(self.entries.len() as u32);
            self.entries.push(Some(entry));
            id
        }
    }

    pub fn insert_real(&mut self, address: Address, body: NodeBody) -> NodeId {
        let id = self.alloc_slot(NodeAddr::Real(address), body);
        self.by_address.insert(address, id);
        id
    }

    pub fn insert_virtual(&mut self, body: NodeBody) -> NodeId {
        let virt = self.next_virtual;
        self.next_virtual += 1;
        let id = self.alloc_slot(NodeAddr::Virtual(virt), body);
        self.by_virtual.insert(virt, id);
        id
    }

    /// Assigns a freshly allocated real device address to a virtual node,
    /// called from the management-mode engine's allocate phase.
    pub fn promote_to_real(&mut self, id: NodeId, address: Address) {
        if let Some(Some(entry)) = self.entries.get_mut(id.0 as usize) {
            if let NodeAddr::Virtual(v) = entry.addr {
                self.by_virtual.remove(&v);
            }
            entry.addr = NodeAddr::Real(address);
            self.by_address.insert(address, id);
        }
    }

    pub fn address_of(&self, id: NodeId) -> Option<NodeAddr> {
        self.entries.get(id.0 as usize)?.as_ref().map(|e| e.addr)
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeBody> {
        self.entries.get(id.0 as usize)?.as_ref().map(|e| &e.body)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeBody> {
        self.entries.get_mut(id.0 as usize)?.as_mut().map(|e| &mut e.body)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<NodeBody> {
        let entry = self.entries.get_mut(id.0 as usize)?.take()?;
        match entry.addr {
            NodeAddr::Real(a) => {
                self.by_address.remove(&a);
            }
            NodeAddr::Virtual(v) => {
                self.by_virtual.remove(&v);
            }
        }
        self.free_slots.push(id);
        Some(entry.body)
    }

    pub fn find_by_address(&self, address: Address) -> Option<NodeId> {
        self.by_address.get(&address).copied()
    }

    pub fn find_by_virtual(&self, virt: u32) -> Option<NodeId> {
        self.by_virtual.get(&virt).copied()
    }

    /// Finds a parent node by exact (case-insensitive) service name,
    /// starting from `chain_head` and following `next` links.
    pub fn find_by_service(&self, chain_head: Option<NodeId>, service: &str) -> Option<NodeId> {
        self.chain_iter(chain_head)
            .find(|&id| self.get(id).and_then(NodeBody::service_name).is_some_and(|n| ascii_ci_cmp(n, service) == Ordering::Equal))
    }

    /// Walks `parent`'s child chain looking for an exact login match.
    pub fn find_child_by_login_under(&self, parent: NodeId, login: &str) -> Option<NodeId> {
        let first = self.get(parent).and_then(NodeBody::first_child)?;
        self.chain_iter(Some(first)).find(|&id| self.get(id).and_then(NodeBody::login) == Some(login))
    }

    /// Iterates a singly-forward chain of `next` links starting at `head`.
    pub fn chain_iter(&self, head: Option<NodeId>) -> ChainIter<'_> {
        ChainIter {
            graph: self,
            current: head,
        }
    }

    /// Inserts `new_id` into the parent chain rooted at `chain_head`,
    /// keeping the chain ordered by ASCII case-insensitive service name.
    /// Returns the (possibly new) chain head.
    pub fn insert_parent_sorted(&mut self, chain_head: Option<NodeId>, new_id: NodeId) -> NodeId {
        let new_name = self
            .get(new_id)
            .and_then(NodeBody::service_name)
            .unwrap_or_default()
            .to_string();

        let Some(head) = chain_head else {
            return new_id;
        };

        let head_name = self.get(head).and_then(NodeBody::service_name).unwrap_or_default().to_string();
        if ascii_ci_cmp(&new_name, &head_name) == Ordering::Less {
            self.link_before(head, new_id);
            return new_id;
        }

        let mut cursor = head;
        loop {
            match self.get(cursor).and_then(NodeBody::next) {
                Some(next_id) => {
                    let next_name = self.get(next_id).and_then(NodeBody::service_name).unwrap_or_default().to_string();
                    if ascii_ci_cmp(&new_name, &next_name) == Ordering::Less {
                        self.link_between(cursor, new_id, next_id);
                        return head;
                    }
                    cursor = next_id;
                }
                None => {
                    self.link_after(cursor, new_id);
                    return head;
                }
            }
        }
    }

    fn link_before(&mut self, existing: NodeId, new_id: NodeId) {
        if let Some(body) = self.get_mut(new_id) {
            body.set_next(Some(existing));
            body.set_prev(None);
        }
        if let Some(body) = self.get_mut(existing) {
            body.set_prev(Some(new_id));
        }
    }

    fn link_after(&mut self, existing: NodeId, new_id: NodeId) {
        if let Some(body) = self.get_mut(new_id) {
            body.set_prev(Some(existing));
            body.set_next(None);
        }
        if let Some(body) = self.get_mut(existing) {
            body.set_next(Some(new_id));
        }
    }

    fn link_between(&mut self, before: NodeId, new_id: NodeId, after: NodeId) {
        if let Some(body) = self.get_mut(new_id) {
            body.set_prev(Some(before));
            body.set_next(Some(after));
        }
        if let Some(body) = self.get_mut(before) {
            body.set_next(Some(new_id));
        }
        if let Some(body) = self.get_mut(after) {
            body.set_prev(Some(new_id));
        }
    }

    /// Removes `child` from `parent`'s child chain, patching the
    /// surrounding links and `first_child` if needed.
    pub fn unlink_child(&mut self, parent: NodeId, child: NodeId) {
        let (prev, next) = self
            .get(child)
            .map(|b| (b.prev(), b.next()))
            .unwrap_or((None, None));

        match prev {
            Some(p) => {
                if let Some(body) = self.get_mut(p) {
                    body.set_next(next);
                }
            }
            None => {
                if let Some(body) = self.get_mut(parent) {
                    body.set_first_child(next);
                }
            }
        }
        if let Some(n) = next {
            if let Some(body) = self.get_mut(n) {
                body.set_prev(prev);
            }
        }
    }

    /// Removes `parent` from its chain, returning the new chain head.
    pub fn unlink_parent(&mut self, chain_head: Option<NodeId>, parent: NodeId) -> Option<NodeId> {
        let (prev, next) = self
            .get(parent)
            .map(|b| (b.prev(), b.next()))
            .unwrap_or((None, None));

        if let Some(p) = prev {
            if let Some(body) = self.get_mut(p) {
                body.set_next(next);
            }
        }
        if let Some(n) = next {
            if let Some(body) = self.get_mut(n) {
                body.set_prev(prev);
            }
        }

        match chain_head {
            Some(h) if h == parent => next,
            other => other,
        }
    }

    /// Marks every node reachable from `chain_head` (parents via `next`,
    /// each parent's children via its own `next` chain) as tagged.
    pub fn tag_pointed(&mut self, chain_head: Option<NodeId>) {
        let parents: Vec<NodeId> = self.chain_iter(chain_head).collect();
        for parent in parents {
            if let Some(Some(entry)) = self.entries.get_mut(parent.0 as usize) {
                entry.tagged = true;
            }
            let first_child = self.get(parent).and_then(NodeBody::first_child);
            let children: Vec<NodeId> = self.chain_iter(first_child).collect();
            for child in children {
                if let Some(Some(entry)) = self.entries.get_mut(child.0 as usize) {
                    entry.tagged = true;
                }
            }
        }
    }

    pub fn is_tagged(&self, id: NodeId) -> bool {
        self.entries
            .get(id.0 as usize)
            .and_then(|e| e.as_ref())
            .is_some_and(|e| e.tagged)
    }

    pub fn clear_tags(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.tagged = false;
        }
    }

    /// All allocated node ids, in arena order (untagged-orphan sweeps use
    /// this to find nodes `tag_pointed` never reached).
    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| NodeId(i as u32)))
    }
}

pub struct ChainIter<'g> {
    graph: &'g Graph,
    current: Option<NodeId>,
}

impl Iterator for ChainIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.current?;
        self.current = self.graph.get(id).and_then(NodeBody::next);
        Some(id)
    }
}
