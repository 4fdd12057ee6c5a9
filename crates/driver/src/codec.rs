//! Export/import codec (C7): a versioned, structured export payload plus an
//! optional symmetric encryption envelope around it, and the merge logic
//! used when importing a file into a live management-mode clone.
//!
//! The distilled spec describes the export payload as a positionally
//! indexed array (0..21) whose historical variants truncate at 10, 14, or
//! 18+ fields. Encoding that literally as a `Vec<serde_json::Value>` would
//! throw away the type safety the rest of this crate has; instead the
//! fields are named on one struct and the "truncation" behavior becomes
//! `Option<T>` fields that are simply absent in older files, which
//! `serde_json` already round-trips correctly (`#[serde(default)]`) without
//! bespoke positional-array bookkeeping.

use serde::{Deserialize, Serialize};

use shared::node::{
    decode_cred_child, decode_data_child, decode_parent, encode_cred_child, encode_data_child,
    encode_parent, Address, CredChildFields, Cpz, Ctr, DataChildFields, NodeCodecError,
    ParentFields,
};
use shared::protocol::NodeSizes;

use crate::error::{DriverError, DriverResult};
use crate::graph::{CredChildNode, DataChildNode, Graph, NodeAddr, NodeBody, NodeGraph, ParentNode};

/// One on-device node as carried by an export file: its raw byte layout
/// plus the 2-byte address tag it had (or, for a never-yet-written node
/// encountered mid-import, `Address::EMPTY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedNode {
    pub address: Address,
    pub data: Vec<u8>,
}

/// The 22 indexed fields of the export payload (§4.7/§6), named rather than
/// positional. Fields beyond the classic schema's 10 are `Option`; readers
/// that see `None` are looking at an older file and must not treat that as
/// malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPayload {
    /// Top-level version gating which of the optional fields below are
    /// meaningful: `>=1` classic (10 fields), `>=2` mini (14), `>=3` BLE (18+).
    pub schema_version: u32,

    // --- classic schema: indices 0-9, always present ---
    pub ctr: Ctr,
    pub cpz_ctr_list: Vec<(Cpz, Ctr)>,
    pub start_of_credentials: Address,
    pub start_of_data: Address,
    pub favorites: Vec<(Address, Address)>,
    pub service_nodes: Vec<ExportedNode>,
    pub service_child_nodes: Vec<ExportedNode>,
    #[serde(default)]
    pub data_service_nodes: Vec<ExportedNode>,
    #[serde(default)]
    pub data_child_nodes: Vec<ExportedNode>,
    pub bundle_version: u32,

    // --- mini schema: indices 10-13 ---
    #[serde(default)]
    pub firmware_version: Option<(u8, u8)>,
    #[serde(default)]
    pub memory_size: Option<u32>,
    #[serde(default)]
    pub keyboard_layout: Option<u8>,

    // --- BLE schema: indices 14-21. 17-21 are firmware-version-dependent
    // and were never resolved against real firmware headers for this
    // rewrite (see DESIGN.md); they round-trip opaquely instead of being
    // interpreted.
    #[serde(default)]
    pub user_language: Option<u8>,
    #[serde(default)]
    pub usb_keyboard_layout: Option<u8>,
    #[serde(default)]
    pub bt_keyboard_layout: Option<u8>,
    #[serde(default)]
    pub reserved_ble_fields: Vec<serde_json::Value>,
}

impl ExportPayload {
    pub fn is_classic(&self) -> bool {
        self.schema_version < 2
    }

    pub fn is_mini(&self) -> bool {
        self.schema_version == 2
    }

    pub fn is_ble(&self) -> bool {
        self.schema_version >= 3
    }
}

/// Builds an [`ExportPayload`] from a management-mode snapshot. Every node
/// reachable from either chain head is serialized; unreached (orphan) nodes
/// were already reaped by the integrity pass before this snapshot existed.
pub fn build_export_payload(snapshot: &NodeGraph, sizes: &NodeSizes, bundle_version: u32) -> ExportPayload {
    let graph = &snapshot.graph;

    let mut service_nodes = Vec::new();
    let mut service_child_nodes = Vec::new();
    for parent_id in graph.chain_iter(snapshot.cred_start) {
        service_nodes.push(export_node(graph, parent_id, sizes));
        if let Some(NodeBody::CredParent(p)) = graph.get(parent_id) {
            for child_id in graph.chain_iter(p.first_child) {
                service_child_nodes.push(export_node(graph, child_id, sizes));
            }
        }
    }

    let mut data_service_nodes = Vec::new();
    let mut data_child_nodes = Vec::new();
    for parent_id in graph.chain_iter(snapshot.data_start) {
        data_service_nodes.push(export_node(graph, parent_id, sizes));
        if let Some(NodeBody::DataParent(p)) = graph.get(parent_id) {
            for child_id in graph.chain_iter(p.first_child) {
                data_child_nodes.push(export_node(graph, child_id, sizes));
            }
        }
    }

    let favorites = snapshot
        .favorites
        .slots()
        .iter()
        .map(|s| (s.parent, s.child))
        .collect();

    ExportPayload {
        schema_version: 3,
        ctr: snapshot.ctr,
        cpz_ctr_list: snapshot.cpz_ctr_values.clone(),
        start_of_credentials: resolve(graph, snapshot.cred_start),
        start_of_data: resolve(graph, snapshot.data_start),
        favorites,
        service_nodes,
        service_child_nodes,
        data_service_nodes,
        data_child_nodes,
        bundle_version,
        firmware_version: None,
        memory_size: None,
        keyboard_layout: None,
        user_language: None,
        usb_keyboard_layout: None,
        bt_keyboard_layout: None,
        reserved_ble_fields: Vec::new(),
    }
}

fn resolve(graph: &Graph, id: Option<crate::graph::NodeId>) -> Address {
    match id.and_then(|id| graph.address_of(id)) {
        Some(NodeAddr::Real(a)) => a,
        _ => Address::EMPTY,
    }
}

fn export_node(graph: &Graph, id: crate::graph::NodeId, sizes: &NodeSizes) -> ExportedNode {
    let address = resolve(graph, Some(id));
    let data = match graph.get(id) {
        Some(NodeBody::CredParent(p)) | Some(NodeBody::DataParent(p)) => encode_parent(
            &ParentFields {
                service_name: p.service_name.clone(),
                prev: resolve(graph, p.prev),
                next: resolve(graph, p.next),
                first_child: resolve(graph, p.first_child),
            },
            sizes,
        ),
        Some(NodeBody::CredChild(c)) => encode_cred_child(
            &CredChildFields {
                login: c.login.clone(),
                password_enc: c.password_enc.clone(),
                description: c.description.clone(),
                prev: resolve(graph, c.prev),
                next: resolve(graph, c.next),
                date_created: c.date_created,
                date_used: c.date_used,
            },
            sizes,
        ),
        Some(NodeBody::DataChild(d)) => encode_data_child(
            &DataChildFields {
                seq: d.seq,
                next: resolve(graph, d.next),
                payload: d.payload.clone(),
            },
            sizes,
        ),
        None => Vec::new(),
    };
    ExportedNode { address, data }
}

/// Reconstructs a [`NodeGraph`] from an export payload, validating every
/// node's layout and cross-checking parent/child linkages within the file
/// before any of it is merged into a live clone.
pub fn payload_to_graph(
    payload: &ExportPayload,
    sizes: &NodeSizes,
    limits: &shared::protocol::Limits,
) -> DriverResult<NodeGraph> {
    let mut graph = NodeGraph::empty(limits);

    let mut by_address = std::collections::HashMap::new();

    for node in &payload.service_nodes {
        let fields = decode_parent(&node.data, sizes).map_err(malformed)?;
        let id = graph.graph.insert_virtual(NodeBody::CredParent(ParentNode {
            service_name: fields.service_name,
            prev: None,
            next: None,
            first_child: None,
        }));
        by_address.insert(node.address, id);
    }
    for node in &payload.service_child_nodes {
        let fields = decode_cred_child(&node.data, sizes).map_err(malformed)?;
        let id = graph.graph.insert_virtual(NodeBody::CredChild(CredChildNode {
            login: fields.login,
            password_enc: fields.password_enc,
            description: fields.description,
            prev: None,
            next: None,
            date_created: fields.date_created,
            date_used: fields.date_used,
        }));
        by_address.insert(node.address, id);
    }
    for node in &payload.data_service_nodes {
        let fields = decode_parent(&node.data, sizes).map_err(malformed)?;
        let id = graph.graph.insert_virtual(NodeBody::DataParent(ParentNode {
            service_name: fields.service_name,
            prev: None,
            next: None,
            first_child: None,
        }));
        by_address.insert(node.address, id);
    }
    for node in &payload.data_child_nodes {
        let fields = decode_data_child(&node.data, sizes).map_err(malformed)?;
        let id = graph.graph.insert_virtual(NodeBody::DataChild(DataChildNode {
            seq: fields.seq,
            next: None,
            payload: fields.payload,
        }));
        by_address.insert(node.address, id);
    }

    // Second pass: re-thread prev/next/first_child now that every node's id
    // is known, cross-checking that every referenced address was actually
    // present in the file (an unresolvable link is a malformed import, not
    // something to silently drop).
    enum Kind {
        Parent,
        CredChild,
        DataChild,
    }

    let relink = |node: &ExportedNode, kind: &Kind, sizes: &NodeSizes| -> DriverResult<(Option<Address>, Option<Address>, Option<Address>)> {
        match kind {
            Kind::Parent => {
                let f = decode_parent(&node.data, sizes).map_err(malformed)?;
                Ok((non_empty(f.prev), non_empty(f.next), non_empty(f.first_child)))
            }
            Kind::CredChild => {
                let f = decode_cred_child(&node.data, sizes).map_err(malformed)?;
                Ok((non_empty(f.prev), non_empty(f.next), None))
            }
            Kind::DataChild => {
                let f = decode_data_child(&node.data, sizes).map_err(malformed)?;
                Ok((None, non_empty(f.next), None))
            }
        }
    };

    for list in [&payload.service_nodes, &payload.data_service_nodes] {
        for node in list {
            let Some(&id) = by_address.get(&node.address) else { continue };
            let (prev, next, first_child) = relink(node, &Kind::Parent, sizes)?;
            let lookup = |a: Option<Address>| a.and_then(|a| by_address.get(&a).copied());
            if let Some(body) = graph.graph.get_mut(id) {
                body.set_prev(lookup(prev));
                body.set_next(lookup(next));
                body.set_first_child(lookup(first_child));
            }
            if prev.is_some() && lookup(prev).is_none() {
                return Err(malformed_detail("parent prev-link points outside the file"));
            }
            if next.is_some() && lookup(next).is_none() {
                return Err(malformed_detail("parent next-link points outside the file"));
            }
            if first_child.is_some() && lookup(first_child).is_none() {
                return Err(malformed_detail("parent first-child link points outside the file"));
            }
        }
    }
    for (list, kind) in [
        (&payload.service_child_nodes, Kind::CredChild),
        (&payload.data_child_nodes, Kind::DataChild),
    ] {
        for node in list {
            let Some(&id) = by_address.get(&node.address) else { continue };
            let is_cred = matches!(kind, Kind::CredChild);
            let (prev, next, _) = relink(node, &kind, sizes)?;
            let lookup = |a: Option<Address>| a.and_then(|a| by_address.get(&a).copied());
            if let Some(body) = graph.graph.get_mut(id) {
                body.set_prev(if is_cred { lookup(prev) } else { None });
                body.set_next(lookup(next));
            }
            if next.is_some() && lookup(next).is_none() {
                return Err(malformed_detail("child next-link points outside the file"));
            }
        }
    }

    graph.cred_start = by_address.get(&payload.start_of_credentials).copied();
    graph.data_start = by_address.get(&payload.start_of_data).copied();
    graph.ctr = payload.ctr;
    graph.cpz_ctr_values = payload.cpz_ctr_list.clone();
    for (i, (parent, child)) in payload.favorites.iter().enumerate() {
        graph.favorites.set(i, crate::graph::FavoriteSlot { parent: *parent, child: *child });
    }

    Ok(graph)
}

fn non_empty(a: Address) -> Option<Address> {
    if a.is_empty() {
        None
    } else {
        Some(a)
    }
}

fn malformed(e: NodeCodecError) -> DriverError {
    DriverError::ImportMalformed { detail: e.to_string() }
}

fn malformed_detail(detail: &str) -> DriverError {
    DriverError::ImportMalformed { detail: detail.to_string() }
}

/// Merges an imported graph into a live management-mode clone in place.
///
/// For each service present in both: children are merged login-by-login,
/// preferring whichever side's `date_used` is strictly newer (the node
/// layout carries no independent "modified at" field, so `date_used` is
/// the closest available proxy — see DESIGN.md). A login collision that
/// isn't clearly resolved by timestamp, and whose passwords differ, keeps
/// both: the imported entry is inserted under a suffixed login rather than
/// discarded. When `no_delete` is false, any service present in the clone
/// but absent from the imported file is removed outright.
pub fn merge_import(clone: &mut NodeGraph, imported: &NodeGraph, no_delete: bool) {
    let imported_services: Vec<crate::graph::NodeId> = clone_chain(&imported.graph, imported.cred_start);

    let mut seen_services = std::collections::HashSet::new();

    for imported_parent_id in imported_services {
        let Some(NodeBody::CredParent(imported_parent)) = imported.graph.get(imported_parent_id) else { continue };
        let service_name = imported_parent.service_name.clone();
        seen_services.insert(service_name.to_ascii_lowercase());

        let existing_parent_id = clone.graph.find_by_service(clone.cred_start, &service_name);
        let parent_id = match existing_parent_id {
            Some(id) => id,
            None => {
                let id = clone.graph.insert_virtual(NodeBody::CredParent(ParentNode {
                    service_name: service_name.clone(),
                    prev: None,
                    next: None,
                    first_child: None,
                }));
                clone.cred_start = Some(clone.graph.insert_parent_sorted(clone.cred_start, id));
                id
            }
        };

        let imported_children = clone_chain(&imported.graph, imported_parent.first_child);
        for imported_child_id in imported_children {
            let Some(NodeBody::CredChild(imported_child)) = imported.graph.get(imported_child_id) else { continue };
            merge_one_child(clone, parent_id, imported_child);
        }
    }

    if !no_delete {
        let current_parents: Vec<crate::graph::NodeId> = clone_chain(&clone.graph, clone.cred_start);
        for parent_id in current_parents {
            let Some(NodeBody::CredParent(p)) = clone.graph.get(parent_id) else { continue };
            if !seen_services.contains(&p.service_name.to_ascii_lowercase()) {
                let first_child = p.first_child;
                for child_id in clone_chain(&clone.graph, first_child) {
                    clone.favorites.clear_references_to(resolve(&clone.graph, Some(child_id)));
                    clone.graph.remove(child_id);
                }
                clone.cred_start = clone.graph.unlink_parent(clone.cred_start, parent_id);
                clone.graph.remove(parent_id);
            }
        }
    }

    merge_data_chain(clone, imported, no_delete);
}

/// Data children carry no changed-timestamp (unlike credential children), so
/// there is nothing to compare dates against: a service present in both
/// graphs has the imported blob replace the clone's wholesale.
fn merge_data_chain(clone: &mut NodeGraph, imported: &NodeGraph, no_delete: bool) {
    let imported_services: Vec<crate::graph::NodeId> = clone_chain(&imported.graph, imported.data_start);
    let mut seen_services = std::collections::HashSet::new();

    for imported_parent_id in imported_services {
        let Some(NodeBody::DataParent(imported_parent)) = imported.graph.get(imported_parent_id) else { continue };
        let service_name = imported_parent.service_name.clone();
        seen_services.insert(service_name.to_ascii_lowercase());

        let parent_id = match clone.graph.find_by_service(clone.data_start, &service_name) {
            Some(id) => {
                let old_first_child = clone.graph.get(id).and_then(NodeBody::first_child);
                for child_id in clone_chain(&clone.graph, old_first_child) {
                    clone.favorites.clear_references_to(resolve(&clone.graph, Some(child_id)));
                    clone.graph.remove(child_id);
                }
                if let Some(body) = clone.graph.get_mut(id) {
                    body.set_first_child(None);
                }
                id
            }
            None => {
                let id = clone.graph.insert_virtual(NodeBody::DataParent(ParentNode {
                    service_name: service_name.clone(),
                    prev: None,
                    next: None,
                    first_child: None,
                }));
                clone.data_start = Some(clone.graph.insert_parent_sorted(clone.data_start, id));
                id
            }
        };

        for imported_child_id in clone_chain(&imported.graph, imported_parent.first_child) {
            let Some(NodeBody::DataChild(imported_child)) = imported.graph.get(imported_child_id) else { continue };
            let id = clone.graph.insert_virtual(NodeBody::DataChild(imported_child.clone()));
            attach_child(clone, parent_id, id);
        }
    }

    if !no_delete {
        let current_parents: Vec<crate::graph::NodeId> = clone_chain(&clone.graph, clone.data_start);
        for parent_id in current_parents {
            let Some(NodeBody::DataParent(p)) = clone.graph.get(parent_id) else { continue };
            if !seen_services.contains(&p.service_name.to_ascii_lowercase()) {
                let first_child = p.first_child;
                for child_id in clone_chain(&clone.graph, first_child) {
                    clone.favorites.clear_references_to(resolve(&clone.graph, Some(child_id)));
                    clone.graph.remove(child_id);
                }
                clone.data_start = clone.graph.unlink_parent(clone.data_start, parent_id);
                clone.graph.remove(parent_id);
            }
        }
    }
}

fn merge_one_child(clone: &mut NodeGraph, parent_id: crate::graph::NodeId, imported_child: &CredChildNode) {
    let existing_child_id = clone.graph.find_child_by_login_under(parent_id, &imported_child.login);

    match existing_child_id {
        None => {
            let id = clone.graph.insert_virtual(NodeBody::CredChild(imported_child.clone()));
            attach_child(clone, parent_id, id);
        }
        Some(existing_id) => {
            let Some(NodeBody::CredChild(existing)) = clone.graph.get(existing_id) else { return };
            let existing = existing.clone();
            if imported_child.date_used > existing.date_used {
                if let Some(NodeBody::CredChild(c)) = clone.graph.get_mut(existing_id) {
                    c.password_enc = imported_child.password_enc.clone();
                    c.description = imported_child.description.clone();
                    c.date_created = imported_child.date_created;
                    c.date_used = imported_child.date_used;
                }
            } else if existing.password_enc != imported_child.password_enc {
                let mut suffix = 2u32;
                let mut candidate_login = format!("{} ({suffix})", imported_child.login);
                while clone.graph.find_child_by_login_under(parent_id, &candidate_login).is_some() {
                    suffix += 1;
                    candidate_login = format!("{} ({suffix})", imported_child.login);
                }
                let mut suffixed = imported_child.clone();
                suffixed.login = candidate_login;
                let id = clone.graph.insert_virtual(NodeBody::CredChild(suffixed));
                attach_child(clone, parent_id, id);
            }
            // Identical passwords and an older/equal timestamp: nothing to do.
        }
    }
}

pub(crate) fn attach_child(clone: &mut NodeGraph, parent_id: crate::graph::NodeId, child_id: crate::graph::NodeId) {
    let first_child = clone.graph.get(parent_id).and_then(NodeBody::first_child);
    if let Some(body) = clone.graph.get_mut(child_id) {
        body.set_next(first_child);
        body.set_prev(None);
    }
    if let Some(next) = first_child {
        if let Some(body) = clone.graph.get_mut(next) {
            body.set_prev(Some(child_id));
        }
    }
    if let Some(body) = clone.graph.get_mut(parent_id) {
        body.set_first_child(Some(child_id));
    }
}

fn clone_chain(graph: &Graph, head: Option<crate::graph::NodeId>) -> Vec<crate::graph::NodeId> {
    graph.chain_iter(head).collect()
}

// --- encryption envelope -----------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyDerivation {
    /// The derivation every current export uses.
    Current,
    /// An older derivation kept only so imports of files written by earlier
    /// driver versions still decrypt.
    Old,
}

fn derive_seed(encryption_name: &str, derivation: KeyDerivation) -> u64 {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    match derivation {
        KeyDerivation::Current => {
            hasher.update(b"mmm-export-v2:");
            hasher.update(encryption_name.as_bytes());
        }
        KeyDerivation::Old => {
            hasher.update(encryption_name.as_bytes());
            hasher.update(b":legacy-v1");
        }
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[0..8].try_into().expect("sha256 digest is 32 bytes"))
}

fn stretch_key(seed: u64) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.finalize().into()
}

const NONCE_LEN: usize = 12;

fn encrypt_bytes(plaintext: &[u8], key_bytes: &[u8; 32]) -> DriverResult<Vec<u8>> {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Key, Nonce};
    use rand::RngCore;

    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| DriverError::CryptoFailure)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_bytes(sealed: &[u8], key_bytes: &[u8; 32]) -> DriverResult<Vec<u8>> {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Key, Nonce};

    if sealed.len() < NONCE_LEN {
        return Err(DriverError::CryptoFailure);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| DriverError::CryptoFailure)
}

/// Encodes a payload to its final export-file bytes: `"none"` skips
/// encryption entirely (the file is plain JSON); any other name wraps the
/// JSON in the AES-256-GCM envelope, base64-encoded so the result is
/// text-safe to hand to the (out-of-scope) GUI's file-save dialog.
pub fn encode_export_file(payload: &ExportPayload, encryption_name: &str) -> DriverResult<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    if encryption_name == "none" {
        return Ok(json);
    }
    let key = stretch_key(derive_seed(encryption_name, KeyDerivation::Current));
    let sealed = encrypt_bytes(&json, &key)?;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    Ok(STANDARD.encode(sealed).into_bytes())
}

/// Decodes export-file bytes, trying the current key derivation first and
/// falling back to the historical one (§4.7: "decoders MUST try both on
/// import").
pub fn decode_export_file(bytes: &[u8], encryption_name: &str) -> DriverResult<ExportPayload> {
    if encryption_name == "none" {
        return serde_json::from_slice(bytes).map_err(DriverError::from);
    }
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let sealed = STANDARD
        .decode(bytes)
        .map_err(|_| DriverError::CryptoFailure)?;

    for derivation in [KeyDerivation::Current, KeyDerivation::Old] {
        let key = stretch_key(derive_seed(encryption_name, derivation));
        if let Ok(json) = decrypt_bytes(&sealed, &key) {
            if let Ok(payload) = serde_json::from_slice(&json) {
                return Ok(payload);
            }
        }
    }
    Err(DriverError::CryptoFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FavoriteSlot, Favorites};
    use shared::node::{Address, Ctr};
    use shared::protocol::{Limits, NodeSizes};

    fn sample_graph() -> NodeGraph {
        let limits = Limits::classic();
        let sizes = NodeSizes::classic();
        let mut g = NodeGraph::empty(&limits);
        let parent_id = g.graph.insert_real(
            Address::new(1, 0),
            NodeBody::CredParent(ParentNode {
                service_name: "github.com".into(),
                prev: None,
                next: None,
                first_child: None,
            }),
        );
        let child_id = g.graph.insert_real(
            Address::new(1, 1),
            NodeBody::CredChild(CredChildNode {
                login: "alice".into(),
                password_enc: vec![0xAB; sizes.pwd_enc_len],
                description: String::new(),
                prev: None,
                next: None,
                date_created: 0,
                date_used: 0,
            }),
        );
        g.graph.get_mut(parent_id).unwrap().set_first_child(Some(child_id));
        g.cred_start = Some(parent_id);
        g.favorites = Favorites::new(&limits);
        g.favorites.set(0, FavoriteSlot { parent: Address::new(1, 0), child: Address::new(1, 1) });
        g.ctr = Ctr::from_bytes([0, 0, 1]);
        g
    }

    #[test]
    fn export_then_reimport_restores_node_payload_bytes() {
        let sizes = NodeSizes::classic();
        let limits = Limits::classic();
        let original = sample_graph();
        let payload = build_export_payload(&original, &sizes, 1);
        assert_eq!(payload.service_nodes.len(), 1);
        assert_eq!(payload.service_child_nodes.len(), 1);

        let reimported = payload_to_graph(&payload, &sizes, &limits).unwrap();
        let parent_id = reimported.graph.find_by_service(reimported.cred_start, "github.com").unwrap();
        let child_id = reimported
            .graph
            .find_child_by_login_under(parent_id, "alice")
            .unwrap();
        match reimported.graph.get(child_id) {
            Some(NodeBody::CredChild(c)) => assert_eq!(c.password_enc, vec![0xAB; sizes.pwd_enc_len]),
            other => panic!("expected cred child, got {other:?}"),
        }
    }

    #[test]
    fn encrypted_round_trip_with_current_derivation() {
        let sizes = NodeSizes::classic();
        let payload = build_export_payload(&sample_graph(), &sizes, 1);
        let file = encode_export_file(&payload, "my-passphrase").unwrap();
        let decoded = decode_export_file(&file, "my-passphrase").unwrap();
        assert_eq!(decoded.service_nodes.len(), payload.service_nodes.len());
    }

    #[test]
    fn old_derivation_still_decrypts() {
        let sizes = NodeSizes::classic();
        let payload = build_export_payload(&sample_graph(), &sizes, 1);
        let json = serde_json::to_vec(&payload).unwrap();
        let key = stretch_key(derive_seed("legacy-name", KeyDerivation::Old));
        let sealed = encrypt_bytes(&json, &key).unwrap();
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let file = STANDARD.encode(sealed).into_bytes();

        let decoded = decode_export_file(&file, "legacy-name").unwrap();
        assert_eq!(decoded.service_nodes.len(), payload.service_nodes.len());
    }

    #[test]
    fn plaintext_export_round_trips_with_no_encryption() {
        let sizes = NodeSizes::classic();
        let payload = build_export_payload(&sample_graph(), &sizes, 1);
        let file = encode_export_file(&payload, "none").unwrap();
        let decoded = decode_export_file(&file, "none").unwrap();
        assert_eq!(decoded.bundle_version, 1);
    }

    #[test]
    fn merge_prefers_newer_file_node_over_clone_node() {
        let limits = Limits::classic();
        let sizes = NodeSizes::classic();
        let mut clone = sample_graph();

        let mut imported = NodeGraph::empty(&limits);
        let p = imported.graph.insert_virtual(NodeBody::CredParent(ParentNode {
            service_name: "github.com".into(),
            prev: None,
            next: None,
            first_child: None,
        }));
        let c = imported.graph.insert_virtual(NodeBody::CredChild(CredChildNode {
            login: "alice".into(),
            password_enc: vec![0xCD; sizes.pwd_enc_len],
            description: "updated".into(),
            prev: None,
            next: None,
            date_created: 0,
            date_used: 9999,
        }));
        imported.graph.get_mut(p).unwrap().set_first_child(Some(c));
        imported.cred_start = Some(p);

        merge_import(&mut clone, &imported, true);

        let parent_id = clone.graph.find_by_service(clone.cred_start, "github.com").unwrap();
        let child_id = clone.graph.find_child_by_login_under(parent_id, "alice").unwrap();
        match clone.graph.get(child_id) {
            Some(NodeBody::CredChild(c)) => assert_eq!(c.password_enc, vec![0xCD; sizes.pwd_enc_len]),
            other => panic!("expected cred child, got {other:?}"),
        }
    }

    #[test]
    fn merge_keeps_both_logins_when_passwords_differ_and_file_is_not_newer() {
        let limits = Limits::classic();
        let sizes = NodeSizes::classic();
        let mut clone = sample_graph();

        let mut imported = NodeGraph::empty(&limits);
        let p = imported.graph.insert_virtual(NodeBody::CredParent(ParentNode {
            service_name: "github.com".into(),
            prev: None,
            next: None,
            first_child: None,
        }));
        let c = imported.graph.insert_virtual(NodeBody::CredChild(CredChildNode {
            login: "alice".into(),
            password_enc: vec![0xEE; sizes.pwd_enc_len],
            description: String::new(),
            prev: None,
            next: None,
            date_created: 0,
            date_used: 0,
        }));
        imported.graph.get_mut(p).unwrap().set_first_child(Some(c));
        imported.cred_start = Some(p);

        merge_import(&mut clone, &imported, true);

        let parent_id = clone.graph.find_by_service(clone.cred_start, "github.com").unwrap();
        assert!(clone.graph.find_child_by_login_under(parent_id, "alice").is_some());
        assert!(clone.graph.find_child_by_login_under(parent_id, "alice (2)").is_some());
    }

    #[test]
    fn merge_with_no_delete_false_removes_services_absent_from_file() {
        let limits = Limits::classic();
        let mut clone = sample_graph();
        let imported = NodeGraph::empty(&limits);

        merge_import(&mut clone, &imported, false);

        assert!(clone.graph.find_by_service(clone.cred_start, "github.com").is_none());
    }
}
