//! File-size cache mirror (C8): a host-side mirror of the device's file
//! listing (name -> size in bytes), refreshed from `GetFilesList` rather
//! than trusted blindly, with a `tokio::sync::watch` channel so callers can
//! wait for the next refresh instead of polling.

use std::collections::BTreeMap;

use tokio::sync::watch;

use crate::dispatcher::DispatcherHandle;
use crate::error::DriverResult;
use shared::protocol::Command;

/// Device-side file names are null-terminated in a fixed buffer on the
/// wire; this is the longest name this driver will accept without
/// truncating (a driver convention, not a documented device limit).
pub const MAX_FILENAME_LEN: usize = 64;

fn validate_name(name: &str) -> DriverResult<()> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN || name.contains('\0') {
        return Err(crate::error::DriverError::protocol(format!(
            "invalid file name for cache mirror: {name:?}"
        )));
    }
    Ok(())
}

/// In-memory mirror of the device's file listing.
///
/// `in_sync` tracks whether the mirror is known to match the device: it
/// starts false, becomes true after a successful [`FilesCache::refresh`],
/// and is cleared again by any local mutation that hasn't yet been
/// confirmed on the wire (mirroring the node graph's authoritative/clone
/// split at a much smaller scale).
#[derive(Debug)]
pub struct FilesCache {
    entries: BTreeMap<String, u64>,
    in_sync: bool,
    changed: watch::Sender<()>,
}

impl FilesCache {
    pub fn new() -> Self {
        let (changed, _rx) = watch::channel(());
        Self {
            entries: BTreeMap::new(),
            in_sync: false,
            changed,
        }
    }

    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribes to change notifications; the receiver fires once per
    /// `add`/`update`/`remove`/`refresh` call that actually changes state.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.changed.subscribe()
    }

    fn notify(&mut self) {
        let _ = self.changed.send(());
    }

    pub fn add(&mut self, name: &str, size: u64) -> DriverResult<()> {
        validate_name(name)?;
        self.entries.insert(name.to_string(), size);
        self.in_sync = false;
        self.notify();
        Ok(())
    }

    pub fn update(&mut self, name: &str, size: u64) -> DriverResult<()> {
        validate_name(name)?;
        if let Some(existing) = self.entries.get_mut(name) {
            *existing = size;
            self.in_sync = false;
            self.notify();
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        if self.entries.remove(name).is_some() {
            self.in_sync = false;
            self.notify();
        }
    }

    pub fn mark_out_of_sync(&mut self) {
        self.in_sync = false;
    }

    /// Replaces the mirror wholesale with a listing just read from the
    /// device, marking it in sync.
    fn replace_all(&mut self, entries: BTreeMap<String, u64>) {
        self.entries = entries;
        self.in_sync = true;
        self.notify();
    }

    /// Issues `GetFilesList` and rebuilds the mirror from the reply.
    ///
    /// Wire format (a driver convention; no firmware header documented one):
    /// a repeated sequence of `[name_len:1][name bytes][size:4 LE]` records,
    /// terminated by a zero `name_len`.
    pub async fn refresh(&mut self, dispatcher: &DispatcherHandle) -> DriverResult<()> {
        let (_command, payload) = dispatcher.send(Command::GetFilesList, Vec::new()).await?;
        let mut entries = BTreeMap::new();
        let mut cursor = 0usize;
        while cursor < payload.len() {
            let name_len = payload[cursor] as usize;
            if name_len == 0 {
                break;
            }
            cursor += 1;
            if cursor + name_len + 4 > payload.len() {
                return Err(crate::error::DriverError::ProtocolViolation {
                    detail: format!(
                        "GetFilesList record truncated: expected {} more bytes, got {}",
                        name_len + 4,
                        payload.len().saturating_sub(cursor)
                    ),
                });
            }
            let name = String::from_utf8_lossy(&payload[cursor..cursor + name_len]).into_owned();
            cursor += name_len;
            let size = u32::from_le_bytes(payload[cursor..cursor + 4].try_into().unwrap()) as u64;
            cursor += 4;
            entries.insert(name, size);
        }
        self.replace_all(entries);
        Ok(())
    }
}

impl Default for FilesCache {
    fn default() -> Self {
        Self::new()
    }
}
