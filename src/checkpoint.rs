//! C9: Checkpoint Store.
//!
//! Accumulates the caller's global (replicated) and local (per-rank) state
//! blobs between `CheckPoint` calls, the way `CheckPointer::AddGlobalState`/
//! `AddLocalState` build up a snapshot before `CheckPoint` ships it to the
//! tracker (`comm/checkpointer.cc`). Each named piece of state is kept in
//! registration order so `CheckPoint`/`LoadCheckPoint` round-trip it in the
//! same layout every time.

use crate::communicator::Communicator;
use crate::error::Result;

struct Slot {
    name: String,
    data: Vec<u8>,
}

/// Builds up one checkpoint's worth of state for a communicator.
#[derive(Default)]
pub struct CheckpointStore {
    global: Vec<Slot>,
    local: Vec<Slot>,
    version: u32,
}

impl CheckpointStore {
    pub fn new() -> Self {
        CheckpointStore::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Registers (or replaces) a named piece of state replicated identically
    /// on every rank.
    pub fn add_global_state(&mut self, name: &str, data: Vec<u8>) {
        upsert(&mut self.global, name, data);
    }

    /// Registers (or replaces) a named piece of state unique to this rank.
    pub fn add_local_state(&mut self, name: &str, data: Vec<u8>) {
        upsert(&mut self.local, name, data);
    }

    /// Serializes every registered slot and uploads it to the tracker,
    /// recording the version it assigns.
    pub fn checkpoint(&mut self, comm: &Communicator) -> Result<u32> {
        let global = encode(&self.global);
        let local = encode(&self.local);
        self.version = comm.checkpoint(&global, &local)?;
        Ok(self.version)
    }

    /// Fetches the tracker's last checkpoint and overwrites this store's
    /// slots with the decoded contents. Returns `false` if no checkpoint
    /// has ever been saved.
    pub fn load(&mut self, comm: &Communicator) -> Result<bool> {
        let Some(loaded) = comm.load_checkpoint()? else {
            return Ok(false);
        };
        self.global = decode(&loaded.global);
        self.local = decode(&loaded.local);
        self.version = loaded.version;
        Ok(true)
    }

    /// Returns the bytes registered under `name` in the local store, if any.
    pub fn local_state(&self, name: &str) -> Option<&[u8]> {
        self.local.iter().find(|s| s.name == name).map(|s| s.data.as_slice())
    }

    /// Returns the bytes registered under `name` in the global store, if any.
    pub fn global_state(&self, name: &str) -> Option<&[u8]> {
        self.global.iter().find(|s| s.name == name).map(|s| s.data.as_slice())
    }
}

fn upsert(slots: &mut Vec<Slot>, name: &str, data: Vec<u8>) {
    if let Some(slot) = slots.iter_mut().find(|s| s.name == name) {
        slot.data = data;
    } else {
        slots.push(Slot {
            name: name.to_string(),
            data,
        });
    }
}

/// `[count][name_len][name][data_len][data]...`, a flat framing good enough
/// for the opaque blobs the tracker just stores and hands back.
fn encode(slots: &[Slot]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(slots.len() as u32).to_le_bytes());
    for slot in slots {
        let name = slot.name.as_bytes();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&(slot.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&slot.data);
    }
    out
}

fn decode(bytes: &[u8]) -> Vec<Slot> {
    let mut slots = Vec::new();
    let mut cursor = 0usize;
    let read_u32 = |b: &[u8], at: usize| -> u32 { u32::from_le_bytes(b[at..at + 4].try_into().unwrap()) };
    if bytes.len() < 4 {
        return slots;
    }
    let count = read_u32(bytes, cursor);
    cursor += 4;
    for _ in 0..count {
        let name_len = read_u32(bytes, cursor) as usize;
        cursor += 4;
        let name = String::from_utf8_lossy(&bytes[cursor..cursor + name_len]).into_owned();
        cursor += name_len;
        let data_len = read_u32(bytes, cursor) as usize;
        cursor += 4;
        let data = bytes[cursor..cursor + data_len].to_vec();
        cursor += data_len;
        slots.push(Slot { name, data });
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrips_named_slots() {
        let mut slots = Vec::new();
        upsert(&mut slots, "a", vec![1, 2, 3]);
        upsert(&mut slots, "b", vec![]);
        let bytes = encode(&slots);
        let decoded = decode(&bytes);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].name, "a");
        assert_eq!(decoded[0].data, vec![1, 2, 3]);
        assert_eq!(decoded[1].name, "b");
        assert!(decoded[1].data.is_empty());
    }

    #[test]
    fn upsert_replaces_existing_slot() {
        let mut slots = Vec::new();
        upsert(&mut slots, "x", vec![1]);
        upsert(&mut slots, "x", vec![2, 2]);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].data, vec![2, 2]);
    }
}
