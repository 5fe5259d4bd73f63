//! Process-wide identity helpers: name → id hashing and the process group.
//!
//! Routine ids are derived from human-readable names, so two different names
//! that hash to the same id would silently alias each other. [`IdentityTable`]
//! remembers which name claimed an id and refuses a second, different name.
//! A claim lasts while its owner is registered and is released on
//! deregistration, so the table only holds live names.

use std::collections::HashMap;
use std::env;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Env var naming the process group this process belongs to.
pub const PROCESS_GROUP_ENV: &str = "RTSCHED_PROCESS_GROUP";

const FALLBACK_PROCESS_GROUP: &str = "rtsched";

/// Deterministic 64-bit id for a name (first 8 bytes of its SHA-256, little-endian).
pub fn hash_name(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(buf)
}

/// Current process group: `RTSCHED_PROCESS_GROUP`, else the executable's file stem.
pub fn process_group() -> String {
    if let Some(group) = env::var(PROCESS_GROUP_ENV).ok().filter(|s| !s.is_empty()) {
        return group;
    }
    env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .unwrap_or_else(|| FALLBACK_PROCESS_GROUP.to_string())
}

/// Registry of id → name claims used to detect hash collisions.
#[derive(Debug, Default)]
pub struct IdentityTable {
    claims: Mutex<HashMap<u64, String>>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for `name`. Re-claiming with the same name is a no-op.
    pub fn claim(&self, id: u64, name: &str) -> Result<(), CoreError> {
        let mut claims = self.claims.lock();
        match claims.get(&id) {
            Some(existing) if existing != name => Err(CoreError::IdCollision {
                id,
                existing: existing.clone(),
                requested: name.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                claims.insert(id, name.to_string());
                Ok(())
            }
        }
    }

    /// Drop the claim on `id` if `name` owns it. Returns true if a claim was dropped.
    pub fn release(&self, id: u64, name: &str) -> bool {
        let mut claims = self.claims.lock();
        if claims.get(&id).is_some_and(|owner| owner == name) {
            claims.remove(&id);
            true
        } else {
            false
        }
    }

    /// Name that currently owns `id`, if any.
    pub fn name_of(&self, id: u64) -> Option<String> {
        self.claims.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.lock().is_empty()
    }
}
