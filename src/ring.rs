//! Consistent-hash ring mapping routing keys to backend URLs.
//!
//! Each member is inserted `vnode_size` times under positions derived from a
//! fixed 64-bit hash of `url#index`, so two proxies with identical configs
//! route identically. Membership is frozen after startup in this version, so
//! lookups take no lock.

use crate::{Error, Result};
use std::collections::BTreeMap;
use twox_hash::XxHash64;

const RING_HASH_SEED: u64 = 0;

fn ring_position(key: &str) -> u64 {
    XxHash64::oneshot(RING_HASH_SEED, key.as_bytes())
}

/// Consistent hash ring with virtual-node replication.
pub struct HashRing {
    /// Position -> member URLs at that position, kept sorted so that hash
    /// collisions tie-break lexicographically.
    ring: BTreeMap<u64, Vec<String>>,
    /// Virtual nodes per member.
    vnode_size: usize,
}

impl HashRing {
    pub fn new(vnode_size: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            vnode_size: vnode_size.max(1),
        }
    }

    /// Add a member under its virtual-node positions.
    pub fn add(&mut self, url: &str) {
        for i in 0..self.vnode_size {
            let position = ring_position(&format!("{url}#{i}"));
            let members = self.ring.entry(position).or_default();
            if let Err(at) = members.binary_search_by(|m| m.as_str().cmp(url)) {
                members.insert(at, url.to_string());
            }
        }
    }

    /// Remove a member from every position it occupies.
    pub fn remove(&mut self, url: &str) {
        for i in 0..self.vnode_size {
            let position = ring_position(&format!("{url}#{i}"));
            if let Some(members) = self.ring.get_mut(&position) {
                members.retain(|m| m != url);
                if members.is_empty() {
                    self.ring.remove(&position);
                }
            }
        }
    }

    /// Resolve the member owning `key`: lower-bound lookup with wraparound.
    pub fn get(&self, key: &str) -> Result<&str> {
        let position = ring_position(key);
        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .and_then(|(_, members)| members.first())
            .map(String::as_str)
            .ok_or(Error::EmptyRing)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
