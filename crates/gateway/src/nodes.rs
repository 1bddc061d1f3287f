//! The table of known peer addresses and its on-disk form.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crest_types::NetAddress;

use crate::error::Error;

/// Default bound on the number of known nodes.
pub const MAX_NODES: usize = 300;

const PERSIST_VERSION: u32 = 1;

/// A known node address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub address: NetAddress,
    /// Set the first time we successfully dialed and used this address;
    /// never cleared afterwards.
    pub was_outbound_peer: bool,
}

#[derive(Serialize, Deserialize)]
struct NodeFile {
    version: u32,
    nodes: Vec<Node>,
}

/// Bounded set of known peer addresses.
///
/// The whole table is rewritten to disk (temp file, then rename) after
/// mutations, throttled by the persist interval; [`NodeTable::persist_now`]
/// forces a write during shutdown.
pub struct NodeTable {
    nodes: HashMap<NetAddress, Node>,
    max_nodes: usize,
    allow_local: bool,
    path: PathBuf,
    persist_interval: Duration,
    last_persist: Instant,
    dirty: bool,
    rng: fastrand::Rng,
}

impl NodeTable {
    pub fn load(
        path: PathBuf,
        max_nodes: usize,
        persist_interval: Duration,
        allow_local: bool,
    ) -> Result<Self, Error> {
        let nodes = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: NodeFile = ciborium::de::from_reader(bytes.as_slice())
                    .map_err(|err| Error::Decode(format!("corrupt node file: {err}")))?;
                if file.version != PERSIST_VERSION {
                    return Err(Error::Decode(format!(
                        "unsupported node file version {}",
                        file.version
                    )));
                }

                debug!("loaded {} known nodes from {:?}", file.nodes.len(), path);
                file.nodes
                    .into_iter()
                    .map(|node| (node.address.clone(), node))
                    .collect()
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            nodes,
            max_nodes,
            allow_local,
            path,
            persist_interval,
            last_persist: Instant::now(),
            dirty: false,
            rng: fastrand::Rng::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, address: &NetAddress) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn get(&self, address: &NetAddress) -> Option<&Node> {
        self.nodes.get(address)
    }

    /// Insert a new address. Duplicates are kept as-is and report `false`.
    /// When the table is full a random node without the outbound flag is
    /// evicted first; if every node carries the flag, a random flagged one
    /// goes instead, so the bound is advisory.
    pub fn add(&mut self, address: NetAddress) -> Result<bool, Error> {
        if !self.allow_local {
            address.validate_remote()?;
        }
        if self.nodes.contains_key(&address) {
            return Ok(false);
        }

        if self.nodes.len() >= self.max_nodes {
            self.evict_random();
        }

        self.nodes.insert(
            address.clone(),
            Node {
                address,
                was_outbound_peer: false,
            },
        );
        self.mutated();
        Ok(true)
    }

    fn evict_random(&mut self) {
        let mut candidates: Vec<&NetAddress> = self
            .nodes
            .values()
            .filter(|node| !node.was_outbound_peer)
            .map(|node| &node.address)
            .collect();
        if candidates.is_empty() {
            candidates = self.nodes.keys().collect();
        }

        let victim = candidates[self.rng.usize(..candidates.len())].clone();
        trace!("evicting node {victim} from the full node table");
        self.nodes.remove(&victim);
    }

    pub fn remove(&mut self, address: &NetAddress) -> bool {
        let removed = self.nodes.remove(address).is_some();
        if removed {
            self.mutated();
        }
        removed
    }

    /// Flag an address as having served as an outbound peer. The flag
    /// only ever goes from false to true.
    pub fn mark_outbound(&mut self, address: &NetAddress) {
        if let Some(node) = self.nodes.get_mut(address) {
            if !node.was_outbound_peer {
                node.was_outbound_peer = true;
                self.mutated();
            }
        }
    }

    /// A uniformly random known address.
    pub fn random(&mut self) -> Option<NetAddress> {
        if self.nodes.is_empty() {
            return None;
        }
        let keys: Vec<&NetAddress> = self.nodes.keys().collect();
        Some(keys[self.rng.usize(..keys.len())].clone())
    }

    /// Up to `n` distinct random addresses.
    pub fn sample(&mut self, n: usize) -> Vec<NetAddress> {
        let mut keys: Vec<NetAddress> = self.nodes.keys().cloned().collect();
        self.rng.shuffle(&mut keys);
        keys.truncate(n);
        keys
    }

    /// All known addresses, outbound-flagged ones first. Each group is
    /// shuffled independently.
    pub fn snapshot_outbound_first(&mut self) -> Vec<NetAddress> {
        let mut outbound = Vec::new();
        let mut rest = Vec::new();
        for node in self.nodes.values() {
            if node.was_outbound_peer {
                outbound.push(node.address.clone());
            } else {
                rest.push(node.address.clone());
            }
        }

        self.rng.shuffle(&mut outbound);
        self.rng.shuffle(&mut rest);
        outbound.extend(rest);
        outbound
    }

    fn mutated(&mut self) {
        self.dirty = true;
        if self.last_persist.elapsed() >= self.persist_interval {
            if let Err(err) = self.persist_now() {
                debug!("failed to persist node table: {err}");
            }
        }
    }

    /// Write the table to disk unconditionally.
    pub fn persist_now(&mut self) -> Result<(), Error> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.address.cmp(&b.address));

        let file = NodeFile {
            version: PERSIST_VERSION,
            nodes,
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&file, &mut buf)
            .map_err(|err| Error::Encode(err.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &self.path)?;

        self.dirty = false;
        self.last_persist = Instant::now();
        Ok(())
    }
}
