//! Arena of stages and the producer/consumer edges between them.
//!
//! Stages refer to each other by [`StageKey`]; the edges live in each
//! stage's state (a refiner's indexers, a scaler's integraters) and
//! dependents are derived from them on demand, so there is a single
//! source of truth for the topology.

use super::indexer::IndexerStage;
use super::integrater::IntegraterStage;
use super::node::{StageBody, StageCore, StageNode, StageState};
use super::refiner::RefinerStage;
use super::registry::{Backend, BackendRegistry};
use super::scaler::ScalerStage;
use super::traits::{Phase, StageFlags, StageKey, StageKind};
use crate::data::{numeric_keys, Payload};
use crate::error::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    nodes: BTreeMap<StageKey, StageNode>,
    next_key: u64,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage and return its key.
    pub fn insert(&mut self, label: impl Into<String>, working_dir: impl Into<PathBuf>, body: StageBody) -> StageKey {
        self.next_key += 1;
        let key = StageKey(self.next_key);
        let core = StageCore::new(key, label, working_dir);
        self.nodes.insert(key, StageNode { core, body });
        key
    }

    pub fn node(&self, key: StageKey) -> Result<&StageNode> {
        self.nodes.get(&key).ok_or(Error::UnknownStage(key.0))
    }

    pub fn node_mut(&mut self, key: StageKey) -> Result<&mut StageNode> {
        self.nodes.get_mut(&key).ok_or(Error::UnknownStage(key.0))
    }

    pub fn contains(&self, key: StageKey) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = StageKey> + '_ {
        self.nodes.keys().copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.values()
    }

    pub fn keys_of_kind(&self, kind: StageKind) -> Vec<StageKey> {
        self.nodes
            .values()
            .filter(|n| n.kind() == kind)
            .map(|n| n.core.key)
            .collect()
    }

    pub fn producers(&self, key: StageKey) -> Result<Vec<StageKey>> {
        Ok(self.node(key)?.body.producers())
    }

    /// Stages that consume `key` directly.
    pub fn dependents(&self, key: StageKey) -> Vec<StageKey> {
        self.nodes
            .values()
            .filter(|n| n.body.producers().contains(&key))
            .map(|n| n.core.key)
            .collect()
    }

    /// Every stage `key` transitively depends on, nearest first.
    pub fn upstream_closure(&self, key: StageKey) -> Result<Vec<StageKey>> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<StageKey> = self.producers(key)?.into();
        while let Some(next) = queue.pop_front() {
            if next == key {
                return Err(Error::Schema(format!("stage {key} depends on itself")));
            }
            if seen.insert(next) {
                order.push(next);
                queue.extend(self.producers(next)?);
            }
        }
        Ok(order)
    }

    /// Clear `phase` and every later flag of `key`, then clear the
    /// prepare flag of everything downstream.
    pub fn invalidate(&mut self, key: StageKey, phase: Phase) -> Result<()> {
        let node = self.node_mut(key)?;
        if node.core.flags.reset_from(phase) {
            debug!("{}: reset from {}", node.core.label, phase.name());
        }
        node.body.on_invalidate(phase);
        for dependent in self.dependents(key) {
            self.invalidate(dependent, Phase::Prepare)?;
        }
        Ok(())
    }

    /// Move the given stages into a graph of their own.
    ///
    /// The split graph keeps the key counter so that stages created in it
    /// cannot collide with the remainder; see [`StageGraph::absorb`].
    pub fn split_off(&mut self, keys: &[StageKey]) -> Result<StageGraph> {
        let mut part = StageGraph {
            nodes: BTreeMap::new(),
            next_key: self.next_key,
        };
        for key in keys {
            let node = self.nodes.remove(key).ok_or(Error::UnknownStage(key.0))?;
            part.nodes.insert(*key, node);
        }
        Ok(part)
    }

    /// Move every stage of `other` back into this graph.
    pub fn absorb(&mut self, other: StageGraph) -> Result<()> {
        for (key, node) in other.nodes {
            if self.nodes.insert(key, node).is_some() {
                return Err(Error::Schema(format!("stage {key} present in both graphs")));
            }
        }
        self.next_key = self.next_key.max(other.next_key);
        Ok(())
    }

    pub fn to_records(&self) -> Vec<StageRecord> {
        self.nodes.values().map(StageRecord::from_node).collect()
    }

    /// Rebuild a graph, constructing every backend through `registry`.
    pub fn from_records(records: Vec<StageRecord>, registry: &BackendRegistry) -> Result<Self> {
        let mut graph = StageGraph::new();
        for record in records {
            let key = record.key;
            let node = record.into_node(registry)?;
            graph.next_key = graph.next_key.max(key.0);
            if graph.nodes.insert(key, node).is_some() {
                return Err(Error::Schema(format!("duplicate stage {key}")));
            }
        }
        for key in graph.keys().collect::<Vec<_>>() {
            for producer in graph.producers(key)? {
                if !graph.contains(producer) {
                    return Err(Error::Schema(format!(
                        "stage {key} refers to missing stage {producer}"
                    )));
                }
            }
        }
        Ok(graph)
    }
}

/// Persisted form of one stage.
///
/// The backend is stored by name and settings; transient counters are not
/// stored at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__id__", rename = "Stage")]
pub struct StageRecord {
    pub key: StageKey,
    pub label: String,
    pub working_dir: PathBuf,
    pub flags: StageFlags,
    pub generation: u64,
    pub payload: Payload,
    #[serde(default, deserialize_with = "numeric_keys::deserialize")]
    pub seen: BTreeMap<StageKey, u64>,
    pub backend: String,
    #[serde(default)]
    pub settings: serde_json::Value,
    pub state: StageState,
}

impl StageRecord {
    pub fn from_node(node: &StageNode) -> Self {
        Self {
            key: node.core.key,
            label: node.core.label.clone(),
            working_dir: node.core.working_dir.clone(),
            flags: node.core.flags,
            generation: node.core.generation,
            payload: node.core.payload.clone(),
            seen: node.core.seen.clone(),
            backend: node.body.backend_name().to_string(),
            settings: node.body.backend_settings(),
            state: node.body.state(),
        }
    }

    pub fn into_node(self, registry: &BackendRegistry) -> Result<StageNode> {
        let kind = self.state.kind();
        let backend = registry.build(kind, &self.backend, &self.settings)?;
        let body = match (self.state, backend) {
            (StageState::Indexer(state), Backend::Indexer(backend)) => {
                StageBody::Indexer(IndexerStage { state, backend })
            }
            (StageState::Refiner(state), Backend::Refiner(backend)) => {
                StageBody::Refiner(RefinerStage { state, backend })
            }
            (StageState::Integrater(state), Backend::Integrater(backend)) => {
                StageBody::Integrater(IntegraterStage { state, backend })
            }
            (StageState::Scaler(state), Backend::Scaler(backend)) => {
                StageBody::Scaler(ScalerStage { state, backend })
            }
            (_, backend) => {
                return Err(Error::Schema(format!(
                    "{kind} stage {} has {} backend {}",
                    self.key,
                    backend.kind(),
                    backend.name()
                )))
            }
        };
        let mut core = StageCore::new(self.key, self.label, self.working_dir);
        core.flags = self.flags;
        core.generation = self.generation;
        core.payload = self.payload;
        core.seen = self.seen;
        Ok(StageNode { core, body })
    }
}
