//! Refiner stages: improve the geometry from one or more indexers.

use super::engine::Engine;
use super::handle::StageHandle;
use super::indexer::IndexerState;
use super::node::{PhaseContext, StageBody, Upstream};
use super::traits::{Phase, PhaseOutcome, StageKey};
use crate::data::{numeric_keys, Lattice, UnitCell};
use crate::error::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

/// Payload key of artifact `name` refined for the sweep at `epoch`.
pub fn epoch_key(epoch: u64, name: &str) -> String {
    format!("{epoch}/{name}")
}

/// Insert `key` at `epoch`, renumbering on collision.
///
/// Epochs are trusted while they are unique. Once a collision is seen
/// every existing entry is renumbered 0, 1, 2... and the new one goes at
/// the end. Returns the epoch actually used.
pub(crate) fn insert_by_epoch(
    map: &mut BTreeMap<u64, StageKey>,
    epoch: u64,
    key: StageKey,
    what: &str,
) -> Result<u64> {
    let epoch = if map.contains_key(&0) {
        map.len() as u64
    } else if epoch == 0 && !map.is_empty() {
        return Err(Error::InvalidArgument(format!("multi-sweep {what} has epoch 0")));
    } else if map.contains_key(&epoch) {
        debug!("{what} with epoch {epoch} already exists, renumbering");
        let renumbered: BTreeMap<u64, StageKey> = map
            .values()
            .copied()
            .enumerate()
            .map(|(i, k)| (i as u64, k))
            .collect();
        *map = renumbered;
        map.len() as u64
    } else {
        epoch
    };
    map.insert(epoch, key);
    Ok(epoch)
}

pub trait RefinerBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Check the indexer payloads are usable, converting them if needed.
    fn prepare(&self, state: &mut RefinerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    fn refine(&self, state: &mut RefinerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    fn finish(&self, _state: &mut RefinerState, _ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        Ok(PhaseOutcome::done())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinerState {
    /// Upstream indexers by sweep epoch.
    #[serde(deserialize_with = "numeric_keys::deserialize")]
    pub indexers: BTreeMap<u64, StageKey>,
    /// Overrides the run's scan-varying setting when set.
    pub scan_varying: Option<bool>,

    pub cell: Option<UnitCell>,
    pub lattice: Option<Lattice>,
}

impl RefinerState {
    pub fn new() -> Self {
        Self {
            indexers: BTreeMap::new(),
            scan_varying: None,
            cell: None,
            lattice: None,
        }
    }

    pub fn add_indexer(&mut self, epoch: u64, indexer: StageKey) -> Result<u64> {
        insert_by_epoch(&mut self.indexers, epoch, indexer, "indexer")
    }

    /// The indexer upstream of `epoch` and its state.
    pub fn indexer<'u>(&self, ctx: &'u PhaseContext<'_>, epoch: u64) -> Result<(&'u Upstream, &'u IndexerState)> {
        let key = self
            .indexers
            .get(&epoch)
            .ok_or_else(|| Error::InvalidArgument(format!("no indexer at epoch {epoch}")))?;
        let upstream = ctx.upstream(*key)?;
        let state = upstream.state.as_indexer().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not an indexer", upstream.label))
        })?;
        Ok((upstream, state))
    }

    /// Take cell and lattice from the first indexer.
    pub(crate) fn adopt_indexer_result(&mut self, ctx: &PhaseContext<'_>) -> Result<()> {
        let Some(&epoch) = self.indexers.keys().next() else {
            return Err(Error::NoIndexers);
        };
        let (upstream, indexer) = self.indexer(ctx, epoch)?;
        self.lattice = indexer.lattice;
        self.cell = indexer.cell;
        if self.cell.is_none() {
            return Err(Error::PayloadMissing {
                stage: upstream.label.clone(),
                key: "cell".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for RefinerState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RefinerStage {
    pub state: RefinerState,
    pub backend: Arc<dyn RefinerBackend>,
}

impl RefinerStage {
    pub fn new(backend: Arc<dyn RefinerBackend>) -> Self {
        Self {
            state: RefinerState::new(),
            backend,
        }
    }

    pub(crate) fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        if self.state.indexers.is_empty() {
            return Err(Error::NoIndexers);
        }
        match phase {
            Phase::Prepare => self.backend.prepare(&mut self.state, ctx),
            Phase::Perform => self.backend.refine(&mut self.state, ctx),
            Phase::Finish => self.backend.finish(&mut self.state, ctx),
        }
    }
}

pub struct RefinerHandle<'a> {
    inner: StageHandle<'a>,
}

impl<'a> RefinerHandle<'a> {
    pub fn new(engine: Engine<'a>, key: StageKey) -> Result<Self> {
        engine.body(key)?.as_refiner()?;
        Ok(Self {
            inner: StageHandle::new(engine, key),
        })
    }

    pub fn state(&self) -> Result<&RefinerState> {
        Ok(&self.inner.node()?.body.as_refiner()?.state)
    }

    pub fn indexers(&self) -> Result<Vec<(u64, StageKey)>> {
        Ok(self.state()?.indexers.iter().map(|(e, k)| (*e, *k)).collect())
    }

    pub fn add_indexer(&mut self, epoch: u64, indexer: StageKey) -> Result<u64> {
        let mut used = epoch;
        self.inner.update(|body| {
            used = body.as_refiner_mut()?.state.add_indexer(epoch, indexer)?;
            Ok(Some(Phase::Prepare))
        })?;
        Ok(used)
    }

    pub fn set_scan_varying(&mut self, scan_varying: bool) -> Result<()> {
        self.inner.update(|body| {
            let state = &mut body.as_refiner_mut()?.state;
            let changed = state.scan_varying != Some(scan_varying);
            state.scan_varying = Some(scan_varying);
            Ok(changed.then_some(Phase::Prepare))
        })
    }

    pub fn cell(&mut self) -> Result<UnitCell> {
        self.inner.finished("cell", |b| Ok(b.as_refiner()?.state.cell))
    }

    pub fn lattice(&mut self) -> Result<Lattice> {
        self.inner.finished("lattice", |b| Ok(b.as_refiner()?.state.lattice))
    }

    /// A file refined for the sweep at `epoch`.
    pub fn epoch_file(&mut self, epoch: u64, name: &str) -> Result<PathBuf> {
        self.inner.payload_file(&epoch_key(epoch, name))
    }

    /// Reject the current lattice of every upstream indexer.
    pub fn eliminate(&mut self) -> Result<usize> {
        let key = self.inner.key;
        let count = self.inner.engine.eliminate_upstream(key)?;
        if count == 0 {
            return Err(Error::NotEnoughLattices);
        }
        Ok(count)
    }
}

impl<'a> Deref for RefinerHandle<'a> {
    type Target = StageHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a> DerefMut for RefinerHandle<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub fn refiner_body(backend: Arc<dyn RefinerBackend>, indexers: &[(u64, StageKey)]) -> Result<StageBody> {
    let mut stage = RefinerStage::new(backend);
    for (epoch, key) in indexers {
        stage.state.add_indexer(*epoch, *key)?;
    }
    Ok(StageBody::Refiner(stage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageStatus;
    use crate::testing;

    #[test]
    fn test_state_with_epochs_reloads() {
        use crate::stage::node::StageState;

        let mut state = RefinerState::new();
        state.add_indexer(1_600_000_000, StageKey(1)).unwrap();
        state.add_indexer(1_600_000_090, StageKey(4)).unwrap();
        let state = StageState::Refiner(state);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""indexers":{"1600000000":1,"1600000090":4}"#));
        assert_eq!(serde_json::from_str::<StageState>(&json).unwrap(), state);
    }

    #[test]
    fn test_epochs_trusted_until_collision() {
        let mut map = BTreeMap::new();
        assert_eq!(insert_by_epoch(&mut map, 1000, StageKey(1), "indexer").unwrap(), 1000);
        assert_eq!(insert_by_epoch(&mut map, 2000, StageKey(2), "indexer").unwrap(), 2000);
        assert_eq!(insert_by_epoch(&mut map, 1000, StageKey(3), "indexer").unwrap(), 2);

        let order: Vec<_> = map.into_iter().collect();
        assert_eq!(order, [(0, StageKey(1)), (1, StageKey(2)), (2, StageKey(3))]);
    }

    #[test]
    fn test_epoch_zero_guard() {
        let mut map = BTreeMap::new();
        insert_by_epoch(&mut map, 5, StageKey(1), "integrater").unwrap();
        let err = insert_by_epoch(&mut map, 0, StageKey(2), "integrater").unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: multi-sweep integrater has epoch 0");

        let mut map = BTreeMap::new();
        insert_by_epoch(&mut map, 0, StageKey(1), "integrater").unwrap();
        assert_eq!(insert_by_epoch(&mut map, 7, StageKey(2), "integrater").unwrap(), 1);
    }

    #[test]
    fn test_refiner_without_indexers() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let mut graph = crate::stage::StageGraph::new();
        let backend = run.registry().refiner("xds", &serde_json::Value::Null).unwrap();
        let key = graph.insert("lonely refiner", dir.path(), refiner_body(backend, &[]).unwrap());

        let mut refiner = RefinerHandle::new(Engine::new(&mut graph, &run), key).unwrap();
        let err = refiner.cell().unwrap_err();
        assert!(matches!(err, Error::NoIndexers));
        assert_eq!(refiner.status().unwrap(), StageStatus::NotPrepared);
    }

    #[test]
    fn test_refiner_publishes_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::xds_chain(dir.path());

        let mut refiner = RefinerHandle::new(Engine::new(&mut graph, &run), chain.refiner).unwrap();
        assert_eq!(refiner.lattice().unwrap(), Lattice::TetragonalP);
        let (epoch, _) = refiner.indexers().unwrap()[0];
        let xparm = refiner.epoch_file(epoch, "XPARM.XDS").unwrap();
        assert!(xparm.exists());
        assert_eq!(drivers.count_in("xds_par", "refine"), 0);
    }

    #[test]
    fn test_refiner_eliminate_reaches_indexer() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);
        engine.ensure_finished(chain.refiner).unwrap();

        let mut refiner = RefinerHandle::new(engine.reborrow(), chain.refiner).unwrap();
        assert_eq!(refiner.eliminate().unwrap(), 1);
        assert_eq!(refiner.status().unwrap(), StageStatus::NotPrepared);
        assert_eq!(refiner.lattice().unwrap(), Lattice::OrthorhombicP);
    }
}
