//! Public handles onto a stage in a graph.
//!
//! A handle pairs an [`Engine`] with one stage key. Getters that need a
//! result drive the stage to FINISHED first; setters change an input and
//! invalidate from the earliest phase that depends on it.

use super::engine::Engine;
use super::node::StageNode;
use super::traits::{Phase, StageFlags, StageKey, StageStatus};
use crate::data::Payload;
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Operations common to every stage kind.
pub struct StageHandle<'a> {
    pub(crate) engine: Engine<'a>,
    pub(crate) key: StageKey,
}

impl<'a> StageHandle<'a> {
    pub fn new(engine: Engine<'a>, key: StageKey) -> Self {
        Self { engine, key }
    }

    pub fn key(&self) -> StageKey {
        self.key
    }

    pub fn node(&self) -> Result<&StageNode> {
        self.engine.graph().node(self.key)
    }

    pub fn label(&self) -> Result<&str> {
        Ok(&self.node()?.core.label)
    }

    pub fn status(&self) -> Result<StageStatus> {
        self.engine.status(self.key)
    }

    pub fn flags(&self) -> Result<StageFlags> {
        self.engine.flags(self.key)
    }

    pub fn executions(&self, phase: Phase) -> Result<usize> {
        Ok(self.node()?.core.executions(phase))
    }

    /// Run whatever is needed to make this stage FINISHED.
    pub fn run(&mut self) -> Result<()> {
        self.engine.ensure_finished(self.key)
    }

    /// The payload as it stands, without running anything.
    pub fn current_payload(&self) -> Result<&Payload> {
        self.engine.payload(self.key)
    }

    /// The payload of the finished stage.
    pub fn payload(&mut self) -> Result<&Payload> {
        self.run()?;
        self.engine.payload(self.key)
    }

    /// A file the finished stage published under `name`.
    pub fn payload_file(&mut self, name: &str) -> Result<PathBuf> {
        self.run()?;
        let node = self.node()?;
        node.core
            .payload
            .file(name)
            .map(PathBuf::from)
            .ok_or_else(|| Error::PayloadMissing {
                stage: node.core.label.clone(),
                key: name.to_string(),
            })
    }

    /// Force `phase` and everything after it to run again, even though no
    /// input changed.
    pub fn invalidate_from(&mut self, phase: Phase) -> Result<()> {
        self.engine.invalidate(self.key, phase)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.invalidate_from(Phase::Prepare)
    }

    pub fn engine(&mut self) -> &mut Engine<'a> {
        &mut self.engine
    }

    /// Apply an input change and invalidate from the phase it reports.
    pub(crate) fn update<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut super::node::StageBody) -> Result<Option<Phase>>,
    {
        let body = self.engine.body_mut(self.key)?;
        if let Some(phase) = change(body)? {
            self.engine.invalidate(self.key, phase)?;
        }
        Ok(())
    }

    /// A result of the finished stage that must be present.
    pub(crate) fn finished<T, F>(&mut self, what: &str, get: F) -> Result<T>
    where
        F: FnOnce(&super::node::StageBody) -> Result<Option<T>>,
    {
        self.run()?;
        let node = self.node()?;
        get(&node.body)?.ok_or_else(|| Error::PayloadMissing {
            stage: node.core.label.clone(),
            key: what.to_string(),
        })
    }
}
