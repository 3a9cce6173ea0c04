//! Fallback policies for failed indexers.
//!
//! When an indexer's external program fails, the engine asks the run's
//! policy whether to replace the stage with one built on another backend.
//! Each indexer stage is judged on its own history.

use crate::error::Error;
use crate::stage::StageKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Decides whether a failed indexer backend is replaced, and by what.
pub trait FallbackPolicy: Send + Sync {
    /// The backend to substitute for `failed` in indexer `stage`, or
    /// `None` to let the error propagate.
    fn substitute(&self, stage: StageKey, failed: &str, error: &Error) -> Option<String>;

    /// Forget substitutions made so far.
    fn reset(&self) {}
}

/// Never substitute.
#[derive(Debug, Default)]
pub struct NeverFallback;

impl FallbackPolicy for NeverFallback {
    fn substitute(&self, _stage: StageKey, _failed: &str, _error: &Error) -> Option<String> {
        None
    }
}

/// Swap DIALS for XDS and back, for external program failures only.
#[derive(Debug, Default)]
pub struct AlternateEngine;

impl FallbackPolicy for AlternateEngine {
    fn substitute(&self, _stage: StageKey, failed: &str, error: &Error) -> Option<String> {
        if !error.is_tool() {
            return None;
        }
        match failed {
            "dials" => Some("xds".to_string()),
            "xds" => Some("dials".to_string()),
            _ => None,
        }
    }
}

/// Allow at most `limit` substitutions over the whole run, across all
/// stages. Selected by the `max_fallbacks` setting.
pub struct SaturationPolicy {
    inner: Box<dyn FallbackPolicy>,
    limit: usize,
    used: AtomicUsize,
}

impl SaturationPolicy {
    pub fn new(inner: Box<dyn FallbackPolicy>, limit: usize) -> Self {
        Self {
            inner,
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used.load(Ordering::SeqCst))
    }
}

impl FallbackPolicy for SaturationPolicy {
    fn substitute(&self, stage: StageKey, failed: &str, error: &Error) -> Option<String> {
        if self.remaining() == 0 {
            return None;
        }
        let replacement = self.inner.substitute(stage, failed, error)?;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| (used < self.limit).then_some(used + 1))
            .ok()
            .map(|_| replacement)
    }

    fn reset(&self) {
        self.used.store(0, Ordering::SeqCst);
        self.inner.reset();
    }
}

/// Never substitute the same backend twice within one stage, so two
/// failing engines cannot keep replacing each other. Every stage gets its
/// own chance.
pub struct OncePerBackend {
    inner: Box<dyn FallbackPolicy>,
    used: RwLock<HashMap<(StageKey, String), usize>>,
}

impl OncePerBackend {
    pub fn new(inner: Box<dyn FallbackPolicy>) -> Self {
        Self {
            inner,
            used: RwLock::new(HashMap::new()),
        }
    }
}

impl FallbackPolicy for OncePerBackend {
    fn substitute(&self, stage: StageKey, failed: &str, error: &Error) -> Option<String> {
        let mut used = self.used.write().unwrap_or_else(|e| e.into_inner());
        let count = used.entry((stage, failed.to_string())).or_insert(0);
        if *count > 0 {
            return None;
        }
        let replacement = self.inner.substitute(stage, failed, error)?;
        *count += 1;
        Some(replacement)
    }

    fn reset(&self) {
        self.used.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.inner.reset();
    }
}
