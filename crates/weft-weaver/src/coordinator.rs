//! Transform coordinator
//!
//! Entry point for the host runtime. `on_class_load` runs on whichever thread
//! is loading the class and never fails: anything that goes wrong, panics
//! included, ends with the original bytes being returned and a report to the
//! listener. `retransform` adds patches to classes that are already active.
//!
//! Only `retransform` takes the global lock; first loads never wait for it.
//! Hosts offer a class for retransformation only once its first load has
//! returned, so the two never race on the same class. The applied-patch
//! registry and the failure-dedupe set hold one entry per instrumented class
//! (and failing patch) for the life of the process.

use crate::catalog::{PatchCatalog, PatchDefinition, PatchId};
use crate::config::WeaverConfig;
use crate::diagnostics::{TracingListener, WeaveFailureReport, WeaveListener};
use crate::error::WeaveError;
use crate::hierarchy::{TypeGraph, TypeHeader};
use crate::matcher::match_class;
use crate::weave::{WeaveEngine, WeaveFailure, WeaveMode, WeaveResult};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use weft_classfile::CompiledClass;

/// Host refused to install new bytes for an active class
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedefineError {
    /// Class not known to the host
    #[error("Class {0} is not loaded")]
    NotLoaded(String),

    /// Host-side rejection
    #[error("Redefinition of {class} rejected: {reason}")]
    Rejected {
        /// Class name
        class: String,
        /// Host message
        reason: String,
    },
}

/// Installs retransformed bytes into the running host
pub trait ClassRedefiner {
    /// Replace the active definition of `class`
    fn redefine(&self, class: &str, bytes: &[u8]) -> Result<(), RedefineError>;
}

/// An active class offered for retransformation
#[derive(Debug, Clone)]
pub struct LoadedClass {
    /// Internal name
    pub name: String,
    /// Bytes as originally presented at load, before any weave
    pub bytes: Vec<u8>,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Classes offered at load
    pub classes_seen: u64,
    /// Classes returned with new bytes
    pub woven: u64,
    /// Classes returned untouched because nothing applied
    pub unchanged: u64,
    /// Weaves that fell back to the original bytes
    pub failed: u64,
    /// Loads answered from the weave cache
    pub cache_hits: u64,
    /// Classes redefined by `retransform`
    pub retransformed: u64,
}

impl CoordinatorStats {
    /// Snapshot as JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Default)]
struct Counters {
    classes_seen: AtomicU64,
    woven: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    retransformed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            classes_seen: self.classes_seen.load(Ordering::Relaxed),
            woven: self.woven.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            retransformed: self.retransformed.load(Ordering::Relaxed),
        }
    }
}

/// Weave cache key: identity, matched patch set and input content
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    class: String,
    patches: Vec<PatchId>,
    digest: [u8; 32],
}

impl CacheKey {
    fn new(class: &str, patches: &[&PatchDefinition], bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize()[..]);
        Self {
            class: class.to_string(),
            patches: patches.iter().map(|p| p.id.clone()).collect(),
            digest,
        }
    }
}

#[derive(Debug, Clone)]
enum Cached {
    Woven {
        bytes: Arc<Vec<u8>>,
        applied: Vec<PatchId>,
    },
    Unchanged,
    Failed(WeaveFailure),
}

/// Runs matcher and engine for the host's load and retransform hooks
pub struct TransformCoordinator {
    catalog: Arc<PatchCatalog>,
    config: WeaverConfig,
    engine: WeaveEngine,
    listener: Arc<dyn WeaveListener>,
    cache: DashMap<CacheKey, Cached>,
    applied: DashMap<String, Vec<PatchId>>,
    reported: DashSet<(String, Option<PatchId>)>,
    retransform_lock: Mutex<()>,
    counters: Counters,
}

impl TransformCoordinator {
    /// Coordinator reporting through [`TracingListener`]
    pub fn new(catalog: Arc<PatchCatalog>, config: WeaverConfig) -> Self {
        Self {
            engine: WeaveEngine::new(&config),
            catalog,
            config,
            listener: Arc::new(TracingListener),
            cache: DashMap::new(),
            applied: DashMap::new(),
            reported: DashSet::new(),
            retransform_lock: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Replace the outcome listener
    pub fn with_listener(mut self, listener: Arc<dyn WeaveListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Patch catalog
    pub fn catalog(&self) -> &PatchCatalog {
        &self.catalog
    }

    /// Active configuration
    pub fn config(&self) -> &WeaverConfig {
        &self.config
    }

    /// Patches currently applied to `class`, in application order
    pub fn applied_patches(&self, class: &str) -> Vec<PatchId> {
        self.applied
            .get(class)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Number of cached weave results
    pub fn cached_classes(&self) -> usize {
        self.cache.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }

    /// Load hook: the bytes to define for `class`
    ///
    /// Returns `bytes` itself when nothing applies or the weave fails.
    pub fn on_class_load<'b>(
        &self,
        class: &str,
        bytes: &'b [u8],
        hierarchy: &TypeGraph,
    ) -> Cow<'b, [u8]> {
        Counters::bump(&self.counters.classes_seen);
        if !self.config.enabled || self.config.is_excluded(class) || !self.catalog.may_apply(class)
        {
            Counters::bump(&self.counters.unchanged);
            return Cow::Borrowed(bytes);
        }

        match self.guarded(class, || self.load(class, bytes, hierarchy)) {
            Some(woven) => Cow::Owned(woven.to_vec()),
            None => Cow::Borrowed(bytes),
        }
    }

    /// Run `f` inside the panic boundary; a panic is reported as a failure of `class`
    fn guarded<T>(&self, class: &str, f: impl FnOnce() -> Option<T>) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(out) => out,
            Err(payload) => {
                self.panicked(class, &*payload);
                None
            }
        }
    }

    fn load(&self, class: &str, bytes: &[u8], hierarchy: &TypeGraph) -> Option<Arc<Vec<u8>>> {
        let target = match self.decode(class, bytes) {
            Ok(target) => target,
            Err(error) => {
                self.fail(class, WeaveFailure { patch: None, error });
                return None;
            }
        };

        let outcome = match_class(&TypeHeader::of(&target), hierarchy, &self.catalog, hierarchy);
        if outcome.is_empty() {
            Counters::bump(&self.counters.unchanged);
            return None;
        }

        let key = CacheKey::new(class, &outcome.patches, bytes);
        let cached = self.cache.get(&key).map(|entry| entry.value().clone());
        if let Some(cached) = cached {
            Counters::bump(&self.counters.cache_hits);
            return self.settle(class, cached);
        }

        let result = match self.engine.weave(target, &outcome.patches, WeaveMode::Load) {
            WeaveResult::Woven(woven) if woven.applied.is_empty() => Cached::Unchanged,
            WeaveResult::Woven(woven) => match woven.class.encode() {
                Ok(bytes) => {
                    for method in &woven.methods {
                        debug!(
                            class,
                            patch = %method.patch,
                            method = %method.method,
                            change = ?method.change,
                            discards = method.discards,
                            "method woven"
                        );
                    }
                    Cached::Woven {
                        bytes: Arc::new(bytes),
                        applied: woven.applied,
                    }
                }
                Err(e) => Cached::Failed(WeaveFailure {
                    patch: None,
                    error: e.into(),
                }),
            },
            WeaveResult::Failed { failure, .. } => Cached::Failed(failure),
        };

        // Once full, new results are dropped rather than evicting old ones
        if self.cache.len() < self.config.max_cached_classes {
            self.cache.insert(key, result.clone());
        }
        self.settle(class, result)
    }

    /// Record and report a weave result, returning the bytes to define
    fn settle(&self, class: &str, result: Cached) -> Option<Arc<Vec<u8>>> {
        match result {
            Cached::Woven { bytes, applied } => {
                Counters::bump(&self.counters.woven);
                self.notify_applied(class, &applied);
                self.applied.insert(class.to_string(), applied);
                Some(bytes)
            }
            Cached::Unchanged => {
                Counters::bump(&self.counters.unchanged);
                None
            }
            Cached::Failed(failure) => {
                self.fail(class, failure);
                None
            }
        }
    }

    /// Retransform hook: add the patches of `subset` to active classes
    ///
    /// Patches already applied to a class are kept; only subset patches that
    /// match and are not yet applied are added, and only method bodies may
    /// change. Returns the number of classes redefined.
    pub fn retransform(
        &self,
        classes: &[LoadedClass],
        hierarchy: &TypeGraph,
        subset: &[PatchId],
        redefiner: &dyn ClassRedefiner,
    ) -> usize {
        let _guard = self.retransform_lock.lock();
        let mut redefined = 0;
        for loaded in classes {
            if !self.config.enabled || self.config.is_excluded(&loaded.name) {
                continue;
            }
            let installed = self.guarded(&loaded.name, || {
                self.retransform_one(loaded, hierarchy, subset, redefiner)
                    .then_some(())
            });
            if installed.is_some() {
                redefined += 1;
            }
        }
        redefined
    }

    fn retransform_one(
        &self,
        loaded: &LoadedClass,
        hierarchy: &TypeGraph,
        subset: &[PatchId],
        redefiner: &dyn ClassRedefiner,
    ) -> bool {
        let class = loaded.name.as_str();
        let original = match self.decode(class, &loaded.bytes) {
            Ok(original) => original,
            Err(error) => {
                self.fail(class, WeaveFailure { patch: None, error });
                return false;
            }
        };

        let outcome = match_class(&TypeHeader::of(&original), hierarchy, &self.catalog, hierarchy);
        let previous = self.applied_patches(class);
        let fresh: Vec<&PatchDefinition> = outcome
            .patches
            .iter()
            .copied()
            .filter(|p| subset.contains(&p.id) && !previous.contains(&p.id))
            .collect();
        if fresh.is_empty() {
            return false;
        }

        // Rebuild the active definition, then add to it
        let active: Vec<&PatchDefinition> =
            previous.iter().filter_map(|id| self.catalog.get(id)).collect();
        let current = match self.engine.weave(original, &active, WeaveMode::Load) {
            WeaveResult::Woven(woven) => woven.class,
            WeaveResult::Failed { failure, .. } => {
                self.fail(class, failure);
                return false;
            }
        };

        let woven = match self.engine.weave(current, &fresh, WeaveMode::Retransform) {
            WeaveResult::Woven(woven) => woven,
            WeaveResult::Failed { failure, .. } => {
                self.fail(class, failure);
                return false;
            }
        };
        let bytes = match woven.class.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(
                    class,
                    WeaveFailure {
                        patch: None,
                        error: e.into(),
                    },
                );
                return false;
            }
        };

        if let Err(e) = redefiner.redefine(class, &bytes) {
            warn!(class, error = %e, "retransformed class not installed");
            return false;
        }

        let mut all = previous;
        all.extend(woven.applied);
        Counters::bump(&self.counters.retransformed);
        self.applied.insert(class.to_string(), all.clone());
        self.notify_applied(class, &all);
        true
    }

    fn decode(&self, class: &str, bytes: &[u8]) -> Result<CompiledClass, WeaveError> {
        let decoded = CompiledClass::decode(bytes)?;
        if decoded.name != class {
            return Err(WeaveError::IdentityMismatch {
                expected: class.to_string(),
                found: decoded.name,
            });
        }
        Ok(decoded)
    }

    fn fail(&self, class: &str, failure: WeaveFailure) {
        Counters::bump(&self.counters.failed);
        if !self.reported.insert((class.to_string(), failure.patch.clone())) {
            return;
        }
        let report = WeaveFailureReport {
            class: class.to_string(),
            patch: failure.patch,
            reason: failure.error,
        };
        // A listener panic must not escape into the host
        let _ = panic::catch_unwind(AssertUnwindSafe(|| self.listener.on_weave_failed(&report)));
    }

    fn notify_applied(&self, class: &str, patches: &[PatchId]) {
        // The class is already woven; a listener panic must not undo that
        let reported = panic::catch_unwind(AssertUnwindSafe(|| {
            self.listener.on_weave_applied(class, patches)
        }));
        if reported.is_err() {
            warn!(class, "weave listener panicked reporting success");
        }
    }

    fn panicked(&self, class: &str, payload: &(dyn Any + Send)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        self.fail(
            class,
            WeaveFailure {
                patch: None,
                error: WeaveError::Panicked(message),
            },
        );
    }
}

impl std::fmt::Debug for TransformCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformCoordinator")
            .field("catalog", &self.catalog.len())
            .field("cached", &self.cache.len())
            .field("stats", &self.stats())
            .finish()
    }
}
