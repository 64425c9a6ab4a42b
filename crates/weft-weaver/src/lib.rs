//! Weft load-time weaver
//!
//! Applies declarative patch definitions to compiled classes as the host
//! runtime loads them. A [`PatchCatalog`] holds the validated definitions,
//! [`match_class`] selects the ones that apply to a class, the
//! [`WeaveEngine`] merges them, and the [`TransformCoordinator`] ties the
//! three to the host's load and retransform hooks.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod hierarchy;
pub mod matcher;
pub mod weave;

pub use catalog::{
    CatalogError, CatalogLoad, DefinitionError, FormatError, ModuleSummary, PatchCatalog,
    PatchDefinition, PatchField, PatchId, PatchMethod, PatchModule, PatchSource, Selector,
};
pub use config::{ConfigError, WeaverConfig};
pub use coordinator::{
    ClassRedefiner, CoordinatorStats, LoadedClass, RedefineError, TransformCoordinator,
};
pub use diagnostics::{TracingListener, WeaveFailureReport, WeaveListener};
pub use error::WeaveError;
pub use hierarchy::{ClassPresence, TypeClosure, TypeGraph, TypeHeader};
pub use matcher::{match_class, MatchIndeterminate, MatchOutcome};
pub use weave::{
    MethodChange, MethodReport, WeaveEngine, WeaveFailure, WeaveMode, WeaveResult, Woven,
};
