//! Patch catalog
//!
//! Patch modules are decoded and validated once at agent startup. The
//! resulting `PatchCatalog` is immutable and shared by reference with the
//! matcher and the coordinator. A malformed module is rejected on its own;
//! loading continues with the others.

mod format;
mod validate;

pub use format::{FormatError, MODULE_MAGIC, MODULE_VERSION};
pub use validate::DefinitionError;

use crate::config::WeaverConfig;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use weft_classfile::{CompiledMethod, ConstantPool, FieldDecl, Insn};

/// File extension of compiled patch modules
pub const MODULE_EXTENSION: &str = "wpatch";

/// Errors raised while building the catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A module file could not be read
    #[error("Failed to read patch module {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// I/O error
        #[source]
        source: std::io::Error,
    },

    /// The module bytes are not a well-formed patch module
    #[error("Malformed patch module {source_label}: {reason}")]
    Format {
        /// File name or caller-supplied label
        source_label: String,
        /// Decoding failure
        #[source]
        reason: FormatError,
    },

    /// A definition failed self-consistency checks
    #[error("Patch module {module}, definition {index}: {reason}")]
    Invalid {
        /// Module name
        module: String,
        /// Definition index within the module
        index: u32,
        /// What is wrong
        #[source]
        reason: DefinitionError,
    },

    /// Two modules share a name
    #[error("Duplicate patch module {0}")]
    DuplicateModule(String),
}

impl CatalogError {
    /// Module name or source label the error refers to
    pub fn module(&self) -> String {
        match self {
            CatalogError::Io { path, .. } => path.display().to_string(),
            CatalogError::Format { source_label, .. } => source_label.clone(),
            CatalogError::Invalid { module, .. } => module.clone(),
            CatalogError::DuplicateModule(module) => module.clone(),
        }
    }
}

/// Stable identity of a patch definition: `module/index`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PatchId {
    /// Owning module
    pub module: String,
    /// Position within the module
    pub index: u32,
}

impl PatchId {
    /// Build a patch id
    pub fn new(module: impl Into<String>, index: u32) -> Self {
        Self {
            module: module.into(),
            index,
        }
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.index)
    }
}

/// What a definition targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// The class with exactly this internal name
    ExactClass(String),
    /// Every class whose transitive interface set includes this interface
    Interface(String),
    /// This class and every class extending it
    BaseClass(String),
    /// Suppresses the rest of its module when this symbol is present
    SkipIfPresent(String),
}

impl Selector {
    /// Internal name the selector refers to
    pub fn name(&self) -> &str {
        match self {
            Selector::ExactClass(n)
            | Selector::Interface(n)
            | Selector::BaseClass(n)
            | Selector::SkipIfPresent(n) => n,
        }
    }

    /// Whether this is a skip-if-present guard
    pub fn is_guard(&self) -> bool {
        matches!(self, Selector::SkipIfPresent(_))
    }

    /// Whether matching needs the type hierarchy
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, Selector::Interface(_) | Selector::BaseClass(_))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::ExactClass(n) => write!(f, "class {n}"),
            Selector::Interface(n) => write!(f, "interface {n}"),
            Selector::BaseClass(n) => write!(f, "base class {n}"),
            Selector::SkipIfPresent(n) => write!(f, "skip if present {n}"),
        }
    }
}

/// A method of a patch definition
#[derive(Debug, Clone, PartialEq)]
pub struct PatchMethod {
    /// Body and verifier metadata as compiled in the patch class
    pub method: CompiledMethod,
    /// Body-less declaration of a method the target must already have
    pub matched: bool,
    /// The method is a trace continuation point
    pub async_continuation: bool,
    /// The method patches a constructor
    pub constructor: bool,
}

impl PatchMethod {
    /// Instruction indices of call-original markers
    pub fn markers(&self) -> Vec<usize> {
        self.method
            .code
            .iter()
            .enumerate()
            .filter(|(_, insn)| matches!(insn, Insn::CallOriginal))
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether the body calls the original method
    pub fn calls_original(&self) -> bool {
        self.method.code.iter().any(|i| matches!(i, Insn::CallOriginal))
    }
}

/// A field of a patch definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchField {
    /// Declaration as compiled in the patch class
    pub decl: FieldDecl,
    /// Injected per-instance state rather than a reference to a target field
    pub new_field: bool,
}

/// One declarative instrumentation unit
#[derive(Debug, Clone, PartialEq)]
pub struct PatchDefinition {
    /// Stable identity
    pub id: PatchId,
    /// Target selector
    pub selector: Selector,
    /// Skip call-original methods the target does not define instead of failing
    pub lenient: bool,
    /// Internal name of the compiled patch class
    pub class_name: String,
    /// Reference pool of the patch class
    pub pool: ConstantPool,
    /// Methods in declaration order
    pub methods: Vec<PatchMethod>,
    /// Fields in declaration order
    pub fields: Vec<PatchField>,
}

impl PatchDefinition {
    /// Whether absent call-original targets are skipped rather than failing
    pub fn skips_absent_methods(&self) -> bool {
        self.lenient || matches!(self.selector, Selector::Interface(_))
    }
}

/// A packaged, versioned group of definitions
#[derive(Debug, Clone, PartialEq)]
pub struct PatchModule {
    /// Module name, unique within a catalog
    pub name: String,
    /// Module version
    pub version: String,
    /// Definitions in module order
    pub definitions: Vec<PatchDefinition>,
}

/// Raw module bytes with a label for diagnostics
#[derive(Debug, Clone)]
pub struct PatchSource {
    /// File name or other label
    pub label: String,
    /// Encoded module
    pub bytes: Vec<u8>,
}

impl PatchSource {
    /// Build a source
    pub fn new(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            bytes,
        }
    }
}

/// Loaded module summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    /// Module name
    pub name: String,
    /// Module version
    pub version: String,
    /// Number of definitions
    pub definitions: usize,
}

/// Outcome of a catalog load: the catalog plus the modules that were rejected
#[derive(Debug)]
pub struct CatalogLoad {
    /// Catalog of every accepted module
    pub catalog: PatchCatalog,
    /// One error per rejected module
    pub rejected: Vec<CatalogError>,
}

/// Immutable set of validated patch definitions, in catalog order
#[derive(Debug, Default)]
pub struct PatchCatalog {
    modules: Vec<ModuleSummary>,
    definitions: Vec<PatchDefinition>,
    by_id: FxHashMap<PatchId, usize>,
    exact: FxHashMap<String, Vec<usize>>,
    hierarchical: Vec<usize>,
}

impl PatchCatalog {
    /// Empty catalog
    pub fn empty() -> Self {
        Self::default()
    }

    /// Decode and validate module sources with the default configuration
    pub fn load(sources: impl IntoIterator<Item = PatchSource>) -> CatalogLoad {
        Self::load_with(sources, &WeaverConfig::default())
    }

    /// Decode and validate module sources, honouring `disabled_modules`
    pub fn load_with(
        sources: impl IntoIterator<Item = PatchSource>,
        config: &WeaverConfig,
    ) -> CatalogLoad {
        let mut modules = Vec::new();
        let mut rejected = Vec::new();

        for source in sources {
            match PatchModule::decode(&source.bytes) {
                Ok(module) => modules.push(module),
                Err(reason) => {
                    warn!(source = %source.label, error = %reason, "rejecting patch module");
                    rejected.push(CatalogError::Format {
                        source_label: source.label,
                        reason,
                    });
                }
            }
        }

        let mut load = Self::from_modules(modules, config);
        rejected.append(&mut load.rejected);
        load.rejected = rejected;
        load
    }

    /// Discover `*.wpatch` files in `dir`, sorted by file name
    ///
    /// An unreadable directory is an error; unreadable files are rejected
    /// individually.
    pub fn load_dir(dir: &Path, config: &WeaverConfig) -> Result<CatalogLoad, CatalogError> {
        let io_err = |source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == MODULE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut sources = Vec::with_capacity(paths.len());
        let mut rejected = Vec::new();
        for path in paths {
            match std::fs::read(&path) {
                Ok(bytes) => {
                    let label = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    sources.push(PatchSource::new(label, bytes));
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "cannot read patch module");
                    rejected.push(CatalogError::Io { path, source });
                }
            }
        }

        let mut load = Self::load_with(sources, config);
        rejected.append(&mut load.rejected);
        load.rejected = rejected;
        debug!(
            dir = %dir.display(),
            modules = load.catalog.modules.len(),
            rejected = load.rejected.len(),
            "patch catalog loaded"
        );
        Ok(load)
    }

    /// Validate already-decoded modules and build the catalog
    pub fn from_modules(modules: Vec<PatchModule>, config: &WeaverConfig) -> CatalogLoad {
        let mut catalog = PatchCatalog::default();
        let mut rejected = Vec::new();

        for module in modules {
            if config.is_module_disabled(&module.name) {
                debug!(module = %module.name, "patch module disabled by configuration");
                continue;
            }
            if catalog.modules.iter().any(|m| m.name == module.name) {
                warn!(module = %module.name, "duplicate patch module");
                rejected.push(CatalogError::DuplicateModule(module.name));
                continue;
            }
            if let Err(err) = validate::validate_module(&module) {
                warn!(module = %module.name, error = %err, "rejecting patch module");
                rejected.push(err);
                continue;
            }
            catalog.push_module(module);
        }

        CatalogLoad { catalog, rejected }
    }

    fn push_module(&mut self, module: PatchModule) {
        self.modules.push(ModuleSummary {
            name: module.name.clone(),
            version: module.version.clone(),
            definitions: module.definitions.len(),
        });

        for mut definition in module.definitions {
            let index = self.definitions.len();
            // Identity always reflects the owning module and position
            definition.id = PatchId::new(&module.name, definition.id.index);
            match &definition.selector {
                Selector::ExactClass(name) => {
                    self.exact.entry(name.clone()).or_default().push(index)
                }
                Selector::Interface(_) | Selector::BaseClass(_) => self.hierarchical.push(index),
                Selector::SkipIfPresent(_) => {}
            }
            self.by_id.insert(definition.id.clone(), index);
            self.definitions.push(definition);
        }
    }

    /// All definitions in catalog order
    pub fn definitions(&self) -> &[PatchDefinition] {
        &self.definitions
    }

    /// Loaded modules in load order
    pub fn modules(&self) -> &[ModuleSummary] {
        &self.modules
    }

    /// Definition by id
    pub fn get(&self, id: &PatchId) -> Option<&PatchDefinition> {
        self.by_id.get(id).map(|&i| &self.definitions[i])
    }

    /// Catalog position of a definition
    pub fn position(&self, id: &PatchId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the catalog has no definitions
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Positions of exact-name definitions for `class`
    pub(crate) fn exact_candidates(&self, class: &str) -> &[usize] {
        self.exact.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Positions of interface and base-class definitions
    pub(crate) fn hierarchical_candidates(&self) -> &[usize] {
        &self.hierarchical
    }

    /// Whether any definition could apply to `class`
    pub fn may_apply(&self, class: &str) -> bool {
        !self.hierarchical.is_empty() || self.exact.contains_key(class)
    }

    /// Guards declared by `module`
    pub(crate) fn guards_of<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.definitions
            .iter()
            .filter(move |d| d.id.module == module)
            .filter_map(|d| match &d.selector {
                Selector::SkipIfPresent(symbol) => Some(symbol.as_str()),
                _ => None,
            })
    }
}
