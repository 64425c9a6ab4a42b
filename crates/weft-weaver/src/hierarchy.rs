//! Type graph supplied by the host loader
//!
//! An arena of type headers linked by superclass and interface edges. The
//! transitive supertype closure of each node is computed on first use and
//! cached on the node, so every patch of the catalog shares one walk per
//! class. Walks tolerate cycles and stop at names the graph does not know.

use once_cell::sync::OnceCell;
use rustc_hash::{FxHashMap, FxHashSet};
use std::borrow::Cow;
use std::collections::VecDeque;
use weft_classfile::CompiledClass;

/// Direct supertypes of a type, as declared in its class header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeHeader {
    /// Internal name
    pub name: String,
    /// Superclass internal name
    pub super_name: Option<String>,
    /// Directly implemented (or extended, for interfaces) interfaces
    pub interfaces: Vec<String>,
    /// Whether the type is an interface
    pub is_interface: bool,
}

impl TypeHeader {
    /// Header of a class type
    pub fn class(name: &str, super_name: Option<&str>, interfaces: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            is_interface: false,
        }
    }

    /// Header of an interface type
    pub fn interface(name: &str, extends: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            super_name: None,
            interfaces: extends.iter().map(|s| s.to_string()).collect(),
            is_interface: true,
        }
    }

    /// Header of a decoded class
    pub fn of(class: &CompiledClass) -> Self {
        Self {
            name: class.name.clone(),
            super_name: class.super_name.clone(),
            interfaces: class.interfaces.clone(),
            is_interface: class.is_interface(),
        }
    }
}

/// Transitive supertypes of one type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeClosure {
    /// Superclass chain, nearest first
    pub superclasses: Vec<String>,
    /// Every interface reachable through any supertype edge
    pub interfaces: FxHashSet<String>,
    /// Supertype names the graph could not resolve
    pub unresolved: Vec<String>,
}

impl TypeClosure {
    /// Whether `interface` is in the transitive interface set
    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.contains(interface)
    }

    /// Whether `class` is a (transitive) superclass
    pub fn extends(&self, class: &str) -> bool {
        self.superclasses.iter().any(|c| c == class)
    }

    /// Whether some branch of the walk ended at an unknown name
    pub fn is_partial(&self) -> bool {
        !self.unresolved.is_empty()
    }
}

#[derive(Debug)]
struct TypeNode {
    header: TypeHeader,
    closure: OnceCell<TypeClosure>,
}

/// Arena of known types
#[derive(Debug, Default)]
pub struct TypeGraph {
    nodes: Vec<TypeNode>,
    index: FxHashMap<String, usize>,
}

impl TypeGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a type; replacing clears cached closures
    pub fn insert(&mut self, header: TypeHeader) -> usize {
        if let Some(&id) = self.index.get(&header.name) {
            self.nodes[id].header = header;
            // Any cached closure may have walked through the old edges
            for node in &mut self.nodes {
                node.closure = OnceCell::new();
            }
            return id;
        }
        let id = self.nodes.len();
        self.index.insert(header.name.clone(), id);
        self.nodes.push(TypeNode {
            header,
            closure: OnceCell::new(),
        });
        id
    }

    /// Builder-style `insert`
    pub fn with(mut self, header: TypeHeader) -> Self {
        self.insert(header);
        self
    }

    /// Whether `name` is known
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Header of a known type
    pub fn header(&self, name: &str) -> Option<&TypeHeader> {
        self.index.get(name).map(|&id| &self.nodes[id].header)
    }

    /// Number of known types
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cached closure of a known type
    pub fn closure(&self, name: &str) -> Option<&TypeClosure> {
        let &id = self.index.get(name)?;
        let node = &self.nodes[id];
        Some(node.closure.get_or_init(|| self.walk(&node.header)))
    }

    /// Closure of `header`; cached when the graph knows the type
    ///
    /// A type being loaded is usually not in the graph yet, so its closure is
    /// built from its own header and the graph's view of its supertypes.
    pub fn resolve(&self, header: &TypeHeader) -> Cow<'_, TypeClosure> {
        match self.closure(&header.name) {
            Some(closure) => Cow::Borrowed(closure),
            None => Cow::Owned(self.walk(header)),
        }
    }

    fn walk(&self, start: &TypeHeader) -> TypeClosure {
        let mut closure = TypeClosure::default();
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        seen.insert(start.name.as_str());

        // (name, reached through an interface edge)
        let mut queue: VecDeque<(&str, bool)> = VecDeque::new();
        if let Some(sup) = &start.super_name {
            queue.push_back((sup.as_str(), false));
        }
        for iface in &start.interfaces {
            queue.push_back((iface.as_str(), true));
        }

        while let Some((name, via_interface)) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            let Some(&id) = self.index.get(name) else {
                // The name of an interface edge is known even without its node
                if via_interface {
                    closure.interfaces.insert(name.to_string());
                }
                closure.unresolved.push(name.to_string());
                continue;
            };
            let header = &self.nodes[id].header;
            if header.is_interface || via_interface {
                closure.interfaces.insert(name.to_string());
            } else {
                closure.superclasses.push(name.to_string());
            }
            if let Some(sup) = &header.super_name {
                queue.push_back((sup.as_str(), false));
            }
            for iface in &header.interfaces {
                queue.push_back((iface.as_str(), true));
            }
        }

        closure
    }
}

/// Classpath presence lookup used by skip-if-present guards
pub trait ClassPresence {
    /// Whether a class or interface with this internal name is available
    fn is_present(&self, name: &str) -> bool;
}

impl ClassPresence for TypeGraph {
    fn is_present(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl ClassPresence for FxHashSet<String> {
    fn is_present(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl<P: ClassPresence + ?Sized> ClassPresence for &P {
    fn is_present(&self, name: &str) -> bool {
        (**self).is_present(name)
    }
}
