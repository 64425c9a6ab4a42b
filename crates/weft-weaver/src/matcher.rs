//! Class matcher
//!
//! Pure selection of the catalog definitions that apply to a class, in
//! catalog order. Matching never touches class bodies.

use crate::catalog::{PatchCatalog, PatchDefinition, Selector};
use crate::hierarchy::{ClassPresence, TypeGraph, TypeHeader};
use rustc_hash::FxHashSet;
use tracing::trace;

/// Hierarchical patches could not be ruled in or out for a class
///
/// Treated as a non-match; carried for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchIndeterminate {
    /// Class being matched
    pub class: String,
    /// Supertypes missing from the type graph
    pub unresolved: Vec<String>,
}

/// Result of matching one class
#[derive(Debug, Clone)]
pub struct MatchOutcome<'c> {
    /// Applicable definitions in catalog order
    pub patches: Vec<&'c PatchDefinition>,
    /// Set when part of the hierarchy was unknown
    pub indeterminate: Option<MatchIndeterminate>,
}

impl MatchOutcome<'_> {
    /// Whether nothing applies
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Select the definitions of `catalog` that apply to `class`
pub fn match_class<'c>(
    class: &TypeHeader,
    hierarchy: &TypeGraph,
    catalog: &'c PatchCatalog,
    presence: &dyn ClassPresence,
) -> MatchOutcome<'c> {
    let mut positions: Vec<usize> = catalog.exact_candidates(&class.name).to_vec();
    let mut indeterminate = None;

    let hierarchical = catalog.hierarchical_candidates();
    if !hierarchical.is_empty() && !class.is_interface {
        let closure = hierarchy.resolve(class);
        for &pos in hierarchical {
            let def = &catalog.definitions()[pos];
            let hit = match &def.selector {
                Selector::Interface(iface) => closure.implements(iface),
                Selector::BaseClass(base) => class.name == *base || closure.extends(base),
                _ => false,
            };
            if hit {
                positions.push(pos);
            }
        }
        if closure.is_partial() {
            trace!(
                class = %class.name,
                unresolved = ?closure.unresolved,
                "match indeterminate, unresolved supertypes not walked"
            );
            indeterminate = Some(MatchIndeterminate {
                class: class.name.clone(),
                unresolved: closure.unresolved.clone(),
            });
        }
    }

    positions.sort_unstable();
    positions.dedup();

    // Guards suppress the rest of their own module
    let mut suppressed: FxHashSet<&str> = FxHashSet::default();
    let mut patches = Vec::with_capacity(positions.len());
    for pos in positions {
        let def = &catalog.definitions()[pos];
        let module = def.id.module.as_str();
        if suppressed.contains(module) {
            continue;
        }
        if let Some(symbol) = catalog.guards_of(module).find(|s| presence.is_present(s)) {
            trace!(class = %class.name, module, symbol, "patch module skipped, guard symbol present");
            suppressed.insert(module);
            continue;
        }
        patches.push(def);
    }

    MatchOutcome {
        patches,
        indeterminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PatchId, PatchModule};
    use crate::config::WeaverConfig;
    use weft_classfile::ConstantPool;

    fn def(index: u32, selector: Selector) -> PatchDefinition {
        PatchDefinition {
            id: PatchId::new("", index),
            selector,
            lenient: false,
            class_name: format!("weft/patch/P{index}"),
            pool: ConstantPool::new(),
            methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    fn catalog(modules: Vec<(&str, Vec<Selector>)>) -> PatchCatalog {
        let modules = modules
            .into_iter()
            .map(|(name, selectors)| PatchModule {
                name: name.to_string(),
                version: "1".to_string(),
                definitions: selectors
                    .into_iter()
                    .enumerate()
                    .map(|(i, s)| def(i as u32, s))
                    .collect(),
            })
            .collect();
        let load = PatchCatalog::from_modules(modules, &WeaverConfig::default());
        assert!(load.rejected.is_empty(), "{:?}", load.rejected);
        load.catalog
    }

    fn graph() -> TypeGraph {
        TypeGraph::new()
            .with(TypeHeader::class("java/lang/Object", None, &[]))
            .with(TypeHeader::interface("javax/servlet/Filter", &[]))
            .with(TypeHeader::class(
                "org/eclipse/jetty/server/handler/AbstractHandler",
                Some("java/lang/Object"),
                &[],
            ))
    }

    fn ids(outcome: &MatchOutcome<'_>) -> Vec<String> {
        outcome.patches.iter().map(|p| p.id.to_string()).collect()
    }

    #[test]
    fn test_exact_and_hierarchical_in_catalog_order() {
        let catalog = catalog(vec![
            ("servlet", vec![Selector::Interface("javax/servlet/Filter".to_string())]),
            ("app", vec![Selector::ExactClass("app/GzipFilter".to_string())]),
        ]);
        let graph = graph();
        let class = TypeHeader::class(
            "app/GzipFilter",
            Some("java/lang/Object"),
            &["javax/servlet/Filter"],
        );
        let outcome = match_class(&class, &graph, &catalog, &graph);
        assert_eq!(ids(&outcome), vec!["servlet/0", "app/0"]);
        assert!(outcome.indeterminate.is_none());
    }

    #[test]
    fn test_interface_itself_not_matched() {
        let catalog = catalog(vec![(
            "servlet",
            vec![Selector::Interface("javax/servlet/Filter".to_string())],
        )]);
        let graph = graph();
        let iface = TypeHeader::interface("app/LoggingFilter", &["javax/servlet/Filter"]);
        assert!(match_class(&iface, &graph, &catalog, &graph).is_empty());
    }

    #[test]
    fn test_base_class_matches_itself_and_subclasses() {
        let base = "org/eclipse/jetty/server/handler/AbstractHandler";
        let catalog = catalog(vec![("jetty", vec![Selector::BaseClass(base.to_string())])]);
        let graph = graph();

        let itself = graph.header(base).unwrap().clone();
        assert_eq!(match_class(&itself, &graph, &catalog, &graph).patches.len(), 1);

        let sub = TypeHeader::class("app/Handler", Some(base), &[]);
        assert_eq!(match_class(&sub, &graph, &catalog, &graph).patches.len(), 1);

        let unrelated = TypeHeader::class("app/Other", Some("java/lang/Object"), &[]);
        assert!(match_class(&unrelated, &graph, &catalog, &graph).is_empty());
    }

    #[test]
    fn test_unresolved_supertype_is_non_matching() {
        let catalog = catalog(vec![(
            "servlet",
            vec![Selector::Interface("javax/servlet/Filter".to_string())],
        )]);
        let graph = graph();
        let class = TypeHeader::class("app/Odd", Some("lib/NotLoaded"), &[]);
        let outcome = match_class(&class, &graph, &catalog, &graph);
        assert!(outcome.is_empty());
        assert_eq!(
            outcome.indeterminate,
            Some(MatchIndeterminate {
                class: "app/Odd".to_string(),
                unresolved: vec!["lib/NotLoaded".to_string()],
            })
        );
    }

    #[test]
    fn test_declared_interface_matches_without_graph_node() {
        let catalog = catalog(vec![(
            "servlet",
            vec![Selector::Interface("javax/servlet/Filter".to_string())],
        )]);
        let empty = TypeGraph::new();
        let class = TypeHeader::class("app/GzipFilter", None, &["javax/servlet/Filter"]);
        let outcome = match_class(&class, &empty, &catalog, &empty);
        assert_eq!(outcome.patches.len(), 1);
        assert_eq!(
            outcome.indeterminate,
            Some(MatchIndeterminate {
                class: "app/GzipFilter".to_string(),
                unresolved: vec!["javax/servlet/Filter".to_string()],
            })
        );
    }

    #[test]
    fn test_guard_scoped_to_module() {
        let catalog = catalog(vec![
            (
                "servlet-legacy",
                vec![
                    Selector::SkipIfPresent("jakarta/servlet/Filter".to_string()),
                    Selector::ExactClass("app/GzipFilter".to_string()),
                ],
            ),
            ("app", vec![Selector::ExactClass("app/GzipFilter".to_string())]),
        ]);
        let graph = graph();
        let class = TypeHeader::class("app/GzipFilter", Some("java/lang/Object"), &[]);

        let mut present = FxHashSet::default();
        present.insert("jakarta/servlet/Filter".to_string());
        let outcome = match_class(&class, &graph, &catalog, &present);
        assert_eq!(ids(&outcome), vec!["app/0"]);

        let absent: FxHashSet<String> = FxHashSet::default();
        let outcome = match_class(&class, &graph, &catalog, &absent);
        assert_eq!(ids(&outcome), vec!["servlet-legacy/1", "app/0"]);
    }
}
