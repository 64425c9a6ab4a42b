//! Load and retransform hooks of the transform coordinator

mod common;

use common::*;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use weft_classfile::{access, CompiledClass, ConstantPool, FieldDecl, Opcode};
use weft_weaver::{
    ClassRedefiner, LoadedClass, PatchCatalog, PatchDefinition, PatchField, PatchId,
    RedefineError, Selector, TransformCoordinator, TypeGraph, TypeHeader, WeaveEngine, WeaveError,
    WeaveFailureReport, WeaveListener, WeaveMode, WeaverConfig,
};

#[derive(Default)]
struct Recorder {
    failures: Mutex<Vec<WeaveFailureReport>>,
    applied: Mutex<Vec<(String, Vec<PatchId>)>>,
}

impl WeaveListener for Recorder {
    fn on_weave_failed(&self, report: &WeaveFailureReport) {
        self.failures.lock().push(report.clone());
    }

    fn on_weave_applied(&self, class: &str, patches: &[PatchId]) {
        self.applied.lock().push((class.to_string(), patches.to_vec()));
    }
}

#[derive(Default)]
struct Redefiner {
    installed: Mutex<Vec<(String, Vec<u8>)>>,
    refuse: bool,
}

impl ClassRedefiner for Redefiner {
    fn redefine(&self, class: &str, bytes: &[u8]) -> Result<(), RedefineError> {
        if self.refuse {
            return Err(RedefineError::Rejected {
                class: class.to_string(),
                reason: "schema change".to_string(),
            });
        }
        self.installed.lock().push((class.to_string(), bytes.to_vec()));
        Ok(())
    }
}

fn graph() -> TypeGraph {
    TypeGraph::new()
        .with(TypeHeader::class("java/lang/Object", None, &[]))
        .with(TypeHeader::interface("javax/servlet/Filter", &[]))
}

fn exact(class: &str) -> Selector {
    Selector::ExactClass(class.to_string())
}

/// `app/Service` with `handle()V` and `close()V`
fn service() -> CompiledClass {
    let mut c = handler_class("app/Service", &[], 5);
    let close = method(access::PUBLIC, "close", "()V", &c.pool, |b| {
        b.op(Opcode::Return);
    });
    c.methods.push(close);
    c
}

/// `close()V { Tracer.enter(); <original> }`
fn close_definition() -> PatchDefinition {
    let (pool, enter) = patch_pool("weft/patch/ClosePatch");
    let close = method(access::PUBLIC, "close", "()V", &pool, |b| {
        b.pool(Opcode::InvokeStatic, enter)
            .call_original()
            .op(Opcode::Return);
    });
    definition(
        exact("app/Service"),
        "weft/patch/ClosePatch",
        pool,
        vec![patch_method(close)],
        Vec::new(),
    )
}

fn coordinator(
    catalog: PatchCatalog,
    config: WeaverConfig,
) -> (TransformCoordinator, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let coordinator =
        TransformCoordinator::new(Arc::new(catalog), config).with_listener(recorder.clone());
    (coordinator, recorder)
}

#[test]
fn test_concurrent_loads() {
    let catalog = catalog(vec![module(
        "servlet",
        vec![tracing_definition(
            Selector::Interface("javax/servlet/Filter".to_string()),
            "weft/patch/FilterPatch",
        )],
    )]);
    let (coordinator, recorder) = coordinator(catalog, WeaverConfig::default());
    let graph = graph();

    let classes: Vec<(String, Vec<u8>)> = (0..16)
        .map(|i| {
            let name = format!("app/Filter{i}");
            let bytes = handler_class(&name, &["javax/servlet/Filter"], i).encode().unwrap();
            (name, bytes)
        })
        .collect();

    std::thread::scope(|scope| {
        for chunk in classes.chunks(4) {
            let coordinator = &coordinator;
            let graph = &graph;
            scope.spawn(move || {
                for (name, bytes) in chunk {
                    let out = coordinator.on_class_load(name, bytes, graph);
                    assert!(matches!(out, Cow::Owned(_)), "{name} not woven");
                }
            });
        }
    });

    let stats = coordinator.stats();
    assert_eq!(stats.classes_seen, 16);
    assert_eq!(stats.woven, 16);
    assert_eq!(stats.failed, 0);
    assert_eq!(recorder.applied.lock().len(), 16);
    assert_eq!(
        coordinator.applied_patches("app/Filter3"),
        vec![PatchId::new("servlet", 0)]
    );
}

#[test]
fn test_failures_reported_once_per_class_and_patch() {
    let catalog = catalog(vec![module(
        "app",
        vec![definition(
            exact("app/Service"),
            "weft/patch/ServicePatch",
            ConstantPool::new(),
            vec![patch_method(method(
                access::PUBLIC,
                "flush",
                "()V",
                &ConstantPool::new(),
                |b| {
                    b.call_original().op(Opcode::Return);
                },
            ))],
            Vec::new(),
        )],
    )]);
    let (coordinator, recorder) = coordinator(catalog, WeaverConfig::default());
    let bytes = service().encode().unwrap();

    for _ in 0..3 {
        let out = coordinator.on_class_load("app/Service", &bytes, &graph());
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    let failures = recorder.failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].class, "app/Service");
    assert_eq!(failures[0].patch, Some(PatchId::new("app", 0)));
    assert_eq!(
        failures[0].reason,
        WeaveError::UnresolvedMarker {
            method: "flush()V".to_string()
        }
    );
    assert_eq!(coordinator.stats().failed, 3);
    assert_eq!(coordinator.stats().cache_hits, 2);
}

#[test]
fn test_excluded_and_mismatched_identities() {
    let catalog = catalog(vec![module(
        "app",
        vec![
            tracing_definition(exact("weft/internal/Agent"), "weft/patch/AgentPatch"),
            tracing_definition(exact("app/Service"), "weft/patch/ServicePatch"),
        ],
    )]);
    let (coordinator, recorder) = coordinator(catalog, WeaverConfig::default());

    let agent = handler_class("weft/internal/Agent", &[], 1).encode().unwrap();
    let out = coordinator.on_class_load("weft/internal/Agent", &agent, &graph());
    assert!(matches!(out, Cow::Borrowed(_)));
    assert!(recorder.failures.lock().is_empty());

    let other = handler_class("app/Other", &[], 1).encode().unwrap();
    let out = coordinator.on_class_load("app/Service", &other, &graph());
    assert!(matches!(out, Cow::Borrowed(_)));
    assert_eq!(
        recorder.failures.lock()[0].reason,
        WeaveError::IdentityMismatch {
            expected: "app/Service".to_string(),
            found: "app/Other".to_string(),
        }
    );

    let out = coordinator.on_class_load("app/Service", b"garbage", &graph());
    assert_eq!(out.as_ref(), b"garbage");
}

#[test]
fn test_cache_bound() {
    let catalog = catalog(vec![module(
        "servlet",
        vec![tracing_definition(
            Selector::Interface("javax/servlet/Filter".to_string()),
            "weft/patch/FilterPatch",
        )],
    )]);
    let config = WeaverConfig {
        max_cached_classes: 1,
        ..WeaverConfig::default()
    };
    let (coordinator, _) = coordinator(catalog, config);
    for name in ["app/A", "app/B"] {
        let bytes = handler_class(name, &["javax/servlet/Filter"], 1).encode().unwrap();
        coordinator.on_class_load(name, &bytes, &graph());
    }
    assert_eq!(coordinator.cached_classes(), 1);
    assert_eq!(coordinator.stats().woven, 2);
}

struct Exploding;

impl WeaveListener for Exploding {
    fn on_weave_failed(&self, _report: &WeaveFailureReport) {}

    fn on_weave_applied(&self, _class: &str, _patches: &[PatchId]) {
        panic!("listener bug");
    }
}

#[test]
fn test_success_listener_panic_keeps_woven_bytes() {
    let catalog = catalog(vec![module(
        "app",
        vec![tracing_definition(exact("app/Service"), "weft/patch/ServicePatch")],
    )]);
    let coordinator = TransformCoordinator::new(Arc::new(catalog), WeaverConfig::default())
        .with_listener(Arc::new(Exploding));
    let bytes = service().encode().unwrap();

    let out = coordinator.on_class_load("app/Service", &bytes, &graph());
    assert!(matches!(out, Cow::Owned(_)));
    assert_ne!(out.as_ref(), bytes.as_slice());

    let stats = coordinator.stats();
    assert_eq!(stats.woven, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(
        coordinator.applied_patches("app/Service"),
        vec![PatchId::new("app", 0)]
    );
}

#[test]
fn test_success_listener_panic_keeps_retransformed_patches() {
    let catalog = catalog(vec![module("app", vec![close_definition()])]);
    let coordinator = TransformCoordinator::new(Arc::new(catalog), WeaverConfig::default())
        .with_listener(Arc::new(Exploding));
    let loaded = [LoadedClass {
        name: "app/Service".to_string(),
        bytes: service().encode().unwrap(),
    }];
    let redefiner = Redefiner::default();

    let n = coordinator.retransform(&loaded, &graph(), &[PatchId::new("app", 0)], &redefiner);
    assert_eq!(n, 1);
    assert_eq!(redefiner.installed.lock().len(), 1);
    assert_eq!(
        coordinator.applied_patches("app/Service"),
        vec![PatchId::new("app", 0)]
    );
}

struct PanickingRedefiner;

impl ClassRedefiner for PanickingRedefiner {
    fn redefine(&self, _class: &str, _bytes: &[u8]) -> Result<(), RedefineError> {
        panic!("host bug");
    }
}

#[test]
fn test_panic_during_retransform_is_contained() {
    let catalog = catalog(vec![module("app", vec![close_definition()])]);
    let (coordinator, recorder) = coordinator(catalog, WeaverConfig::default());
    let loaded = [LoadedClass {
        name: "app/Service".to_string(),
        bytes: service().encode().unwrap(),
    }];

    let n = coordinator.retransform(
        &loaded,
        &graph(),
        &[PatchId::new("app", 0)],
        &PanickingRedefiner,
    );
    assert_eq!(n, 0);
    assert!(coordinator.applied_patches("app/Service").is_empty());
    assert_eq!(coordinator.stats().failed, 1);

    let failures = recorder.failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].patch, None);
    assert_eq!(failures[0].reason, WeaveError::Panicked("host bug".to_string()));
}

#[test]
fn test_retransform_adds_patches_incrementally() {
    let catalog = catalog(vec![module(
        "app",
        vec![
            tracing_definition(exact("app/Service"), "weft/patch/HandlePatch"),
            close_definition(),
        ],
    )]);
    let expected_all = {
        let defs: Vec<_> = catalog.definitions().iter().collect();
        WeaveEngine::new(&WeaverConfig::default())
            .weave(service(), &defs, WeaveMode::Load)
            .class()
            .encode()
            .unwrap()
    };
    let (coordinator, _) = coordinator(catalog, WeaverConfig::default());
    let loaded = vec![LoadedClass {
        name: "app/Service".to_string(),
        bytes: service().encode().unwrap(),
    }];
    let redefiner = Redefiner::default();

    let handle = PatchId::new("app", 0);
    let close = PatchId::new("app", 1);

    let n = coordinator.retransform(&loaded, &graph(), &[handle.clone()], &redefiner);
    assert_eq!(n, 1);
    assert_eq!(coordinator.applied_patches("app/Service"), vec![handle.clone()]);

    let both = [handle.clone(), close.clone()];
    let n = coordinator.retransform(&loaded, &graph(), &both, &redefiner);
    assert_eq!(n, 1);
    assert_eq!(coordinator.applied_patches("app/Service"), both.to_vec());

    // Nothing new to add
    let n = coordinator.retransform(&loaded, &graph(), &both, &redefiner);
    assert_eq!(n, 0);

    let installed = redefiner.installed.lock();
    assert_eq!(installed.len(), 2);
    assert_eq!(installed[1].1, expected_all);
    assert_eq!(coordinator.stats().retransformed, 2);
}

#[test]
fn test_retransform_cannot_add_fields() {
    let (mut pool, enter) = patch_pool("weft/patch/StatefulPatch");
    pool.field("weft/patch/StatefulPatch", "started", "J");
    let handle = method(access::PUBLIC, "handle", "()V", &pool, |b| {
        b.pool(Opcode::InvokeStatic, enter)
            .call_original()
            .op(Opcode::Return);
    });
    let catalog = catalog(vec![module(
        "stateful",
        vec![definition(
            exact("app/Service"),
            "weft/patch/StatefulPatch",
            pool,
            vec![patch_method(handle)],
            vec![PatchField {
                decl: FieldDecl::new(access::PRIVATE, "started", "J"),
                new_field: true,
            }],
        )],
    )]);
    let (coordinator, recorder) = coordinator(catalog, WeaverConfig::default());
    let loaded = [LoadedClass {
        name: "app/Service".to_string(),
        bytes: service().encode().unwrap(),
    }];
    let redefiner = Redefiner::default();

    let subset = [PatchId::new("stateful", 0)];
    let n = coordinator.retransform(&loaded, &graph(), &subset, &redefiner);
    assert_eq!(n, 0);
    assert!(redefiner.installed.lock().is_empty());
    assert!(matches!(
        recorder.failures.lock()[0].reason,
        WeaveError::StructuralChangeForbidden(_)
    ));
    assert!(coordinator.applied_patches("app/Service").is_empty());
}

#[test]
fn test_rejected_redefinition_leaves_state() {
    let catalog = catalog(vec![module("app", vec![close_definition()])]);
    let (coordinator, _) = coordinator(catalog, WeaverConfig::default());
    let loaded = [LoadedClass {
        name: "app/Service".to_string(),
        bytes: service().encode().unwrap(),
    }];
    let redefiner = Redefiner {
        refuse: true,
        ..Redefiner::default()
    };

    let n = coordinator.retransform(&loaded, &graph(), &[PatchId::new("app", 0)], &redefiner);
    assert_eq!(n, 0);
    assert!(coordinator.applied_patches("app/Service").is_empty());
    assert_eq!(coordinator.stats().retransformed, 0);
}
