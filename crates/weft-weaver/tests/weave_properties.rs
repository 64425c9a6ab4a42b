//! Behavioural properties of matching and weaving

mod common;

use common::*;
use std::borrow::Cow;
use std::sync::Arc;
use weft_classfile::{access, analyze, CompiledClass, ConstantPool, Insn, Opcode};
use weft_weaver::{
    match_class, MethodChange, PatchCatalog, PatchId, Selector, TransformCoordinator, TypeGraph,
    TypeHeader, WeaveEngine, WeaveError, WeaveMode, WeaveResult, WeaverConfig,
};

const FILTER: &str = "javax/servlet/Filter";

fn engine() -> WeaveEngine {
    WeaveEngine::new(&WeaverConfig::default())
}

fn graph() -> TypeGraph {
    TypeGraph::new()
        .with(TypeHeader::class("java/lang/Object", None, &[]))
        .with(TypeHeader::interface(FILTER, &[]))
}

fn weave_matched(class: CompiledClass, catalog: &PatchCatalog, graph: &TypeGraph) -> WeaveResult {
    let header = TypeHeader::of(&class);
    let outcome = match_class(&header, graph, catalog, graph);
    engine().weave(class, &outcome.patches, WeaveMode::Load)
}

#[test]
fn test_unmatched_class_passes_through_byte_identical() {
    let catalog = catalog(vec![module(
        "app",
        vec![tracing_definition(
            Selector::ExactClass("app/Other".to_string()),
            "weft/patch/OtherPatch",
        )],
    )]);
    let graph = graph();
    let class = handler_class("app/Plain", &[], 7);
    let bytes = class.encode().unwrap();

    let result = weave_matched(CompiledClass::decode(&bytes).unwrap(), &catalog, &graph);
    let woven = expect_woven(result);
    assert!(woven.applied.is_empty());
    assert_eq!(woven.class.encode().unwrap(), bytes);

    let coordinator = TransformCoordinator::new(Arc::new(catalog), WeaverConfig::default());
    let out = coordinator.on_class_load("app/Plain", &bytes, &graph);
    assert!(matches!(out, Cow::Borrowed(_)));
    assert_eq!(out.as_ref(), bytes.as_slice());
}

#[test]
fn test_executed_count_is_patch_plus_k_copies() {
    // static int scale(int x) { return x * 3; }
    let mut target = class("app/Scaler", &[]);
    let original = method(access::PUBLIC | access::STATIC, "scale", "(I)I", &target.pool, |b| {
        b.local(Opcode::ILoad, 0)
            .iconst(3)
            .op(Opcode::IMul)
            .op(Opcode::IReturn);
    });
    let original_len = original.code.len();
    target.methods.push(original);

    for k in 1..=3usize {
        let pool = ConstantPool::new();
        let patch = method(access::PUBLIC | access::STATIC, "scale", "(I)I", &pool, |b| {
            for i in 0..k {
                b.call_original();
                if i + 1 < k {
                    b.op(Opcode::Pop);
                }
            }
            b.op(Opcode::IReturn);
        });
        let non_marker = patch.code.iter().filter(|i| !matches!(i, Insn::CallOriginal)).count();
        let catalog = catalog(vec![module(
            "scale",
            vec![definition(
                Selector::ExactClass("app/Scaler".to_string()),
                "weft/patch/ScalerPatch",
                pool,
                vec![patch_method(patch)],
                Vec::new(),
            )],
        )]);

        let result = weave_matched(target.clone(), &catalog, &graph());
        let woven = expect_woven(result);
        let merged = woven.class.find_method("scale", "(I)I").unwrap();
        assert_eq!(straight_line_count(merged), non_marker + k * original_len, "k = {k}");
        assert_eq!(woven.methods[0].change, MethodChange::Spliced { markers: k });
    }
}

#[test]
fn test_weaving_is_idempotent() {
    let catalog = Arc::new(catalog(vec![module(
        "servlet",
        vec![tracing_definition(
            Selector::Interface(FILTER.to_string()),
            "weft/patch/FilterPatch",
        )],
    )]));
    let graph = graph();
    let bytes = handler_class("app/GzipFilter", &[FILTER], 1).encode().unwrap();

    let first = TransformCoordinator::new(catalog.clone(), WeaverConfig::default());
    let second = TransformCoordinator::new(catalog, WeaverConfig::default());
    let a = first.on_class_load("app/GzipFilter", &bytes, &graph).into_owned();
    let b = second.on_class_load("app/GzipFilter", &bytes, &graph).into_owned();
    assert_ne!(a, bytes);
    assert_eq!(a, b);

    // Cached answer is the same bytes again
    let c = first.on_class_load("app/GzipFilter", &bytes, &graph).into_owned();
    assert_eq!(a, c);
    assert_eq!(first.stats().cache_hits, 1);
}

/// `static int resume(int state)`: `boundaries` switch arms each return with
/// a leftover suspend token below the result
fn resumable(boundaries: usize) -> CompiledClass {
    let mut c = class("app/Continuation", &[]);
    let m = method(access::PUBLIC | access::STATIC, "resume", "(I)I", &c.pool, |b| {
        if boundaries == 0 {
            b.local(Opcode::ILoad, 0).op(Opcode::IReturn);
            return;
        }
        let arms: Vec<_> = (0..boundaries).map(|_| b.new_label()).collect();
        let done = b.new_label();
        b.local(Opcode::ILoad, 0).table_switch(0, done, &arms);
        for (i, arm) in arms.into_iter().enumerate() {
            b.bind(arm)
                .iconst(100 + i as i32)
                .iconst(i as i32)
                .op(Opcode::IReturn);
        }
        b.bind(done).iconst(-1).op(Opcode::IReturn);
    });
    c.methods.push(m);
    c
}

#[test]
fn test_suspend_exits_are_rebalanced() {
    for boundaries in [0usize, 1, 3] {
        let pool = ConstantPool::new();
        let patch = method(access::PUBLIC | access::STATIC, "resume", "(I)I", &pool, |b| {
            b.call_original().op(Opcode::IReturn);
        });
        let catalog = catalog(vec![module(
            "coroutines",
            vec![definition(
                Selector::ExactClass("app/Continuation".to_string()),
                "weft/patch/ContinuationPatch",
                pool,
                vec![patch_method(patch)],
                Vec::new(),
            )],
        )]);

        let result = weave_matched(resumable(boundaries), &catalog, &graph());
        let woven = expect_woven(result);
        assert_eq!(woven.methods[0].discards, boundaries);

        let merged = woven.class.find_method("resume", "(I)I").unwrap();
        let pops = merged.code.iter().filter(|i| **i == Insn::Op(Opcode::Pop)).count();
        assert_eq!(pops, boundaries);

        // Depth where the patch resumes matches a plain call: the result only
        let resume_at = merged.code.len() - 1;
        let flow = analyze(merged, &woven.class.pool).unwrap();
        let frame = flow.frame_at(resume_at).unwrap();
        assert_eq!(frame.stack_slots(), 1, "boundaries = {boundaries}");
    }
}

#[test]
fn test_interface_patch_weaves_every_implementation() {
    let catalog = catalog(vec![module(
        "servlet",
        vec![tracing_definition(
            Selector::Interface(FILTER.to_string()),
            "weft/patch/FilterPatch",
        )],
    )]);
    let graph = graph();

    for (name, marker) in [("app/GzipFilter", 1), ("app/AuthFilter", 2)] {
        let class = handler_class(name, &[FILTER], marker);
        let outcome = match_class(&TypeHeader::of(&class), &graph, &catalog, &graph);
        assert_eq!(outcome.patches.len(), 1);
        assert_eq!(outcome.patches[0].id, PatchId::new("servlet", 0));

        let result = engine().weave(class, &outcome.patches, WeaveMode::Load);
        let woven = expect_woven(result);
        let handle = woven.class.find_method("handle", "()V").unwrap();
        assert!(invokes(handle, &woven.class, TRACER, "enter"));
        assert!(handle.code.contains(&Insn::IConst(marker)));
    }
}

#[test]
fn test_skip_if_present_guard() {
    let catalog = catalog(vec![module(
        "servlet-legacy",
        vec![
            guard("jakarta/servlet/Filter"),
            tracing_definition(
                Selector::ExactClass("app/GzipFilter".to_string()),
                "weft/patch/GzipPatch",
            ),
        ],
    )]);
    let header = TypeHeader::of(&handler_class("app/GzipFilter", &[], 1));

    let absent = graph();
    let outcome = match_class(&header, &absent, &catalog, &absent);
    assert_eq!(outcome.patches.len(), 1);
    assert_eq!(outcome.patches[0].id, PatchId::new("servlet-legacy", 1));

    let present = graph().with(TypeHeader::interface("jakarta/servlet/Filter", &[]));
    assert!(match_class(&header, &present, &catalog, &present).is_empty());
}

#[test]
fn test_failure_is_isolated_to_its_class() {
    let pool = ConstantPool::new();
    let close = method(access::PUBLIC, "close", "()V", &pool, |b| {
        b.call_original().op(Opcode::Return);
    });
    let catalog = catalog(vec![module(
        "app",
        vec![
            definition(
                Selector::ExactClass("app/A".to_string()),
                "weft/patch/APatch",
                pool,
                vec![patch_method(close)],
                Vec::new(),
            ),
            tracing_definition(Selector::ExactClass("app/B".to_string()), "weft/patch/BPatch"),
        ],
    )]);
    let graph = graph();

    let a = handler_class("app/A", &[], 1);
    let result = weave_matched(a.clone(), &catalog, &graph);
    assert_eq!(result.class(), &a);
    let failure = result.failure().unwrap();
    assert_eq!(failure.patch, Some(PatchId::new("app", 0)));
    assert_eq!(
        failure.error,
        WeaveError::UnresolvedMarker {
            method: "close()V".to_string()
        }
    );

    let result = weave_matched(handler_class("app/B", &[], 2), &catalog, &graph);
    assert!(result.is_woven());
    let handle = result.class().find_method("handle", "()V").unwrap();
    assert!(invokes(handle, result.class(), TRACER, "enter"));
}
