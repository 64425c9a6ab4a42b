//! Shared fixtures for the weaver integration tests

#![allow(dead_code)]

use weft_classfile::{
    access, Analyzer, CodeBuilder, CompiledClass, CompiledMethod, ConstantPool, Insn, Opcode,
};
use weft_weaver::{
    PatchCatalog, PatchDefinition, PatchField, PatchId, PatchMethod, PatchModule, PatchSource,
    Selector, WeaveResult, WeaverConfig, Woven,
};

pub const TRACER: &str = "weft/runtime/Tracer";

/// Build a method whose limits and frames come from analysis
pub fn method(
    flags: u16,
    name: &str,
    descriptor: &str,
    pool: &ConstantPool,
    body: impl FnOnce(&mut CodeBuilder),
) -> CompiledMethod {
    let mut b = CodeBuilder::new();
    body(&mut b);
    b.build_method(
        flags,
        name,
        descriptor,
        &Analyzer::new(pool).allow_call_original(true),
    )
    .expect("fixture method should build")
}

/// Class with a `java/lang/Object` superclass and the given interfaces
pub fn class(name: &str, interfaces: &[&str]) -> CompiledClass {
    let mut class = CompiledClass::new(name, Some("java/lang/Object"));
    class.interfaces = interfaces.iter().map(|s| s.to_string()).collect();
    class
}

/// Instance method `handle()V` pushing and dropping `marker`
pub fn handler_class(name: &str, interfaces: &[&str], marker: i32) -> CompiledClass {
    let mut c = class(name, interfaces);
    let handle = method(access::PUBLIC, "handle", "()V", &c.pool, |b| {
        b.iconst(marker).op(Opcode::Pop).op(Opcode::Return);
    });
    c.methods.push(handle);
    c
}

pub fn patch_method(method: CompiledMethod) -> PatchMethod {
    PatchMethod {
        method,
        matched: false,
        async_continuation: false,
        constructor: false,
    }
}

/// Patch class pool with the class itself and `Tracer.enter()V`
pub fn patch_pool(patch_class: &str) -> (ConstantPool, u16) {
    let mut pool = ConstantPool::new();
    pool.class(patch_class);
    let enter = pool.method(TRACER, "enter", "()V");
    (pool, enter)
}

/// `handle()V { Tracer.enter(); <original> }`
pub fn tracing_definition(selector: Selector, patch_class: &str) -> PatchDefinition {
    let (pool, enter) = patch_pool(patch_class);
    let handle = method(access::PUBLIC, "handle", "()V", &pool, |b| {
        b.pool(Opcode::InvokeStatic, enter)
            .call_original()
            .op(Opcode::Return);
    });
    definition(selector, patch_class, pool, vec![patch_method(handle)], Vec::new())
}

pub fn definition(
    selector: Selector,
    patch_class: &str,
    pool: ConstantPool,
    methods: Vec<PatchMethod>,
    fields: Vec<PatchField>,
) -> PatchDefinition {
    PatchDefinition {
        id: PatchId::new("", 0),
        selector,
        lenient: false,
        class_name: patch_class.to_string(),
        pool,
        methods,
        fields,
    }
}

pub fn guard(symbol: &str) -> PatchDefinition {
    definition(
        Selector::SkipIfPresent(symbol.to_string()),
        "weft/patch/Guard",
        ConstantPool::new(),
        Vec::new(),
        Vec::new(),
    )
}

pub fn module(name: &str, definitions: Vec<PatchDefinition>) -> PatchModule {
    PatchModule {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        definitions: definitions
            .into_iter()
            .enumerate()
            .map(|(i, mut d)| {
                d.id = PatchId::new(name, i as u32);
                d
            })
            .collect(),
    }
}

/// Catalog built through the binary module format
pub fn catalog(modules: Vec<PatchModule>) -> PatchCatalog {
    let sources = modules.iter().map(|m| {
        PatchSource::new(
            format!("{}.wpatch", m.name),
            m.encode().expect("fixture module should encode"),
        )
    });
    let load = PatchCatalog::load_with(sources.collect::<Vec<_>>(), &WeaverConfig::default());
    assert!(load.rejected.is_empty(), "{:?}", load.rejected);
    load.catalog
}

/// Executed instruction count of a call through a method without
/// conditional branches, following `GOTO`s
pub fn straight_line_count(method: &CompiledMethod) -> usize {
    let mut at = 0;
    let mut executed = 0;
    loop {
        let insn = &method.code[at];
        executed += 1;
        match insn {
            Insn::Branch(Opcode::Goto, target) => at = *target,
            Insn::Branch(op, _) => panic!("conditional branch {op:?} in straight-line method"),
            _ if insn.opcode().is_return() => return executed,
            _ => at += 1,
        }
        assert!(executed <= 10_000, "runaway trace");
    }
}

pub fn invokes(method: &CompiledMethod, class: &CompiledClass, owner: &str, name: &str) -> bool {
    method.code.iter().any(|insn| match insn {
        Insn::Pool(op, index) if op.is_invoke() => class
            .pool
            .member(*index)
            .is_some_and(|m| m.class == owner && m.name == name),
        _ => false,
    })
}

pub fn expect_woven(result: WeaveResult) -> Woven {
    match result {
        WeaveResult::Woven(woven) => woven,
        WeaveResult::Failed { failure, .. } => panic!("weave failed: {failure:?}"),
    }
}
