use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft_classfile::{access, verify_class, Analyzer, CodeBuilder, CompiledClass, Opcode};

fn class_with_methods(count: usize) -> CompiledClass {
    let mut class = CompiledClass::new("bench/Handler", Some("java/lang/Object"));
    let sink = class.pool.method("bench/Sink", "accept", "(I)V");
    for i in 0..count {
        let mut b = CodeBuilder::new();
        let done = b.new_label();
        let top = b.here();
        b.local(Opcode::ILoad, 0)
            .branch(Opcode::IfLe, done)
            .local(Opcode::ILoad, 0)
            .pool(Opcode::InvokeStatic, sink)
            .iinc(0, -1)
            .branch(Opcode::Goto, top)
            .bind(done)
            .op(Opcode::Return);
        let method = b
            .build_method(
                access::STATIC,
                &format!("loop{i}"),
                "(I)V",
                &Analyzer::new(&class.pool),
            )
            .unwrap();
        class.methods.push(method);
    }
    class
}

fn bench_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("class_codec");

    for count in [1usize, 16, 128] {
        let class = class_with_methods(count);
        let bytes = class.encode().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &class, |b, class| {
            b.iter(|| black_box(class).encode().unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &bytes, |b, bytes| {
            b.iter(|| CompiledClass::decode(black_box(bytes)).unwrap());
        });
    }

    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let class = class_with_methods(64);
    c.bench_function("verify_64_methods", |b| {
        b.iter(|| verify_class(black_box(&class), 1024).unwrap());
    });
}

criterion_group!(benches, bench_encode_decode, bench_verify);
criterion_main!(benches);
