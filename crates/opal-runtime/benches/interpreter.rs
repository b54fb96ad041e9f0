//! Interpreter microbenchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use opal_runtime::VmConfig;
use opal_runtime::Vm;

const FIB: &str = "\
fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
fib(15);";

const LOOP_SUM: &str = "\
var total = 0;
for (var i = 0; i < 10000; i = i + 1) { total = total + i; }";

const STRING_BUILD: &str = "\
var out = \"\";
for (var i = 0; i < 200; i = i + 1) { out = out + \"x\"; }";

const METHOD_CALLS: &str = "\
class Counter { init() { this.n = 0; } bump() { this.n = this.n + 1; } }
var c = Counter();
for (var i = 0; i < 5000; i = i + 1) { c.bump(); }";

fn run(source: &str) {
    let mut vm = Vm::new(VmConfig {
        suppress_print: true,
        ..VmConfig::default()
    });
    vm.interpret(black_box(source)).expect("benchmark program runs");
}

fn interpreter_benches(c: &mut Criterion) {
    c.bench_function("fib_15", |b| b.iter(|| run(FIB)));
    c.bench_function("loop_sum_10k", |b| b.iter(|| run(LOOP_SUM)));
    c.bench_function("string_build_200", |b| b.iter(|| run(STRING_BUILD)));
    c.bench_function("method_calls_5k", |b| b.iter(|| run(METHOD_CALLS)));
}

criterion_group!(benches, interpreter_benches);
criterion_main!(benches);
