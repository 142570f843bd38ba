use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use seqscript::config::EngineConfig;
use seqscript::script::expr::parse_expr;
use seqscript::script::subst::substitute;
use seqscript::script::vars::VariableStore;
use seqscript::script::{CommandTable, NoOperations, Scheduler, Scope, ScriptLibrary, TickOutcome, Value};

const COUNTING_LOOP: &str = "\
total = 0
DoLoop i 1 1000
  If $i % 3 == 0
    total = $total + $i
  ElseIf $i % 5 == 0
    total = $total - 1
  EndIf
EndLoop
";

const FUNCTION_CALLS: &str = "\
Loop 200
  CallFunction Scale 3 4
EndLoop
Function Scale 2 0 a b
  r = $a * $b + 1
EndFunction
";

fn scheduler(src: &str) -> Scheduler<NoOperations> {
    let mut lib = ScriptLibrary::new();
    lib.load_source("main", src).unwrap();
    let mut s = Scheduler::new(lib, CommandTable::builtin(), NoOperations, EngineConfig::default());
    s.start("main").unwrap();
    s
}

fn run(mut s: Scheduler<NoOperations>) {
    while !matches!(s.tick(), TickOutcome::Finished | TickOutcome::Aborted(_)) {}
    black_box(s.take_output());
}

fn bench_dispatch(c: &mut Criterion) {
    let mut g = c.benchmark_group("dispatch");
    g.bench_function("counting_loop_1000", |b| {
        b.iter_batched(|| scheduler(COUNTING_LOOP), run, BatchSize::SmallInput)
    });
    g.bench_function("function_calls_200", |b| {
        b.iter_batched(|| scheduler(FUNCTION_CALLS), run, BatchSize::SmallInput)
    });
    g.bench_function("load_source", |b| {
        b.iter(|| ScriptLibrary::new().load_source("main", black_box(FUNCTION_CALLS)).map(|v| v.len()))
    });
    g.finish();
}

fn bench_line_prep(c: &mut Criterion) {
    let mut vars = VariableStore::new();
    vars.set("x", &Value::Float(12.5), Scope::Regular).unwrap();
    vars.set("label", &Value::Str("grid square".into()), Scope::Regular).unwrap();
    let line = "MoveStageTo ($x * 2) $x label=$label";

    let mut g = c.benchmark_group("line_prep");
    g.bench_function("substitute", |b| b.iter(|| substitute(black_box(line), &vars)));
    g.bench_function("parse_expr", |b| {
        b.iter(|| parse_expr(black_box("(3 + 4) * ABS(-2) >= 10 AND 1 < 2")))
    });
    g.finish();
}

criterion_group!(benches, bench_dispatch, bench_line_prep);
criterion_main!(benches);
