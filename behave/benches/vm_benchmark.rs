//! Run with:
//!   cargo bench --bench vm_benchmark

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use behave::{
    AgentState, Blackboard, ComponentHandle, Interpreter, Program, QueryBoard,
    Script, Tick,
};

fn compile(source: &str) -> (Script, Program) {
    let script = Script::parse(source).expect("parse failed");
    let program = script
        .compile()
        .into_program()
        .expect("compilation failed");
    (script, program)
}

/// Ticks `agent` once with zeroed component memory.
fn tick(
    interpreter: &Interpreter<'_>,
    agent: &mut AgentState,
    blackboard: &mut Blackboard,
    memory: &mut [Vec<u8>],
    now: f64,
) {
    let program = interpreter.program();
    let mut components: Vec<ComponentHandle<'_>> = program
        .types()
        .iter()
        .zip(memory.iter_mut())
        .map(|(ty, data)| ComponentHandle {
            type_id: ty.id,
            data: data.as_mut_slice(),
        })
        .collect();
    let mut queries = QueryBoard::new();
    interpreter.execute(agent, Tick {
        components: &mut components,
        lookups: &[],
        blackboard,
        queries: &mut queries,
        now,
        trace: None,
    });
}

fn memory(program: &Program) -> Vec<Vec<u8>> {
    program
        .types()
        .iter()
        .map(|ty| vec![0; ty.size as usize])
        .collect()
}

/// Benchmark 1: a wide sequence of field and variable writes
/// Tests plain node dispatch and expression evaluation.
fn bench_sequence(c: &mut Criterion) {
    let (script, program) = compile(
        r#"
component Mover active:bool speed:float
var count int

graph main
  node r   root
  node s   sequence 4
  node go  write-field Mover active speed
  node c   read-var count
  node add add int
  node inc write-var count
  node stop write-field Mover active
  node cmp gt int
  node opt optional
  link r.child s
  link s.0 go
  link s.1 inc
  link s.2 opt
  link s.3 inc
  link c.out add.a
  link add.out inc.value
  link c.out cmp.a
  link cmp.out opt.guard
  link opt.child stop
  set add.b 1
  set cmp.b 1000
  set go.active true
  set go.speed 3.5
  set stop.active false
end
"#,
    );
    let interpreter = Interpreter::new(&program);
    let mut agent = AgentState::default();
    let mut blackboard = Blackboard::new(&script.blackboard);
    let mut memory = memory(&program);

    c.bench_function("sequence_tick", |b| {
        b.iter(|| {
            tick(
                &interpreter,
                &mut agent,
                &mut blackboard,
                &mut memory,
                black_box(0.0),
            );
        });
    });
}

/// Benchmark 2: a looping parallel branch spawned under a waiting main lane
/// Tests lane scheduling with two live lanes per tick.
fn bench_parallel(c: &mut Criterion) {
    let (script, program) = compile(
        r#"
var count int
var done bool

graph main
  node r    root
  node p    parallel
  node f    read-var done
  node w    wait-until
  node t    thread-root loop
  node c    read-var count
  node add  add int
  node inc  write-var count
  link r.child p
  link p.main w
  link p.parallel t
  link f.out w.condition
  link t.child inc
  link c.out add.a
  link add.out inc.value
  set add.b 1
end
"#,
    );
    let interpreter = Interpreter::new(&program);
    let mut agent = AgentState::default();
    let mut blackboard = Blackboard::new(&script.blackboard);
    let mut memory = memory(&program);

    c.bench_function("parallel_tick", |b| {
        b.iter(|| {
            tick(
                &interpreter,
                &mut agent,
                &mut blackboard,
                &mut memory,
                black_box(0.0),
            );
        });
    });
}

/// Benchmark 3: compiling a graph that invokes a sub-graph many times
fn bench_compile(c: &mut Criterion) {
    let mut source = String::from(
        r#"
var count int

graph bump
  node in  input go:flow
  node c   read-var count
  node add add int
  node inc write-var count
  link in.go inc
  link c.out add.a
  link add.out inc.value
  set add.b 1
end

graph main
  node r root
  node s sequence 32
  link r.child s
"#,
    );
    for i in 0..32 {
        source.push_str(&format!("  node b{i} call bump\n"));
        source.push_str(&format!("  link s.{i} b{i}.go\n"));
    }
    source.push_str("end\n");
    let script = Script::parse(&source).expect("parse failed");

    c.bench_function("compile_32_instances", |b| {
        b.iter(|| black_box(script.compile()));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_sequence, bench_parallel, bench_compile
}

criterion_main!(benches);
