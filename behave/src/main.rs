use clap::Parser as ClapParser;
use std::{fs, process};

use behave::{
    AgentState, Blackboard, ComponentHandle, Constant, Disassembly,
    Interpreter, LookupHandle, Program, QueryBoard, Script, Tick, TraceEvent,
    TraceSink, ValueType,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Behavior script to compile
    #[arg(help = "The behavior script to compile and run")]
    file: String,

    /// Print the compiled program
    #[arg(long, help = "Dump nodes, expressions and constants")]
    dump: bool,

    /// Number of ticks to run
    #[arg(long, default_value_t = 0)]
    ticks: u32,

    /// Seconds between two ticks
    #[arg(long, default_value_t = 0.1)]
    dt: f64,

    /// Print every trace event
    #[arg(long)]
    trace: bool,

    /// Result count reported for every submitted query
    #[arg(long, default_value_t = 1)]
    query_count: u32,

    /// Write the encoded program to this path
    #[arg(long)]
    emit: Option<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let source = match fs::read_to_string(&cli.file) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("Error reading file '{}': {}", cli.file, err);
            process::exit(1);
        }
    };

    let script = match Script::parse(&source) {
        Ok(script) => script,
        Err(err) => {
            eprintln!("Error parsing {}: {}", cli.file, err);
            process::exit(1);
        }
    };

    let compilation = script.compile();
    for warning in &compilation.warnings {
        eprintln!("warning: {warning}");
    }
    for error in &compilation.errors {
        eprintln!("error: {error}");
    }
    let program = match compilation.into_program() {
        Ok(program) => program,
        Err(errors) => {
            eprintln!("{}: {} errors", cli.file, errors.len());
            process::exit(1);
        }
    };

    if cli.dump {
        print!("{}", Disassembly(&program));
    }

    if let Some(path) = &cli.emit {
        if let Err(err) = fs::write(path, program.encode()) {
            eprintln!("Error writing '{path}': {err}");
            process::exit(1);
        }
    }

    if cli.ticks == 0 {
        return;
    }

    let mut memory: Vec<Vec<u8>> = program
        .types()
        .iter()
        .map(|ty| vec![0; ty.size as usize])
        .collect();
    let lookup_memory = zeroed_lookups(&program);
    let lookups = lookup_handles(&program, &lookup_memory);
    let mut blackboard = Blackboard::new(&script.blackboard);
    let mut agent = AgentState::default();
    let board = QueryBoard::new();
    let interpreter = Interpreter::new(&program);

    for tick in 0..cli.ticks {
        let mut components: Vec<ComponentHandle<'_>> = program
            .types()
            .iter()
            .zip(memory.iter_mut())
            .map(|(ty, data)| ComponentHandle {
                type_id: ty.id,
                data: data.as_mut_slice(),
            })
            .collect();
        let mut events: Vec<TraceEvent> = Vec::new();
        let mut queries = board.clone();

        interpreter.execute(&mut agent, Tick {
            components: &mut components,
            lookups: &lookups,
            blackboard: &mut blackboard,
            queries: &mut queries,
            now: f64::from(tick) * cli.dt,
            trace: cli.trace.then_some(&mut events as &mut dyn TraceSink),
        });

        for event in &events {
            println!("{event}");
        }
        for request in board.pending() {
            board.complete(request, cli.query_count);
        }
    }

    for (name, slot) in script.blackboard.iter() {
        let value = scalar(slot.ty, &blackboard.as_bytes()[slot.range()]);
        println!("{name} = {value}");
    }
    for (ty, data) in program.types().iter().zip(&memory) {
        let Some(layout) = script.catalog.get(&ty.name) else {
            continue;
        };
        for field in &layout.fields {
            let start = field.offset as usize;
            let bytes = &data[start..start + field.ty.size()];
            let value = scalar(field.ty, bytes);
            println!("{}.{} = {value}", ty.name, field.name);
        }
    }
}

/// Other entities are simulated as zeroed components of the declared type.
fn zeroed_lookups(program: &Program) -> Vec<Vec<u8>> {
    program
        .lookups()
        .iter()
        .map(|ty| vec![0; ty.as_ref().map_or(0, |t| t.size as usize)])
        .collect()
}

fn lookup_handles<'d>(
    program: &Program,
    memory: &'d [Vec<u8>],
) -> Vec<LookupHandle<'d>> {
    program
        .lookups()
        .iter()
        .zip(memory)
        .map(|(ty, data)| LookupHandle {
            type_id: ty.as_ref().map_or(0, |t| t.id),
            data: data.as_slice(),
        })
        .collect()
}

fn scalar(ty: ValueType, bytes: &[u8]) -> Constant {
    let mut word = [0u8; 4];
    word[..bytes.len()].copy_from_slice(bytes);
    match ty {
        ValueType::Bool => Constant::Bool(bytes[0] != 0),
        ValueType::Int => Constant::Int(i32::from_le_bytes(word)),
        ValueType::Float => Constant::Float(f32::from_le_bytes(word)),
    }
}
