use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rune_vm::{Config, Error, ExportKind, Module, Value, Vm};

mod demo;

#[derive(Parser)]
#[command(name = "rune-vm")]
#[command(about = "Embeddable register-based bytecode virtual machine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a module's sections, imports and exports.
    Info {
        #[arg(help = "Input .rune module")]
        input: PathBuf,

        #[arg(long, help = "Emit machine-readable JSON")]
        json: bool,
    },

    /// Load a module, register the demo `env` host set, and call an export.
    Run {
        #[arg(help = "Input .rune module")]
        input: PathBuf,

        #[arg(help = "Exported function to call")]
        export: String,

        #[arg(
            allow_hyphen_values = true,
            help = "Arguments: 42, i64:9, f32:1.5, f64:2.5, ptr:0x10, true"
        )]
        args: Vec<String>,

        #[arg(long, help = "Instruction budget per call (0 = unlimited)")]
        fuel_limit: Option<u64>,

        #[arg(long, help = "Maximum call depth")]
        stack_size: Option<u32>,

        #[arg(long, help = "Linear memory cap in bytes")]
        memory_limit: Option<u64>,
    },

    /// Assemble the built-in demo plugin; write it out or run it.
    Demo {
        #[arg(short, long, help = "Write the module here instead of running it")]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { input, json } => {
            let module = load_module(&input)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info_json(&module))?);
            } else {
                print_info(&input, &module);
            }
        }
        Commands::Run {
            input,
            export,
            args,
            fuel_limit,
            stack_size,
            memory_limit,
        } => {
            let module = load_module(&input)?;
            let mut config = Config::default();
            if let Some(fuel) = fuel_limit {
                config.fuel_limit = fuel;
            }
            if let Some(depth) = stack_size {
                config.stack_size = depth;
            }
            if let Some(bytes) = memory_limit {
                config.memory_limit = bytes;
            }

            let values = args
                .iter()
                .map(|raw| parse_value(raw))
                .collect::<Result<Vec<_>>>()?;

            let mut vm = Vm::new(&module, config);
            register_env(&mut vm)?;
            init_vm(&mut vm)?;

            match vm.call(&export, &values) {
                Ok(result) => {
                    println!("{export}({}) = {result}", args.join(", "));
                    println!("fuel used: {}", vm.fuel_used());
                }
                Err(err) => {
                    bail!("{export} trapped: {err} ({})", vm.last_error());
                }
            }
        }
        Commands::Demo { out } => {
            let bytes = demo::build();
            if let Some(path) = out {
                fs::write(&path, &bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote demo module to {} ({} bytes)", path.display(), bytes.len());
            } else {
                run_demo(&bytes)?;
            }
        }
    }

    Ok(())
}

fn load_module(path: &PathBuf) -> Result<Module> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Module::load(&bytes).with_context(|| format!("Failed to load {}", path.display()))
}

/// The `env` host set every `run` gets: console output plus a clock.
fn register_env(vm: &mut Vm<'_>) -> Result<()> {
    vm.register("env", "print_i32", |_ctx, args| {
        match args {
            [value, ..] => println!("[guest] {}", value.as_i32()),
            [] => return Err(Error::Type("print_i32 takes one argument".into())),
        }
        Ok(Value::Void)
    })?;

    vm.register("env", "print_str", |ctx, args| {
        let [ptr, len, ..] = args else {
            return Err(Error::Type("print_str takes (ptr, len)".into()));
        };
        let bytes = ctx.mem_read(ptr.as_i32() as u32, len.as_i32() as u32)?;
        println!("[guest] {}", String::from_utf8_lossy(bytes));
        Ok(Value::Void)
    })?;

    vm.register("env", "get_time", |_ctx, _args| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Host(e.to_string()))?;
        Ok(Value::I64(now.as_secs() as i64))
    })?;

    Ok(())
}

fn init_vm(vm: &mut Vm<'_>) -> Result<()> {
    vm.init()
        .map_err(|err| anyhow::anyhow!("init failed: {err} ({})", vm.last_error()))
}

/// Full demo lifecycle in-process: assemble, load, register, init, call.
fn run_demo(bytes: &[u8]) -> Result<()> {
    let module = Module::load(bytes).context("demo module should load")?;
    let mut vm = Vm::new(&module, Config::default());
    register_env(&mut vm)?;
    init_vm(&mut vm)?;

    let sum = vm.call("compute", &[Value::I32(2), Value::I32(40)])?;
    println!("compute(2, 40) = {sum}");

    vm.call("greet", &[])?;

    let ts = vm.call("timestamp", &[])?;
    println!("timestamp() = {ts}");
    println!("fuel used: {}", vm.fuel_used());
    Ok(())
}

fn print_info(path: &PathBuf, module: &Module) {
    println!("{}", path.display());
    println!("  types:   {}", module.types().len());
    println!(
        "  funcs:   {} ({} imported)",
        module.func_count(),
        module.import_count()
    );

    for import in module.imports() {
        println!("  import   {}::{}", import.module, import.name);
    }
    for export in module.exports() {
        let kind = match export.kind {
            ExportKind::Func => "func",
            ExportKind::Memory => "memory",
        };
        println!("  export   {} {} (index {})", kind, export.name, export.index);
    }

    if let Some(memory) = module.memory() {
        println!(
            "  memory:  {} pages initial, {} max",
            memory.initial_pages,
            memory.effective_max()
        );
    }
    println!("  globals: {}", module.globals().len());
    println!("  data:    {} segments", module.data_segments().len());
    if let Some(init) = module.init_func() {
        println!("  _init:   function {init}");
    }
}

fn info_json(module: &Module) -> serde_json::Value {
    serde_json::json!({
        "types": module.types().len(),
        "funcs": module.func_count(),
        "imports": module
            .imports()
            .iter()
            .map(|i| serde_json::json!({ "module": i.module, "name": i.name }))
            .collect::<Vec<_>>(),
        "exports": module
            .exports()
            .iter()
            .map(|e| {
                serde_json::json!({
                    "kind": match e.kind {
                        ExportKind::Func => "func",
                        ExportKind::Memory => "memory",
                    },
                    "name": e.name,
                    "index": e.index,
                })
            })
            .collect::<Vec<_>>(),
        "memory": module.memory().map(|m| {
            serde_json::json!({
                "initial_pages": m.initial_pages,
                "max_pages": m.effective_max(),
            })
        }),
        "globals": module.globals().len(),
        "data_segments": module.data_segments().len(),
        "init_func": module.init_func(),
    })
}

/// Parse a command-line argument into a guest value. Plain integers are
/// i32; other scalars use a `kind:` prefix.
fn parse_value(raw: &str) -> Result<Value> {
    if raw == "true" {
        return Ok(Value::Bool(true));
    }
    if raw == "false" {
        return Ok(Value::Bool(false));
    }
    if let Some(rest) = raw.strip_prefix("i64:") {
        return Ok(Value::I64(rest.parse().context("bad i64 argument")?));
    }
    if let Some(rest) = raw.strip_prefix("f32:") {
        return Ok(Value::F32(rest.parse().context("bad f32 argument")?));
    }
    if let Some(rest) = raw.strip_prefix("f64:") {
        return Ok(Value::F64(rest.parse().context("bad f64 argument")?));
    }
    if let Some(rest) = raw.strip_prefix("ptr:") {
        let offset = rest
            .strip_prefix("0x")
            .map_or_else(|| rest.parse(), |hex| u32::from_str_radix(hex, 16))
            .context("bad ptr argument")?;
        return Ok(Value::Ptr(offset));
    }
    Ok(Value::I32(raw.parse().with_context(|| {
        format!("cannot parse argument '{raw}' (use i64:/f32:/f64:/ptr: prefixes)")
    })?))
}
