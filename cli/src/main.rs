use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use rill_core::rt::Driver;
use rill_core::vm::{Const, Opcode, Program, ProgramBuilder, ProgramImage, Vm, VmConfig};

const DEFAULT_TRACE_FILTER: &str = "rill_core=info,rill_stdlib=info,rill=info";


#[derive(Debug, Parser)]
#[command(
    name = "rill",
    author,
    version,
    about = "CLI for the Rill scripting language runtime",
    long_about = None
)]
struct CliArgs {
    #[command(subcommand)]
    command: Option<Commands>,

    /// If no subcommand, treat as a program image to execute
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// TOML file with VM tuning (stack limit, heap generations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a compiled program image (.rilb)
    Run { file: PathBuf },
    /// Print a disassembly listing of a program image
    Disasm { file: PathBuf },
    /// Build and run the built-in demo program
    Demo,
}

#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    #[serde(default)]
    vm: VmConfig,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("RILL_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_TRACE_FILTER));
    // A second init (e.g. in tests) is fine; keep the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    match path {
        None => Ok(CliConfig::default()),
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("read config {}", p.display()))?;
            toml::from_str(&text).with_context(|| format!("parse config {}", p.display()))
        }
    }
}

fn load_image(path: &Path) -> Result<ProgramImage> {
    let bytes = std::fs::read(path).with_context(|| format!("read image {}", path.display()))?;
    ProgramImage::decode(&bytes).with_context(|| format!("decode image {}", path.display()))
}

fn execute(program: Program, cfg: VmConfig) -> Result<()> {
    rill_stdlib::install();
    let mut vm = Vm::with_config(Arc::new(program), cfg);
    let main = vm.spawn_main(&[])?;
    let mut driver = Driver::new()?;
    let result = driver.run_program(&mut vm, main)?;
    for line in vm.take_echo() {
        println!("{line}");
    }
    println!("=> {}", vm.render(result));
    Ok(())
}

/// Sum 1..=10, echo the accumulator, return it.
fn demo_program() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 8, 0)?;
    b.op_ad(Opcode::Movi, 4, 0);
    b.op_ad(Opcode::Movi, 5, 10);
    let loop_head = b.pc();
    b.op_abc(Opcode::Mov, 6, 5, 0);
    b.op_ad(Opcode::Gti, 6, 0);
    b.op_ad(Opcode::Test, 6, 3);
    b.op_abc(Opcode::Add, 4, 4, 5);
    b.op_ad(Opcode::Subi, 5, 1);
    b.op_e(Opcode::Jmpi, loop_head);
    b.op_a(Opcode::Echo, 4);
    b.op_a(Opcode::Ret, 4);
    b.set_entry(main);
    // Touch the constant table so demo images exercise LOAD as well.
    b.konst(Const::Str("demo".into()))?;
    b.finish()
}

fn main() -> Result<()> {
    init_tracing();
    let args = CliArgs::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Some(Commands::Run { file }) => {
            let image = load_image(&file)?;
            execute(image.program, config.vm)
        }
        Some(Commands::Disasm { file }) => {
            let image = load_image(&file)?;
            print!("{}", image.program.disassemble());
            Ok(())
        }
        Some(Commands::Demo) => execute(demo_program()?, config.vm),
        None => match args.file {
            Some(file) => {
                let image = load_image(&file)?;
                execute(image.program, config.vm)
            }
            None => {
                execute(demo_program()?, config.vm)
            }
        },
    }
}
