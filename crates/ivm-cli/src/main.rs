//! ivm emulator command line.

use std::fs;
use std::path::PathBuf;
use std::process;

use argh::FromArgs;
use ivm_core::core::catalog::{OpcodeCatalog, PatternConfig};
use ivm_core::core::cpu::{Cpu, HaltReason};
use ivm_core::core::memory::{MemoryImage, DEFAULT_MEM_BYTES};
use ivm_core::errors::{CResult, Fault, SetupError};
use ivm_core::symbols::SymbolIndex;
use ivm_io::driver::{EmulatorIo, IoOptions};
use ivm_io::{console, pipeline};
use log::debug;

mod signal;

const EXIT_WRONG_BINARY_VERSION: i32 = 9;
const EXIT_UNDEFINED_INSTRUCTION: i32 = 4;
const EXIT_IO_TROUBLE: i32 = 7;

/// ivm emulator
#[derive(FromArgs)]
pub struct Args {
    /// memory size in bytes
    #[argh(option, short = 'm', default = "DEFAULT_MEM_BYTES")]
    pub mem_size: u64,

    /// output directory for frame files
    #[argh(option, short = 'o')]
    pub out_dir: Option<PathBuf>,

    /// input directory with PNG frames
    #[argh(option, short = 'i')]
    pub inp_dir: Option<PathBuf>,

    /// data file; the first occurrence is the argument file, the second
    /// the environment file
    #[argh(option, short = 'a')]
    pub attach: Vec<PathBuf>,

    /// load offset of the bytecode in memory
    #[argh(option, short = 'L', default = "0")]
    pub load_offset: u64,

    /// write frame files inline instead of through worker threads
    #[argh(switch)]
    pub serial: bool,

    /// plain interpretation: no pattern fusion, no recoding
    #[argh(switch)]
    pub no_opt: bool,

    /// fault on division by zero instead of yielding zero
    #[argh(switch)]
    pub fault_on_div_zero: bool,

    /// print the per-opcode fetch histogram after the run
    #[argh(switch)]
    pub histogram: bool,

    /// ivm binary file
    #[argh(positional)]
    pub binary: PathBuf,
}

fn main() {
    env_logger::init();
    let args: Args = argh::from_env();

    match run(args) {
        Ok(code) => process::exit(code),
        Err(error) => {
            eprintln!("{}", error);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> CResult<i32> {
    println!("ivm emulator, v{}", env!("CARGO_PKG_VERSION"));
    println!("Compatible with ivm-2.1");
    println!();

    if args.mem_size < 64 {
        return Err(Box::new(SetupError(format!(
            "memory size {} is too small",
            args.mem_size
        ))));
    }

    let program = fs::read(&args.binary).map_err(|e| {
        SetupError(format!("can't open file '{}': {}", args.binary.display(), e))
    })?;
    let symbols = SymbolIndex::for_binary(&args.binary);

    let mut config = if args.no_opt {
        PatternConfig::none()
    } else {
        PatternConfig::full()
    };
    config.fault_on_div_zero = args.fault_on_div_zero;

    let workers = if args.serial {
        None
    } else {
        Some(pipeline::thread_count() - 1)
    };
    let io = EmulatorIo::new(IoOptions {
        out_dir: args.out_dir.clone(),
        inp_dir: args.inp_dir.clone(),
        workers,
    })?;

    let memory = MemoryImage::new(args.mem_size);
    let mut cpu = Cpu::new(memory, OpcodeCatalog::new(config), Box::new(io));
    cpu.load_bytecode(&program, args.load_offset)?;
    if let Some(path) = args.attach.get(0) {
        let bytes = fs::read(path)
            .map_err(|e| SetupError(format!("can't open file '{}': {}", path.display(), e)))?;
        cpu.load_argument(&bytes)?;
    }
    if let Some(path) = args.attach.get(1) {
        let bytes = fs::read(path)
            .map_err(|e| SetupError(format!("can't open file '{}': {}", path.display(), e)))?;
        cpu.load_environment(&bytes)?;
    }

    cpu.set_interrupt_flag(signal::install());
    let reason = cpu.run();

    // Halt path: terminal back to normal before anything prints, then
    // make the pending frames durable.
    console::restore();
    if let Err(error) = cpu.io.flush() {
        eprintln!("output flush failed: {}", error);
    }

    if args.histogram {
        print_histogram(&cpu);
    }

    Ok(report(&cpu, &reason, &symbols, program.len()))
}

// Fetches per opcode, the share of all fetches, and how often the byte
// was planted by recoding.
fn print_histogram(cpu: &Cpu) {
    let fetches = cpu.fetch_count().max(1);
    let histogram = cpu.histogram();
    let recodes = cpu.recode_counts();
    for byte in 0..256 {
        if histogram[byte] == 0 {
            continue;
        }
        let ratio = if recodes[byte] > 0 {
            histogram[byte] as f64 / recodes[byte] as f64
        } else {
            histogram[byte] as f64
        };
        println!(
            "{:15}\t{:<10}\t{:6.3}%\t{:15}\t{:20.2}",
            histogram[byte],
            cpu.catalog().attr(byte as u8).name,
            histogram[byte] as f64 / fetches as f64 * 100.0,
            recodes[byte],
            ratio
        );
    }
}

fn report(cpu: &Cpu, reason: &HaltReason, symbols: &SymbolIndex, binary_size: usize) -> i32 {
    println!();

    let steps = cpu.instruction_count();
    let samples = cpu.samples();
    if steps != samples[0] {
        for (index, count) in samples.iter().enumerate() {
            if *count > 0 {
                println!("Probe {:3}: {:10}", index, count);
            }
        }
    }
    println!("Binary file size: {} bytes", binary_size);
    println!(
        "Executed {} instructions; {} fetches ({:.2} insn per fetch)",
        steps,
        cpu.fetch_count(),
        steps as f64 / cpu.fetch_count().max(1) as f64
    );
    println!();

    if let HaltReason::Fault(fault) = reason {
        println!("error: {}", fault);
        println!();
    }

    let mem_len = cpu.memory.len();
    let sp = cpu.sp();
    let ret_val;
    if sp < cpu.memory.exec_start() || sp >= mem_len {
        println!(
            "End stack:\nSP out of range: {:#x} [{:#x} {:#x}]",
            sp,
            cpu.memory.exec_start(),
            mem_len
        );
        ret_val = 1;
    } else {
        dump_stack(cpu);
        ret_val = (cpu.top_of_stack().unwrap_or(0) & 0xff) as i32;
    }

    if let HaltReason::Fault(_) = reason {
        println!("Last known instruction");
        let at = cpu.last_fetch();
        if at < cpu.memory.exec_start() || at > cpu.memory.exec_end() {
            println!("PC={:#x} out of range", at);
        } else {
            print_insn(cpu, at);
        }
        let (lower, upper) = symbols.nearest(at);
        if let Some(label) = lower {
            println!("   Nearest lower label: {}", label);
        }
        if let Some(label) = upper {
            println!("   Nearest upper label: {}", label);
        }
    }

    match reason {
        HaltReason::Exit => ret_val,
        HaltReason::Fault(Fault::WrongBinaryVersion(_)) => EXIT_WRONG_BINARY_VERSION,
        HaltReason::Fault(Fault::Interrupted) => libc::SIGINT | 0x80,
        HaltReason::Fault(Fault::DivisionByZero) => libc::SIGFPE | 0x80,
        HaltReason::Fault(Fault::SegmentationFault(_)) => libc::SIGSEGV | 0x80,
        HaltReason::Fault(Fault::UnknownOpcode(_)) => EXIT_UNDEFINED_INSTRUCTION,
        HaltReason::Fault(Fault::Io(_)) => EXIT_IO_TROUBLE,
    }
}

// Final stack, one word per line, top first, capped by the dump
// environment variables.
fn dump_stack(cpu: &Cpu) {
    let mem_len = cpu.memory.len();
    let sp = cpu.sp();
    let last_word = mem_len - 8;
    let nstack = (last_word - sp) / 8;

    let ntop = match std::env::var("IVM_EMU_MAX_DUMPED_STACK") {
        Ok(value) => value.parse().unwrap_or(31),
        Err(_) => {
            if std::env::var("IVM_EMU_DUMP_FULL_STACK").is_ok() {
                nstack
            } else {
                31
            }
        }
    };

    println!("End stack:");
    let stack_start = mem_len - 16;
    let mut addr = sp;
    let limit = stack_start.min(sp.saturating_add(ntop.saturating_mul(8)));
    while addr <= limit {
        let value = cpu.memory.read_u64(addr).unwrap_or(0);
        println!("0x..{:06x} {:8}", value & 0xff_ffff, value as i64);
        addr += 8;
    }
    println!();
    println!(
        "Shown top {} out of {} stack positions",
        (ntop + 1).min(nstack),
        nstack
    );
    println!(" (export IVM_EMU_MAX_DUMPED_STACK=N to show N+1 stack positions only)");
    println!(" (to show all stack positions, unset IVM_EMU_MAX_DUMPED_STACK and export IVM_EMU_DUMP_FULL_STACK=1)");

    debug!("final SP {:#x}, {} stack words", sp, nstack);
}

fn print_insn(cpu: &Cpu, at: u64) {
    let opcode = cpu.memory.read_u8(at).unwrap_or(0);
    let attr = cpu.catalog().attr(opcode);
    print!("PC={:#x} op_code={:#04x} {}\t", at, opcode, attr.name);
    match attr.opbytes {
        1 => {
            if let Ok(operand) = cpu.memory.read_u8(at + 1) {
                print!("oper(1byte)={:#x}", operand);
            }
        }
        2 => {
            if let Ok(operand) = cpu.memory.read_u16(at + 1) {
                print!("oper(2bytes)={:#x}", operand);
            }
        }
        4 => {
            if let Ok(operand) = cpu.memory.read_u32(at + 1) {
                print!("oper(4bytes)={:#x}", operand);
            }
        }
        8 => {
            if let Ok(operand) = cpu.memory.read_u64(at + 1) {
                print!("oper(8bytes)={:#x}", operand);
            }
        }
        _ => {}
    }
    println!();
}
