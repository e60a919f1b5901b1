//! c93 - CLI entry point
//!
//! Commands:
//! - `c93 run <image>` - load a raw byte image and run it
//! - `c93 forms [--family NAME]` - list the instruction forms

use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use c93::cpu::isa::{Family, FamilyBody, InstructionSet};
use c93::{Cpu, CpuState, MachineConfig};

#[derive(Parser)]
#[command(name = "c93")]
#[command(version)]
#[command(about = "Execution core of a byte-oriented 8/16/24/32-bit register machine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a raw program image until it halts
    Run {
        /// Path to the image file
        image: String,
        /// Maximum number of instructions to run
        #[arg(short, long, default_value = "1000000")]
        max_cycles: u64,
        /// Print every executed instruction
        #[arg(short, long)]
        trace: bool,
        /// JSON machine configuration
        #[arg(short, long)]
        config: Option<String>,
        /// Load address (overrides the configuration)
        #[arg(long, value_parser = parse_number)]
        origin: Option<u32>,
        /// Guest error handler address (overrides the configuration)
        #[arg(long, value_parser = parse_number)]
        error_handler: Option<u32>,
        /// Stack size in bytes (overrides the configuration)
        #[arg(long, value_parser = parse_number)]
        stack_capacity: Option<u32>,
        /// Print the final machine state as JSON
        #[arg(long)]
        json: bool,
    },
    /// List instruction families and their forms
    Forms {
        /// Only show this family (e.g. LD, DJNZ)
        #[arg(short, long)]
        family: Option<String>,
    },
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_number(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number `{text}`: {e}"))
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            image,
            max_cycles,
            trace,
            config,
            origin,
            error_handler,
            stack_capacity,
            json,
        } => {
            let mut machine = match config {
                Some(path) => match MachineConfig::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("Failed to load config {path}: {e}");
                        process::exit(1);
                    }
                },
                None => MachineConfig::default(),
            };
            if let Some(origin) = origin {
                machine.origin = origin;
            }
            if let Some(address) = error_handler {
                machine.error_handler = address;
            }
            if let Some(capacity) = stack_capacity {
                machine.stack_capacity = capacity;
            }
            if let Err(e) = machine.validate() {
                eprintln!("{e}");
                process::exit(1);
            }

            run_image(&image, machine, max_cycles, trace, json);
        }
        Commands::Forms { family } => list_forms(family.as_deref()),
    }
}

fn run_image(path: &str, config: MachineConfig, max_cycles: u64, trace: bool, json: bool) {
    let image = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read {path}: {e}");
            process::exit(1);
        }
    };
    if image.is_empty() {
        eprintln!("{path} is empty");
        process::exit(1);
    }

    let origin = config.origin;
    let mut cpu = Cpu::with_config(config);
    cpu.load_program(&image);
    tracing::info!(bytes = image.len(), "loaded {path} at {origin:#08X}");

    let mut cycles = 0u64;
    while cpu.is_running() && cycles < max_cycles {
        match cpu.step() {
            Ok(executed) => {
                if trace {
                    println!("{executed}  [{}]", cpu.flags);
                }
                cycles += 1;
            }
            Err(e) => {
                eprintln!("CPU error: {e}");
                process::exit(1);
            }
        }
    }

    if json {
        match serde_json::to_string_pretty(&cpu.snapshot()) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Failed to serialize state: {e}");
                process::exit(1);
            }
        }
    } else {
        let snapshot = cpu.snapshot();
        println!("Cycles: {}", snapshot.cycles);
        println!("State:  {:?}", snapshot.state);
        println!("IPO:    {:06X}", snapshot.ipo);
        println!("SPR:    {}", snapshot.spr);
        println!("Flags:  {}", snapshot.flags);
        println!("Regs:   {:?}", snapshot.registers);
        println!("Floats: {:?}", snapshot.float_registers);
        if snapshot.error_id != 0 {
            println!("Error:  id {} (handler {:06X})", snapshot.error_id, snapshot.error_handler);
        }
    }

    if cpu.state == CpuState::Running {
        eprintln!("Reached max cycles limit ({max_cycles}). Use --max-cycles to increase.");
    }
}

fn list_forms(name: Option<&str>) {
    let set = InstructionSet::get();
    let families: Vec<&Family> = match name {
        Some(name) => match set.by_name(name) {
            Some(family) => vec![family],
            None => {
                eprintln!("No instruction family named {name}");
                process::exit(1);
            }
        },
        None => set.families().collect(),
    };

    for family in families {
        match &family.body {
            FamilyBody::Bare(op) => println!("{:02X}     {op}", family.opcode),
            FamilyBody::Moded(forms) => {
                for (index, form) in forms.iter().enumerate() {
                    println!("{:02X} {index:>2}  {form}", family.opcode);
                }
            }
        }
    }
}
