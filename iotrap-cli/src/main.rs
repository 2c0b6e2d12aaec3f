use std::error::Error;
use std::rc::Rc;

use clap::{Parser, Subcommand};
use iotrap_core::bus::HardwareBus;
use iotrap_core::classify::{AddressClassifier, Classification, Config};
use iotrap_core::context::{flags, Gpr};
use iotrap_core::decode::InstructionDescriptor;
use iotrap_core::io_bus::IoBus;
use iotrap_core::resources::register_bank::RegisterBank;
use iotrap_core::trap::{BusErrorLatch, ResumePoint};
use iotrap_core::{FaultContext, FaultHandler, FaultOutcome, Width};
use log::{debug, info};
use stderrlog::LogLevelNum;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Increase log verbosity, may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Host address at which guest address 0 is mapped.
    #[arg(long, value_parser = parse_hex, default_value = "0", global = true)]
    host_base: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a faulting instruction given as hex bytes.
    Decode {
        /// Instruction bytes, e.g. `0f b6 05 01 88 ff 00` or `0fb60501`.
        #[arg(required = true)]
        bytes: Vec<String>,
    },
    /// Replay a single fault against an emulated register bank.
    Fault {
        /// Faulting host address.
        #[arg(long, value_parser = parse_hex)]
        address: u32,
        /// Bytes of the faulting instruction.
        #[arg(long)]
        code: String,
        /// Value the hardware register holds before the access.
        #[arg(long, value_parser = parse_hex)]
        bus_value: Option<u32>,
        /// Initial register value, as `NAME=HEX`. May be repeated.
        #[arg(long = "reg", value_parser = parse_register)]
        registers: Vec<(Gpr, u32)>,
        /// Address of the faulting instruction.
        #[arg(long, value_parser = parse_hex, default_value = "0x1000")]
        pc: u32,
        /// Address the CPU core's exception handling starts at.
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        entry: u32,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(match args.verbose {
            0 => LogLevelNum::Warn,
            1 => LogLevelNum::Info,
            2 => LogLevelNum::Debug,
            _ => LogLevelNum::Trace,
        })
        .modules([module_path!(), "iotrap_core"])
        .init()?;

    let config = Config {
        host_base: args.host_base as usize,
        ..Config::default()
    };
    config.validate()?;

    match args.command {
        Command::Decode { bytes } => decode(&parse_bytes(&bytes.concat())?),
        Command::Fault {
            address,
            code,
            bus_value,
            registers,
            pc,
            entry,
        } => {
            let mut context = FaultContext::new(address as usize, pc as usize);
            for (gpr, value) in registers {
                context.set_gpr(gpr, value);
            }
            replay(&config, context, &parse_bytes(&code)?, bus_value, entry as usize)
        }
    }
}

fn decode(code: &[u8]) -> Result<(), Box<dyn Error>> {
    let instruction = InstructionDescriptor::decode(code)?;
    println!("{instruction}");
    println!("  operation: {:?} ({:?})", instruction.operation, instruction.direction);
    println!("  register:  {}", instruction.register);
    println!("  width:     {} (bus {})", instruction.width, instruction.bus_width());
    if let Some(immediate) = instruction.immediate {
        println!("  immediate: {immediate:#04x}");
    }
    println!("  length:    {}", instruction.length);
    if instruction.length < code.len() {
        info!("Ignoring {} trailing bytes", code.len() - instruction.length);
    }
    Ok(())
}

fn replay(
    config: &Config,
    mut context: FaultContext,
    code: &[u8],
    bus_value: Option<u32>,
    entry: usize,
) -> Result<(), Box<dyn Error>> {
    let system = config.system_window;
    let bank = RegisterBank::new(system.size().ok_or("system window too large")?)
        .ok_or("system window cannot be backed by a register bank")?;
    let bus = IoBus::new(vec![(system, Box::new(bank) as Box<dyn HardwareBus>)])?;

    if let Some(value) = bus_value {
        let classifier = AddressClassifier::new(config)?;
        if let Classification::Hardware { offset, .. } = classifier.classify(context.fault_address()) {
            let width = InstructionDescriptor::decode(code)
                .map(|instruction| instruction.bus_width())
                .unwrap_or(Width::Long);
            debug!("Presetting {width} at offset {offset:#010x} to {value:#x}");
            match width {
                Width::Byte => bus.write_byte(offset, value as u8),
                Width::Word => bus.write_word(offset, value as u16),
                Width::Long => bus.write_long(offset, value),
            }
        }
    }

    let latch = Rc::new(BusErrorLatch::new());
    let handler = FaultHandler::new(bus, ResumePoint::new(entry, Rc::clone(&latch)), config)?;

    match handler.try_handle(&mut context, code)? {
        FaultOutcome::Resumed { next_pc } => println!("resumed at {next_pc:#010x}"),
        FaultOutcome::BusError { guest_address } => {
            println!("bus error at {guest_address:#010x}, continuing at {:#010x}", context.pc());
            if let Some(error) = latch.take() {
                println!("  latched code {} for {:#010x}", error.code, error.address);
            }
        }
    }

    for gpr in Gpr::ALL {
        println!("  {gpr}: {:#010x}", context.gpr(gpr));
    }
    print_flags(context.eflags());
    Ok(())
}

fn print_flags(eflags: u32) {
    let names = [
        (flags::CF, "CF"),
        (flags::PF, "PF"),
        (flags::AF, "AF"),
        (flags::ZF, "ZF"),
        (flags::SF, "SF"),
        (flags::OF, "OF"),
    ];
    let set: Vec<&str> = names
        .into_iter()
        .filter(|&(bit, _)| eflags & (1 << bit) != 0)
        .map(|(_, name)| name)
        .collect();
    println!("  eflags: {eflags:#010x} [{}]", set.join(" "));
}

fn parse_hex(value: &str) -> Result<u32, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(&digits.replace('_', ""), 16).map_err(|e| format!("{value:?}: {e}"))
}

fn parse_register(value: &str) -> Result<(Gpr, u32), String> {
    let (name, number) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=HEX, got {value:?}"))?;
    let gpr = Gpr::from_name(name.trim()).ok_or_else(|| format!("unknown register {name:?}"))?;
    Ok((gpr, parse_hex(number.trim())?))
}

fn parse_bytes(value: &str) -> Result<Vec<u8>, String> {
    let digits: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        return Err(format!("non-hex characters in {value:?}"));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {value:?}"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("{:?}: {e}", &digits[i..i + 2]))
        })
        .collect()
}
