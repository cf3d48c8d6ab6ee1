//! # dotnet-interp
//!
//! The interpreter tier of a CIL execution engine: method and call-site
//! caches, an operand stack machine over raw IL, a bridge between the
//! native calling conventions of several 64-bit targets and the
//! interpreter's argument layout, exception dispatch, GC root reporting and
//! the hand-off of hot methods to a compiler.
//!
//! The `dotnet-interp` binary drives a [`vm::StandaloneRuntime`] host for
//! running and inspecting single method bodies.
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

pub mod callconv;
pub mod types;
pub mod utils;
pub mod value;
#[macro_use]
pub mod vm;

use callconv::{CallingConvention, TargetConvention};
use types::{rules::TypeRules, MethodSignature, PrimitiveKind, SigType};
use value::StackValue;
use vm::{frame::ArgValue, Interpreter, InterpreterConfig, MethodDefinition, StandaloneRuntime, Unwind};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Interpreter tier for CIL method bodies"
)]
pub struct Args {
    /// Log structural events (descriptor creation, stubs, promotions).
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Print interpreter counters as JSON when done.
    #[arg(long, global = true)]
    pub stats: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interpret a hex-encoded IL body, entering it through the entry stub
    /// of the chosen architecture.
    Run {
        /// Signature in compact form, e.g. `i4,i8->i8`.
        #[arg(short, long)]
        signature: String,
        #[arg(short, long, value_parser = parse_arch)]
        arch: Option<TargetConvention>,
        #[arg(long, default_value_t = 16)]
        max_stack: u16,
        /// Use the strict ECMA-335 operand tables.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        tiering_threshold: Option<u32>,
        /// IL bytes as hex.
        #[arg(value_name = "IL")]
        il: String,
        #[arg(value_name = "ARGS", allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Decode and print a hex-encoded IL body.
    Disasm {
        #[arg(value_name = "IL")]
        il: String,
    },
    /// Print the argument table and entry stub for a signature.
    Stub {
        #[arg(short, long)]
        signature: String,
        #[arg(short, long, value_parser = parse_arch)]
        arch: Option<TargetConvention>,
    },
}

fn parse_arch(name: &str) -> Result<TargetConvention, String> {
    TargetConvention::by_name(name).ok_or_else(|| {
        format!("unknown architecture '{name}' (expected amd64-windows, amd64-sysv, arm64 or riscv64)")
    })
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match execute(&args) {
        Ok(code) => code,
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::from(1)
        }
    }
}

fn execute(args: &Args) -> Result<ExitCode, String> {
    match &args.command {
        Command::Disasm { il } => {
            let code = utils::parse_hex(il).ok_or("IL must be an even number of hex digits")?;
            let ops = vm::opcodes::disassemble(&code).map_err(|e| e.to_string())?;
            for (offset, op) in ops {
                println!("IL_{:04x}: {}", offset, op);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Stub { signature, arch } => {
            let signature: MethodSignature = signature.parse().map_err(|e| format!("{e}"))?;
            let config = InterpreterConfig::from_env().with_convention(arch.unwrap_or_default());
            let (interp, handle) = single_method(config, signature, vec![], 8);
            let desc = interp.descriptor(handle).map_err(describe_unwind)?;
            let stub = interp.entry_stub(handle).map_err(describe_unwind)?;
            println!("{}", desc.layout);
            println!("{}", stub);
            print_stats(args, &interp)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            signature,
            arch,
            max_stack,
            strict,
            tiering_threshold,
            il,
            args: values,
        } => {
            let signature: MethodSignature = signature.parse().map_err(|e| format!("{e}"))?;
            let code = utils::parse_hex(il).ok_or("IL must be an even number of hex digits")?;
            if values.len() != signature.params.len() {
                return Err(format!(
                    "signature takes {} arguments, {} given",
                    signature.params.len(),
                    values.len()
                ));
            }
            let mut config = InterpreterConfig::from_env().with_convention(arch.unwrap_or_default());
            if *strict {
                config = config.with_type_rules(TypeRules::Strict);
            }
            if let Some(threshold) = tiering_threshold {
                config = config.with_tiering_threshold(*threshold);
            }
            let ret = signature.ret;
            let staged = signature
                .params
                .iter()
                .zip(values)
                .map(|(param, text)| parse_argument(*param, text))
                .collect::<Result<Vec<_>, _>>()?;
            let (interp, handle) = single_method(config, signature, code, *max_stack);
            let code = run_method(&interp, handle, &staged, ret);
            print_stats(args, &interp)?;
            code
        }
    }
}

/// A runtime holding one static method named `main`.
fn single_method(
    config: InterpreterConfig,
    signature: MethodSignature,
    code: Vec<u8>,
    max_stack: u16,
) -> (Interpreter, vm::MethodHandle) {
    let runtime = std::sync::Arc::new(StandaloneRuntime::new());
    let handle = runtime.new_method_handle();
    runtime.define_method(
        MethodDefinition::new(handle, "main", signature)
            .with_body(code, vec![])
            .with_max_stack(max_stack),
    );
    let interp = Interpreter::new(runtime, config).with_tracer(vm::tracer::Tracer::from_env());
    (interp, handle)
}

fn parse_argument(ty: SigType, text: &str) -> Result<ArgValue, String> {
    let SigType::Primitive(kind) = ty else {
        return Err(format!("cannot pass '{text}' as a struct"));
    };
    let bad = |e: String| format!("'{text}' is not a valid {kind}: {e}");
    let value = match kind.stack_normal() {
        PrimitiveKind::I4 => StackValue::Int32(text.parse::<i32>().map_err(|e| bad(e.to_string()))?),
        PrimitiveKind::I8 => StackValue::Int64(text.parse::<i64>().map_err(|e| bad(e.to_string()))?),
        PrimitiveKind::NativeInt => StackValue::NativeInt(text.parse::<isize>().map_err(|e| bad(e.to_string()))?),
        PrimitiveKind::R4 => StackValue::Float(text.parse::<f32>().map_err(|e| bad(e.to_string()))?),
        PrimitiveKind::R8 => StackValue::Double(text.parse::<f64>().map_err(|e| bad(e.to_string()))?),
        _ => return Err(format!("cannot pass arguments of type {kind} from the command line")),
    };
    Ok(ArgValue::primitive(kind, value))
}

fn run_method(
    interp: &Interpreter,
    handle: vm::MethodHandle,
    args: &[ArgValue],
    ret: SigType,
) -> Result<ExitCode, String> {
    let desc = interp.descriptor(handle).map_err(describe_unwind)?;
    let convention = interp.config().convention;
    let values: Vec<&[u8]> = args.iter().map(ArgValue::bytes).collect();
    let mut state = convention.marshal_outbound_call(&desc.layout, &values);
    match interp.invoke_native(handle, &mut state) {
        Ok(native) => {
            if let SigType::Primitive(kind) = ret {
                if kind != PrimitiveKind::Void {
                    let mut bytes = [0u8; 8];
                    convention.read_return(&desc.layout, &native, &mut bytes[..kind.size()]);
                    // SAFETY: `bytes` holds a value of `kind`.
                    let value = unsafe { StackValue::load(bytes.as_ptr(), kind) };
                    println!("{}", format_value(value));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(Unwind::Exception(exception)) => {
            let host = interp.host();
            let name = host.type_info(host.object_type(exception)).name.clone();
            eprintln!("unhandled exception: {} ({:?})", name, exception);
            Ok(ExitCode::from(2))
        }
        Err(fatal) => Err(describe_unwind(fatal)),
    }
}

fn format_value(value: StackValue) -> String {
    match value {
        StackValue::Int32(v) => v.to_string(),
        StackValue::Int64(v) => v.to_string(),
        StackValue::NativeInt(v) => v.to_string(),
        StackValue::Float(v) => v.to_string(),
        StackValue::Double(v) => v.to_string(),
        StackValue::ObjectRef(o) => format!("{:?}", o),
        StackValue::ManagedPtr(p) => format!("&{:#x}", p),
    }
}

fn describe_unwind(unwind: Unwind) -> String {
    match unwind {
        Unwind::Fatal(error) => error.to_string(),
        Unwind::Exception(exception) => format!("managed exception {:?}", exception),
    }
}

fn print_stats(args: &Args, interp: &Interpreter) -> Result<(), String> {
    if args.stats {
        let json = serde_json::to_string_pretty(&interp.metrics().snapshot()).map_err(|e| e.to_string())?;
        println!("{}", json);
    }
    Ok(())
}
