//! Buffered execution tracer for the interpreter.
//!
//! Separate from `tracing`: this writes one line per executed instruction,
//! call and exception, indented by interpreter depth, and is meant to be
//! diffed between runs rather than filtered.
//!
//! ## Environment Variables
//!
//! - `DOTNET_INTERP_TRACE`: `stdout` (or `1`/`true`), `stderr`, or a file path.
//! - `DOTNET_INTERP_TRACE_FLUSH_INTERVAL`: lines between flushes (default 10000).
//! - `DOTNET_INTERP_TRACE_STATS`: print per-event counts when the tracer is dropped.
//!
//! ```bash
//! DOTNET_INTERP_TRACE=/tmp/trace.log DOTNET_INTERP_TRACE_STATS=1 dotnet-interp run ...
//! ```
use crate::vm::opcodes::Opcode;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    env,
    fmt::{self, Display, Formatter},
    fs::File,
    io::{stderr, stdout, BufWriter, Write},
    sync::atomic::{AtomicUsize, Ordering},
};

const BUFFER_SIZE: usize = 256 * 1024;
const AUTO_FLUSH_INTERVAL: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    Error,
    Info,
    Trace,
}

/// One traced occurrence in the interpreter.
#[derive(Clone, Copy, Debug)]
pub enum TraceEvent<'a> {
    Enter { method: &'a str, signature: &'a str },
    Exit { method: &'a str },
    Instruction { offset: usize, op: &'a Opcode, height: usize },
    Branch { mnemonic: &'a str, target: usize, taken: bool },
    Exception { exception: &'a dyn fmt::Debug, method: &'a str, offset: usize },
    RootScan { frames: usize, roots: usize },
}

impl TraceEvent<'_> {
    fn slot(&self) -> usize {
        match self {
            TraceEvent::Enter { .. } => 0,
            TraceEvent::Exit { .. } => 1,
            TraceEvent::Instruction { .. } => 2,
            TraceEvent::Branch { .. } => 3,
            TraceEvent::Exception { .. } => 4,
            TraceEvent::RootScan { .. } => 5,
        }
    }
}

impl Display for TraceEvent<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            TraceEvent::Enter { method, signature } => write!(f, "enter {} ({})", method, signature),
            TraceEvent::Exit { method } => write!(f, "leave {}", method),
            TraceEvent::Instruction { offset, op, height } => {
                write!(f, "IL_{:04x}: {:<28} [{}]", offset, op.to_string(), height)
            }
            TraceEvent::Branch { mnemonic, target, taken } => write!(
                f,
                "{} IL_{:04x} {}",
                mnemonic,
                target,
                if taken { "taken" } else { "fallthrough" }
            ),
            TraceEvent::Exception { exception, method, offset } => {
                write!(f, "throw {:?} in {}+IL_{:04x}", exception, method, offset)
            }
            TraceEvent::RootScan { frames, roots } => write!(f, "roots: {} slots over {} frames", roots, frames),
        }
    }
}

/// Lines written per event kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceStats {
    pub lines: usize,
    pub entries: usize,
    pub exits: usize,
    pub instructions: usize,
    pub branches: usize,
    pub exceptions: usize,
    pub root_scans: usize,
}

pub struct Tracer {
    writer: Option<Mutex<BufWriter<Box<dyn Write + Send>>>>,
    pending: AtomicUsize,
    flush_interval: usize,
    lines: AtomicUsize,
    events: [AtomicUsize; 6],
    print_stats: bool,
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| v == "1" || v == "true")
}

impl Tracer {
    pub fn from_env() -> Self {
        let writer: Option<Box<dyn Write + Send>> = match env::var("DOTNET_INTERP_TRACE").as_deref() {
            Ok("1" | "true" | "stdout") => Some(Box::new(stdout())),
            Ok("stderr") => Some(Box::new(stderr())),
            Ok("") | Err(_) => None,
            Ok(path) => match File::create(path) {
                Ok(f) => Some(Box::new(f)),
                Err(e) => {
                    tracing::warn!(path, error = %e, "cannot open trace file; tracing disabled");
                    None
                }
            },
        };
        let mut tracer = Self::with_writer(writer);
        if let Some(interval) = env::var("DOTNET_INTERP_TRACE_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            tracer.flush_interval = interval.max(1);
        }
        tracer.print_stats = env_flag("DOTNET_INTERP_TRACE_STATS");
        tracer
    }

    pub fn disabled() -> Self {
        Self::with_writer(None)
    }

    /// Traces into an arbitrary sink.
    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self::with_writer(Some(Box::new(writer)))
    }

    fn with_writer(writer: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            writer: writer.map(|w| Mutex::new(BufWriter::with_capacity(BUFFER_SIZE, w))),
            pending: AtomicUsize::new(0),
            flush_interval: AUTO_FLUSH_INTERVAL,
            lines: AtomicUsize::new(0),
            events: Default::default(),
            print_stats: false,
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    fn line(&self, indent: usize, args: fmt::Arguments) {
        let Some(writer) = &self.writer else {
            return;
        };
        let mut writer = writer.lock();
        let _ = writeln!(writer, "{:width$}{}", "", args, width = indent * 2);
        self.lines.fetch_add(1, Ordering::Relaxed);
        if self.pending.fetch_add(1, Ordering::Relaxed) + 1 >= self.flush_interval {
            let _ = writer.flush();
            self.pending.store(0, Ordering::Relaxed);
        }
    }

    pub fn msg(&self, level: TraceLevel, indent: usize, args: fmt::Arguments) {
        match level {
            TraceLevel::Error => self.line(indent, format_args!("!! {}", args)),
            _ => self.line(indent, args),
        }
    }

    pub fn event(&self, indent: usize, event: TraceEvent) {
        if !self.is_enabled() {
            return;
        }
        self.events[event.slot()].fetch_add(1, Ordering::Relaxed);
        self.line(indent, format_args!("{}", event));
    }

    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            let _ = writer.lock().flush();
        }
        self.pending.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TraceStats {
        let get = |i: usize| self.events[i].load(Ordering::Relaxed);
        TraceStats {
            lines: self.lines.load(Ordering::Relaxed),
            entries: get(0),
            exits: get(1),
            instructions: get(2),
            branches: get(3),
            exceptions: get(4),
            root_scans: get(5),
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.print_stats && self.is_enabled() {
            match serde_json::to_string(&self.stats()) {
                Ok(json) => eprintln!("trace stats: {}", json),
                Err(e) => tracing::warn!(error = %e, "cannot serialize trace stats"),
            }
        }
        self.flush();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn indents_and_counts() {
        let sink = Sink::default();
        let tracer = Tracer::to_writer(sink.clone());
        tracer.event(0, TraceEvent::Enter { method: "M", signature: "i4->i4" });
        tracer.event(
            1,
            TraceEvent::Instruction {
                offset: 4,
                op: &Opcode::Ret,
                height: 1,
            },
        );
        tracer.flush();
        let text = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert_eq!(text, format!("enter M (i4->i4)\n  IL_0004: {:<28} [1]\n", "ret"));
        let stats = tracer.stats();
        assert_eq!((stats.entries, stats.instructions, stats.lines), (1, 1, 2));
    }

    #[test]
    fn disabled_tracer_writes_nothing() {
        let tracer = Tracer::disabled();
        tracer.msg(TraceLevel::Info, 0, format_args!("hello"));
        tracer.event(0, TraceEvent::RootScan { frames: 1, roots: 2 });
        assert_eq!(tracer.stats(), TraceStats::default());
    }
}
