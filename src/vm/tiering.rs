//! Invocation counting and promotion to compiled code.
use crate::{
    callconv::CompiledCode,
    vm::{
        method::{MethodDescriptor, MethodHandle},
        registry::MethodRegistry,
    },
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// Per-method invocation counter.
#[derive(Debug, Default)]
pub struct TieringTrigger {
    calls: AtomicU32,
    requested: AtomicBool,
}

impl TieringTrigger {
    /// Counts one invocation; true exactly once, on the call that crosses
    /// `threshold`.
    pub fn record_call(&self, threshold: u32) -> bool {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        calls >= threshold && self.claim()
    }

    /// Claims the single promotion request regardless of the count.
    pub fn claim(&self) -> bool {
        !self.requested.swap(true, Ordering::AcqRel)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Consumer of promotion requests.
pub trait TieringManager: Send + Sync {
    /// Must not block the calling invocation.
    fn request_promotion(&self, method: &Arc<MethodDescriptor>);
}

/// Produces compiled code for a method; runs off the interpreting thread.
pub trait TierCompiler: Send + Sync + 'static {
    fn compile(&self, method: &MethodDescriptor) -> Option<Arc<dyn CompiledCode>>;
}

/// Records requests without acting on them.
#[derive(Debug, Default)]
pub struct RecordingTieringManager {
    requests: parking_lot::Mutex<Vec<MethodHandle>>,
}

impl RecordingTieringManager {
    pub fn requests(&self) -> Vec<MethodHandle> {
        self.requests.lock().clone()
    }
}

impl TieringManager for RecordingTieringManager {
    fn request_promotion(&self, method: &Arc<MethodDescriptor>) {
        self.requests.lock().push(method.handle());
    }
}

enum Request {
    Promote(Arc<MethodDescriptor>),
    Shutdown,
}

/// Compiles promoted methods on a worker thread and installs the result in
/// the registry, where later calls pick it up.
pub struct BackgroundTieringManager {
    sender: Sender<Request>,
    worker: parking_lot::Mutex<Option<JoinHandle<usize>>>,
}

impl BackgroundTieringManager {
    pub fn start(compiler: impl TierCompiler, registry: Arc<MethodRegistry>) -> Self {
        let (sender, receiver) = unbounded();
        let worker = std::thread::Builder::new()
            .name("tiering".to_string())
            .spawn(move || Self::run(receiver, compiler, registry))
            .ok();
        if worker.is_none() {
            tracing::error!("failed to start the tiering worker; promotions will be dropped");
        }
        Self {
            sender,
            worker: parking_lot::Mutex::new(worker),
        }
    }

    fn run(receiver: Receiver<Request>, compiler: impl TierCompiler, registry: Arc<MethodRegistry>) -> usize {
        let mut installed = 0;
        for request in receiver {
            let method = match request {
                Request::Promote(method) => method,
                Request::Shutdown => break,
            };
            match compiler.compile(&method) {
                Some(code) => {
                    tracing::info!(method = method.name(), "installing compiled code");
                    registry.install_compiled(method.handle(), code);
                    installed += 1;
                }
                None => tracing::debug!(method = method.name(), "compiler declined method"),
            }
        }
        installed
    }

    /// Stops the worker after draining queued requests; returns how many
    /// methods were installed.
    pub fn shutdown(&self) -> usize {
        let _ = self.sender.send(Request::Shutdown);
        self.worker
            .lock()
            .take()
            .and_then(|w| w.join().ok())
            .unwrap_or(0)
    }
}

impl TieringManager for BackgroundTieringManager {
    fn request_promotion(&self, method: &Arc<MethodDescriptor>) {
        if self.sender.send(Request::Promote(method.clone())).is_err() {
            tracing::warn!(method = method.name(), "tiering worker is gone");
        }
    }
}

impl Drop for BackgroundTieringManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn promotion_requested_once_past_threshold() {
        let trigger = TieringTrigger::default();
        let fired: Vec<bool> = (0..5).map(|_| trigger.record_call(3)).collect();
        assert_eq!(fired, vec![false, false, true, false, false]);
        assert_eq!(trigger.calls(), 5);
        assert!(trigger.is_requested());
    }

    #[test]
    fn concurrent_calls_fire_exactly_once() {
        let trigger = Arc::new(TieringTrigger::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let trigger = trigger.clone();
                thread::spawn(move || (0..100).filter(|_| trigger.record_call(50)).count())
            })
            .collect();
        let fired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fired, 1);
        assert_eq!(trigger.calls(), 800);
    }
}
