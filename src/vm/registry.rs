use crate::{
    callconv::CompiledCode,
    vm::method::{MethodDescriptor, MethodHandle},
};
use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide map from methods to their interpreter descriptors, entry
/// stubs and any compiled code that has replaced them.
#[derive(Default)]
pub struct MethodRegistry {
    descriptors: DashMap<MethodHandle, Arc<MethodDescriptor>>,
    compiled: DashMap<MethodHandle, Arc<dyn CompiledCode>>,
    stubs: DashMap<usize, MethodHandle>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor(&self, method: MethodHandle) -> Option<Arc<MethodDescriptor>> {
        self.descriptors.get(&method).map(|d| d.clone())
    }

    /// Returns the registered descriptor, creating it on first use. When two
    /// threads race, the loser's descriptor is dropped and both get the winner.
    pub fn get_or_create<E>(
        &self,
        method: MethodHandle,
        create: impl FnOnce() -> Result<MethodDescriptor, E>,
    ) -> Result<Arc<MethodDescriptor>, E> {
        if let Some(existing) = self.descriptor(method) {
            return Ok(existing);
        }
        let created = Arc::new(create()?);
        Ok(self.descriptors.entry(method).or_insert(created).clone())
    }

    pub fn install_compiled(&self, method: MethodHandle, code: Arc<dyn CompiledCode>) {
        self.compiled.entry(method).or_insert(code);
    }

    pub fn compiled(&self, method: MethodHandle) -> Option<Arc<dyn CompiledCode>> {
        self.compiled.get(&method).map(|c| c.clone())
    }

    pub fn register_stub(&self, address: usize, method: MethodHandle) {
        self.stubs.entry(address).or_insert(method);
    }

    pub fn method_for_stub(&self, address: usize) -> Option<MethodHandle> {
        self.stubs.get(&address).map(|m| *m)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
