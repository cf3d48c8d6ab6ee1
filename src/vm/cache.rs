//! Call-site caches keyed by IL offset.
//!
//! Entries are write-once: the first committed value for an offset wins and
//! a racing insert is dropped. Readers never block writers for longer than
//! one insertion, and no lock is held while resolving.
use crate::{
    types::{MethodSignature, TypeHandle, TypeInfo, ValueTypeDescriptor},
    vm::{
        host::{CallInfo, FieldInfo},
        method::GenericContext,
    },
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// A resolved call target plus what the caller needs to pop its arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSiteInfo {
    pub call: CallInfo,
    /// Declared parameter descriptors, receiver excluded.
    pub params: Vec<ValueTypeDescriptor>,
    pub ret: ValueTypeDescriptor,
    /// Full call-site signature for vararg calls.
    pub site_signature: Option<Arc<MethodSignature>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldAccess {
    pub info: FieldInfo,
    pub ty: ValueTypeDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedType {
    pub handle: TypeHandle,
    pub info: Arc<TypeInfo>,
    pub ty: ValueTypeDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CachedItem {
    Call(Arc<CallSiteInfo>),
    InstanceField(Arc<FieldAccess>),
    /// Static fields carry their resolved storage address.
    StaticField(Arc<FieldAccess>),
    Type(Arc<ResolvedType>),
}

#[derive(Debug, Default)]
pub struct IlOffsetCache {
    entries: RwLock<Vec<(u32, CachedItem)>>,
}

impl IlOffsetCache {
    pub fn get(&self, offset: u32) -> Option<CachedItem> {
        let entries = self.entries.read();
        entries
            .binary_search_by_key(&offset, |(o, _)| *o)
            .ok()
            .map(|i| entries[i].1.clone())
    }

    /// Commits `item` unless another thread got there first. Returns the
    /// entry that ended up in the cache and whether it was this one.
    pub fn insert(&self, offset: u32, item: CachedItem) -> (CachedItem, bool) {
        let mut entries = self.entries.write();
        match entries.binary_search_by_key(&offset, |(o, _)| *o) {
            Ok(i) => {
                let existing = entries[i].1.clone();
                debug_assert_eq!(
                    existing, item,
                    "re-resolution at IL_{offset:04x} produced a different entry"
                );
                tracing::trace!(offset, "call-site cache race lost");
                (existing, false)
            }
            Err(i) => {
                entries.insert(i, (offset, item.clone()));
                (item, true)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Instantiation-keyed caches for shared generic code.
#[derive(Debug, Default)]
pub struct GenericCache {
    by_context: DashMap<GenericContext, Arc<IlOffsetCache>>,
}

impl GenericCache {
    pub fn get_or_create(&self, context: GenericContext) -> Arc<IlOffsetCache> {
        if let Some(cache) = self.by_context.get(&context) {
            return cache.clone();
        }
        self.by_context.entry(context).or_default().clone()
    }

    pub fn instantiations(&self) -> usize {
        self.by_context.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;

    fn type_entry(handle: u32) -> CachedItem {
        CachedItem::Type(Arc::new(ResolvedType {
            handle: TypeHandle(handle),
            info: Arc::new(TypeInfo::primitive("Int32", PrimitiveKind::I4)),
            ty: ValueTypeDescriptor::I4,
        }))
    }

    #[test]
    fn lookups_are_ordered_by_offset() {
        let cache = IlOffsetCache::default();
        cache.insert(30, type_entry(3));
        cache.insert(10, type_entry(1));
        cache.insert(20, type_entry(2));
        assert_eq!(cache.get(20), Some(type_entry(2)));
        assert_eq!(cache.get(15), None);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn duplicate_insert_returns_existing_entry() {
        let cache = IlOffsetCache::default();
        let (first, won) = cache.insert(4, type_entry(9));
        assert!(won);
        let (second, won) = cache.insert(4, type_entry(9));
        assert!(!won);
        let (CachedItem::Type(a), CachedItem::Type(b)) = (first, second) else {
            panic!("wrong variant");
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }
}
