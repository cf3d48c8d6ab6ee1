//! Root reporting for a precise collector.
//!
//! Every interpreted frame on a thread is linked into that thread's frame
//! chain for the duration of its invocation. A collector (or the host, on
//! the collector's behalf) calls [`scan_current_thread`] at a safe point,
//! that is while the thread is inside a host call such as an allocation,
//! and receives each live reference slot exactly once.
//!
//! Scanning is cooperative. The chain is thread-local, so a collector
//! thread cannot walk another thread's frames: each mutator reports its own
//! roots when the host brings it to a safe point, and the host combines the
//! results before it moves anything.
use crate::{
    types::{PrimitiveKind, ValueTypeDescriptor},
    vm::{
        frame::{ArgValue, Frame},
        host::Host,
        interpreter::ArgBlockKind,
    },
};
use std::{cell::Cell, cell::RefCell, marker::PhantomData};

/// Receives `(slot_address, is_interior_pointer, is_pinning)` per root.
pub trait RootVisitor {
    fn visit(&mut self, slot: *mut usize, interior: bool, pinned: bool);
}

impl<F: FnMut(*mut usize, bool, bool)> RootVisitor for F {
    fn visit(&mut self, slot: *mut usize, interior: bool, pinned: bool) {
        self(slot, interior, pinned)
    }
}

thread_local! {
    static FRAMES: RefCell<Vec<*mut Frame>> = const { RefCell::new(Vec::new()) };
    static NO_GC_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Links a frame into the current thread's chain until dropped.
pub(crate) struct FrameLink {
    _not_send: PhantomData<*const ()>,
}

impl FrameLink {
    /// # Safety
    /// `frame` must stay at the same address and outlive the returned link.
    pub(crate) unsafe fn push(frame: *mut Frame) -> Self {
        FRAMES.with(|f| f.borrow_mut().push(frame));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for FrameLink {
    fn drop(&mut self) {
        FRAMES.with(|f| {
            f.borrow_mut().pop();
        });
    }
}

/// Number of interpreted frames active on this thread.
pub fn frame_depth() -> usize {
    FRAMES.with(|f| f.borrow().len())
}

/// Scope in which no collection may occur: raw addresses into frame
/// storage are held across it. Nestable.
pub struct NoGcRegion {
    _not_send: PhantomData<*const ()>,
}

impl NoGcRegion {
    pub fn enter() -> Self {
        NO_GC_DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for NoGcRegion {
    fn drop(&mut self) {
        NO_GC_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Whether the current thread is at a point where a collection may run.
pub fn collection_allowed() -> bool {
    NO_GC_DEPTH.with(|d| d.get() == 0)
}

/// Reports every reference held by interpreted frames on this thread,
/// innermost frame first. Returns the number of slots reported.
///
/// Only the calling thread's frames are visited; called from any other
/// thread this reports nothing for them. Must be called from a safe point;
/// a collection from inside a [`NoGcRegion`] is a runtime bug and is
/// refused (debug builds assert).
pub fn scan_current_thread(host: &dyn Host, visitor: &mut dyn RootVisitor) -> usize {
    debug_assert!(collection_allowed(), "collection requested inside a no-GC region");
    if !collection_allowed() {
        tracing::error!("root scan refused inside a no-GC region");
        return 0;
    }
    let _scan = NoGcRegion::enter();
    let frames: Vec<*mut Frame> = FRAMES.with(|f| f.borrow().clone());
    let mut counter = Counting {
        inner: visitor,
        count: 0,
    };
    for frame in frames.into_iter().rev() {
        // SAFETY: linked frames are live for as long as they are in the chain,
        // and their thread is suspended inside a host call.
        let frame = unsafe { &mut *frame };
        scan_frame(host, frame, &mut counter);
    }
    counter.count
}

struct Counting<'a> {
    inner: &'a mut dyn RootVisitor,
    count: usize,
}

impl RootVisitor for Counting<'_> {
    fn visit(&mut self, slot: *mut usize, interior: bool, pinned: bool) {
        self.count += 1;
        self.inner.visit(slot, interior, pinned);
    }
}

/// Reports the references inside a value of type `ty` stored at `address`.
fn report_value(
    host: &dyn Host,
    ty: ValueTypeDescriptor,
    address: *mut u8,
    pinned: bool,
    visitor: &mut dyn RootVisitor,
) {
    if address.is_null() {
        return;
    }
    match ty {
        ValueTypeDescriptor::Primitive(PrimitiveKind::Object) => {
            visitor.visit(address.cast(), false, pinned)
        }
        ValueTypeDescriptor::Primitive(PrimitiveKind::ByRef) => {
            visitor.visit(address.cast(), true, pinned)
        }
        ValueTypeDescriptor::Primitive(_) => {}
        ValueTypeDescriptor::InlineStruct { handle, .. }
        | ValueTypeDescriptor::OverflowStruct { handle, .. } => {
            for (offset, interior) in host.type_info(handle).gc_slots() {
                visitor.visit(address.wrapping_add(offset).cast(), interior, pinned);
            }
        }
    }
}

fn report_staged(host: &dyn Host, value: &mut ArgValue, visitor: &mut dyn RootVisitor) {
    let ty = value.ty;
    report_value(host, ty, value.as_mut_ptr(), false, visitor);
}

pub(crate) fn scan_frame(host: &dyn Host, frame: &mut Frame, visitor: &mut dyn RootVisitor) {
    // A direct-call caller reports the block it built.
    if frame.args.kind == ArgBlockKind::Native {
        let method = frame.method.clone();
        for desc in &method.args {
            let address = frame.arg_address(desc);
            report_value(host, desc.ty, address, false, visitor);
        }
    }

    let staging = &mut frame.staging;
    if staging.block.is_empty() {
        for value in &mut staging.outbound {
            report_staged(host, value, visitor);
        }
    } else {
        // An interpreted callee reads inline arguments from the block.
        let block = staging.block.as_mut_ptr();
        for (i, value) in staging.outbound.iter_mut().enumerate() {
            if value.ty.is_overflow() {
                report_staged(host, value, visitor);
            } else {
                report_value(host, value.ty, block.wrapping_add(i).cast(), false, visitor);
            }
        }
    }
    if let Some(varargs) = staging.varargs.as_mut() {
        for value in &mut varargs.args {
            report_staged(host, value, visitor);
        }
    }
    if let Some(ret) = staging.ret.as_mut() {
        report_staged(host, ret, visitor);
    }
    if let Some(new_object) = staging.new_object.as_mut() {
        report_staged(host, new_object, visitor);
    }

    for slot in frame.exceptions.exception_slots() {
        visitor.visit(slot, false, false);
    }

    let method = frame.method.clone();
    for (index, local) in method.locals.iter().enumerate() {
        let address = frame.locals.address(index, local.ty);
        report_value(host, local.ty, address, local.pinned, visitor);
    }

    let stack = &mut frame.stack;
    let entries: Vec<_> = stack.entries().collect();
    for (ty, slot) in entries {
        if ty.is_overflow() {
            // SAFETY: `slot` is a live stack slot.
            let address = unsafe { *slot } as usize;
            // Aliases of local or argument storage are reported with their owner.
            if stack.in_overflow(address) {
                report_value(host, ty, address as *mut u8, false, visitor);
            }
        } else {
            report_value(host, ty, slot.cast(), false, visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_gc_regions_nest() {
        assert!(collection_allowed());
        let outer = NoGcRegion::enter();
        {
            let _inner = NoGcRegion::enter();
            assert!(!collection_allowed());
        }
        assert!(!collection_allowed());
        drop(outer);
        assert!(collection_allowed());
    }
}
