mod common;

use common::*;
use dotnet_interp::{
    types::{rules::BinaryOp, FlatField, PrimitiveKind, TypeInfo},
    value::StackValue,
    vm::{
        gc,
        opcodes::{ElementType, Opcode, Token},
        standalone::RecordedRoot,
        LocalVar, RootVisitor, StandaloneRuntime,
    },
};
use std::sync::{Arc, OnceLock};

fn stressed() -> Fixture {
    let fx = Fixture::new();
    fx.runtime.set_gc_stress(true);
    fx
}

fn int_type(fx: &Fixture) -> Token {
    fx.runtime.type_token(fx.runtime.primitive_type(PrimitiveKind::I4))
}

fn returned_object(value: Option<StackValue>) -> usize {
    match value {
        Some(StackValue::ObjectRef(obj)) => obj.0,
        other => panic!("expected an object, got {:?}", other),
    }
}

fn roots_holding(roots: &[RecordedRoot], value: usize) -> Vec<RecordedRoot> {
    roots.iter().copied().filter(|r| r.value == value).collect()
}

#[test]
fn locals_are_reported_at_allocations() {
    let fx = stressed();
    let int = int_type(&fx);
    let locals = vec![LocalVar::new(OBJECT), LocalVar::new(OBJECT)];
    let (method, _) = fx.method("keep", static_sig(&[], OBJECT), locals, |il| {
        il.emit(Opcode::LdcI4(3))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::StLoc(0))
            .emit(Opcode::LdcI4(2))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::StLoc(1))
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::Ret);
    });
    let kept = returned_object(fx.run(method, &[]).unwrap());

    assert_eq!(fx.runtime.collections(), 2);
    let roots = fx.runtime.take_recorded_roots();
    // Both locals are reported at each allocation, null or not.
    assert_eq!(roots.len(), 4);
    let holding = roots_holding(&roots, kept);
    assert_eq!(holding.len(), 1);
    assert!(!holding[0].interior && !holding[0].pinned);
}

#[test]
fn pinned_locals_are_reported_as_pinning() {
    let fx = stressed();
    let int = int_type(&fx);
    let (method, _) = fx.method("pin", static_sig(&[], OBJECT), vec![LocalVar::pinned(OBJECT)], |il| {
        il.emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::StLoc(0))
            .emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::Pop)
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::Ret);
    });
    let kept = returned_object(fx.run(method, &[]).unwrap());
    let holding = roots_holding(&fx.runtime.recorded_roots(), kept);
    assert_eq!(holding.len(), 1);
    assert!(holding[0].pinned);
}

#[test]
fn evaluation_stack_entries_are_reported() {
    let fx = stressed();
    let int = int_type(&fx);
    let (method, _) = fx.method("stack", static_sig(&[], OBJECT), vec![], |il| {
        il.emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::Pop)
            .emit(Opcode::Ret);
    });
    let kept = returned_object(fx.run(method, &[]).unwrap());
    let roots = fx.runtime.take_recorded_roots();
    assert_eq!(roots_holding(&roots, kept).len(), 1);
}

#[test]
fn outgoing_arguments_are_reported_while_the_callee_runs() {
    let fx = stressed();
    let int = int_type(&fx);
    let (_, callee) = fx.method("callee", static_sig(&[OBJECT], OBJECT), vec![], |il| {
        il.emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::Pop)
            .emit(Opcode::LdArg(0))
            .emit(Opcode::Ret);
    });
    let (caller, _) = fx.method("caller", static_sig(&[], OBJECT), vec![], |il| {
        il.emit(Opcode::LdcI4(4))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::Call(callee))
            .emit(Opcode::Ret);
    });
    let passed = returned_object(fx.run(caller, &[]).unwrap());
    let roots = fx.runtime.take_recorded_roots();
    // Reported once, by whichever frame owns the argument storage.
    assert_eq!(roots_holding(&roots, passed).len(), 1);
}

#[test]
fn managed_pointers_are_reported_as_interior() {
    let fx = stressed();
    let int = int_type(&fx);
    let (method, _) = fx.method("byref", static_sig(&[], I4), vec![LocalVar::new(I4)], |il| {
        il.emit(Opcode::LdLocA(0))
            .emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::Pop)
            .emit(Opcode::LdcI4(7))
            .emit(Opcode::StInd(PrimitiveKind::I4))
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::Ret);
    });
    assert_eq!(fx.run(method, &[]), Ok(Some(StackValue::Int32(7))));
    let roots = fx.runtime.take_recorded_roots();
    assert_eq!(roots.len(), 1);
    assert!(roots[0].interior);
    assert!(!roots[0].pinned);
}

#[test]
fn boxed_values_survive_later_allocations() {
    let fx = stressed();
    let int = int_type(&fx);
    let (method, _) = fx.method("boxed", static_sig(&[], I4), vec![LocalVar::new(OBJECT)], |il| {
        il.emit(Opcode::LdcI4(41))
            .emit(Opcode::Box(int))
            .emit(Opcode::StLoc(0))
            .emit(Opcode::LdcI4(8))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::Pop)
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::UnboxAny(int))
            .emit(Opcode::LdcI4(1))
            .emit(Opcode::Binary(BinaryOp::Add))
            .emit(Opcode::Ret);
    });
    assert_eq!(fx.run(method, &[]), Ok(Some(StackValue::Int32(42))));
    assert_eq!(fx.runtime.collections(), 2);
}

#[test]
fn field_box_and_element_stores_stay_correct_under_stress() {
    let fx = stressed();
    let int = int_type(&fx);
    let holder = fx.runtime.define_type(
        TypeInfo::class("Holder", vec![FlatField { offset: 0, kind: PrimitiveKind::I4 }]),
        None,
    );
    let value = fx.runtime.define_field(holder, I4, 0);
    let object = fx.runtime.type_token(fx.runtime.core_types().object);
    let element = ElementType::Primitive(PrimitiveKind::Object);
    let locals = vec![LocalVar::new(OBJECT), LocalVar::new(OBJECT)];
    let (method, _) = fx.method("mixed", static_sig(&[OBJECT], I4), locals, |il| {
        il.emit(Opcode::LdArg(0))
            .emit(Opcode::LdcI4(40))
            .emit(Opcode::StFld(value))
            .emit(Opcode::LdcI4(2))
            .emit(Opcode::Box(int))
            .emit(Opcode::StLoc(1))
            .emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(object))
            .emit(Opcode::StLoc(0))
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::LdcI4(0))
            .emit(Opcode::LdLoc(1))
            .emit(Opcode::StElem(element))
            .emit(Opcode::LdArg(0))
            .emit(Opcode::LdFld(value))
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::LdcI4(0))
            .emit(Opcode::LdElem(element))
            .emit(Opcode::UnboxAny(int))
            .emit(Opcode::Binary(BinaryOp::Add))
            .emit(Opcode::Ret);
    });
    let target = fx.object_of(holder);
    let before = fx.runtime.collections();
    assert_eq!(
        fx.run(method, &[StackValue::ObjectRef(target)]),
        Ok(Some(StackValue::Int32(42)))
    );
    // The box and the array each still reach a collection point.
    assert_eq!(fx.runtime.collections() - before, 2);
}

#[test]
fn no_collections_without_stress() {
    let fx = Fixture::new();
    let int = int_type(&fx);
    let (method, _) = fx.method("quiet", static_sig(&[], OBJECT), vec![], |il| {
        il.emit(Opcode::LdcI4(1)).emit(Opcode::NewArr(int)).emit(Opcode::Ret);
    });
    fx.run(method, &[]).unwrap();
    assert_eq!(fx.runtime.collections(), 0);
    assert!(fx.runtime.recorded_roots().is_empty());
    assert!(fx.runtime.heap_bytes() > 0);
}

#[test]
fn scanning_outside_interpreted_frames_reports_nothing() {
    let fx = Fixture::new();
    let mut seen = vec![];
    let mut visitor = |slot: *mut usize, interior: bool, pinned: bool| seen.push((slot as usize, interior, pinned));
    assert_eq!(fx.interp.scan_roots(&mut visitor), 0);
    assert!(seen.is_empty());
    assert_eq!(fx.interp.metrics().snapshot().gc_scans, 1);
}

static SCANNED_RUNTIME: OnceLock<Arc<StandaloneRuntime>> = OnceLock::new();

fn count_roots(runtime: &StandaloneRuntime) -> usize {
    let mut ignore = |_: *mut usize, _: bool, _: bool| {};
    gc::scan_current_thread(runtime, &mut ignore as &mut dyn RootVisitor)
}

/// Roots seen from this thread times 100, plus those seen from another.
extern "C" fn roots_here_and_elsewhere() -> i32 {
    let Some(runtime) = SCANNED_RUNTIME.get() else {
        return -1;
    };
    let here = count_roots(runtime);
    let elsewhere = std::thread::scope(|scope| scope.spawn(|| count_roots(runtime)).join().unwrap_or(usize::MAX));
    (here.min(99) * 100 + elsewhere.min(99)) as i32
}

#[test]
fn each_thread_scans_only_its_own_frames() {
    let fx = Fixture::new();
    assert!(SCANNED_RUNTIME.set(fx.runtime.clone()).is_ok());
    let int = int_type(&fx);
    let object = fx.runtime.core_types().object;
    let (_, scan) = fx
        .runtime
        .define_native_method(object, "scan", static_sig(&[], I4), roots_here_and_elsewhere as usize);
    let (method, _) = fx.method("holds", static_sig(&[], I4), vec![LocalVar::new(OBJECT)], |il| {
        il.emit(Opcode::LdcI4(1))
            .emit(Opcode::NewArr(int))
            .emit(Opcode::StLoc(0))
            .emit(Opcode::Call(scan))
            .emit(Opcode::Ret);
    });
    let Ok(Some(StackValue::Int32(packed))) = fx.run(method, &[]) else {
        panic!("scan did not return a count");
    };
    assert!(packed / 100 >= 1, "the running thread reports its local");
    assert_eq!(packed % 100, 0, "another thread sees none of these frames");
}
