mod common;

use common::*;
use dotnet_interp::{
    callconv::{CompiledCode, NativeCallState, NativeReturn},
    types::{rules::BinaryOp, TypeInfo},
    value::{ObjectRef, StackValue},
    vm::{
        opcodes::{Opcode, PrefixedOpcode, Token},
        tracer::Tracer,
        ExecResult, InterpreterConfig, LocalVar, ManagedExceptionKind, ObjectModel, Unwind,
    },
};
use parking_lot::Mutex;
use std::{io::Write, sync::Arc};

/// A static int the handlers bump, and where to read it.
fn counter(fx: &Fixture) -> (Token, *mut i32) {
    let owner = fx.runtime.define_type(TypeInfo::class("Log", vec![]), None);
    let field = fx.runtime.define_static_field(owner, I4);
    (field, fx.runtime.static_address(field).unwrap().cast())
}

fn bump(il: &mut dotnet_interp::vm::ILBuilder, field: Token, by: i32) {
    il.emit(Opcode::LdSFld(field))
        .emit(Opcode::LdcI4(by))
        .emit(Opcode::Binary(BinaryOp::Add))
        .emit(Opcode::StSFld(field));
}

fn exception_token(fx: &Fixture, kind: ManagedExceptionKind) -> Token {
    fx.runtime.type_token(fx.runtime.exception_type(kind))
}

fn divide_by_zero(il: &mut dotnet_interp::vm::ILBuilder) {
    il.emit(Opcode::LdcI4(1))
        .emit(Opcode::LdcI4(0))
        .emit(Opcode::Binary(BinaryOp::Div))
        .emit(Opcode::Pop);
}

#[test]
fn catch_handles_matching_exception() {
    let fx = Fixture::new();
    let catch_type = exception_token(&fx, ManagedExceptionKind::DivideByZero);
    let (method, _) = fx.method("test", static_sig(&[], I4), vec![LocalVar::new(I4)], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start);
        divide_by_zero(il);
        il.emit(Opcode::LdcI4(1))
            .emit(Opcode::StLoc(0))
            .leave(end)
            .mark(try_end)
            .emit(Opcode::Pop)
            .emit(Opcode::LdcI4(99))
            .emit(Opcode::StLoc(0))
            .leave(end)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::Ret)
            .catch(catch_type, (try_start, try_end), (try_end, handler_end));
    });
    assert_eq!(fx.run(method, &[]), Ok(Some(StackValue::Int32(99))));
    let stats = fx.interp.metrics().snapshot();
    assert_eq!(stats.exceptions_caught, 1);
}

#[derive(Clone, Default)]
struct TraceSink(Arc<Mutex<Vec<u8>>>);

impl Write for TraceSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn tracer_follows_a_caught_exception() {
    let sink = TraceSink::default();
    let Fixture { runtime, interp } = Fixture::new();
    let fx = Fixture {
        runtime,
        interp: interp.with_tracer(Tracer::to_writer(sink.clone())),
    };
    let catch_type = exception_token(&fx, ManagedExceptionKind::DivideByZero);
    let (method, _) = fx.method("traced", static_sig(&[], I4), vec![], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start);
        divide_by_zero(il);
        il.leave(end)
            .mark(try_end)
            .emit(Opcode::Pop)
            .leave(end)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::LdcI4(3))
            .emit(Opcode::Ret)
            .catch(catch_type, (try_start, try_end), (try_end, handler_end));
    });
    assert_eq!(fx.run(method, &[]), Ok(Some(StackValue::Int32(3))));
    fx.interp.tracer().flush();

    let text = String::from_utf8(sink.0.lock().clone()).unwrap();
    for expected in ["enter traced", "raising System.DivideByZeroException", "throw ", "caught ", "leave traced"] {
        assert!(text.contains(expected), "missing {:?} in trace:\n{}", expected, text);
    }
    let stats = fx.interp.tracer().stats();
    assert_eq!((stats.entries, stats.exits, stats.exceptions), (1, 1, 1));
}

#[test]
fn catch_by_base_type() {
    let fx = Fixture::new();
    let catch_type = fx.runtime.type_token(fx.runtime.core_types().exception);
    let (method, _) = fx.method("test", static_sig(&[], I4), vec![], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start)
            .emit(Opcode::LdNull)
            .emit(Opcode::Throw)
            .mark(try_end)
            .emit(Opcode::Pop)
            .leave(end)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::LdcI4(7))
            .emit(Opcode::Ret)
            .catch(catch_type, (try_start, try_end), (try_end, handler_end));
    });
    assert_eq!(fx.run(method, &[]), Ok(Some(StackValue::Int32(7))));
}

#[test]
fn unmatched_catch_lets_exception_escape() {
    let fx = Fixture::new();
    let catch_type = exception_token(&fx, ManagedExceptionKind::InvalidCast);
    let (method, _) = fx.method("test", static_sig(&[], VOID), vec![], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start);
        divide_by_zero(il);
        il.leave(end)
            .mark(try_end)
            .emit(Opcode::Pop)
            .leave(end)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::Ret)
            .catch(catch_type, (try_start, try_end), (try_end, handler_end));
    });
    assert_eq!(
        fx.exception_name(fx.run(method, &[])),
        "System.DivideByZeroException"
    );
}

#[test]
fn filter_decides_whether_to_catch() {
    let fx = Fixture::new();
    let (method, _) = fx.method("test", static_sig(&[I4], I4), vec![LocalVar::new(I4)], |il| {
        let (try_start, try_end, handler, handler_end, end) =
            (il.label(), il.label(), il.label(), il.label(), il.label());
        il.mark(try_start);
        divide_by_zero(il);
        il.leave(end)
            .mark(try_end)
            // Filter: the argument is the verdict.
            .emit(Opcode::Pop)
            .emit(Opcode::LdArg(0))
            .emit(Opcode::Prefixed(PrefixedOpcode::EndFilter))
            .mark(handler)
            .emit(Opcode::Pop)
            .emit(Opcode::LdcI4(5))
            .emit(Opcode::StLoc(0))
            .leave(end)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::Ret)
            .filter(try_end, (try_start, try_end), (handler, handler_end));
    });
    assert_eq!(fx.run(method, &[StackValue::Int32(1)]), Ok(Some(StackValue::Int32(5))));
    assert_eq!(
        fx.exception_name(fx.run(method, &[StackValue::Int32(0)])),
        "System.DivideByZeroException"
    );
}

#[test]
fn finally_runs_on_leave_and_on_unwind() {
    let fx = Fixture::new();
    let (log, value) = counter(&fx);
    let (method, _) = fx.method("test", static_sig(&[I4], VOID), vec![], |il| {
        let (try_start, try_end, handler_end, end, skip) =
            (il.label(), il.label(), il.label(), il.label(), il.label());
        il.mark(try_start)
            .emit(Opcode::LdArg(0))
            .branch(dotnet_interp::vm::opcodes::BranchKind::False, skip);
        divide_by_zero(il);
        il.mark(skip).leave(end).mark(try_end);
        bump(il, log, 1);
        il.emit(Opcode::EndFinally)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::Ret)
            .finally((try_start, try_end), (try_end, handler_end));
    });
    assert_eq!(fx.run(method, &[StackValue::Int32(0)]), Ok(None));
    assert_eq!(unsafe { value.read() }, 1);
    assert_eq!(
        fx.exception_name(fx.run(method, &[StackValue::Int32(1)])),
        "System.DivideByZeroException"
    );
    assert_eq!(unsafe { value.read() }, 2);
}

#[test]
fn fault_runs_only_on_unwind() {
    let fx = Fixture::new();
    let (log, value) = counter(&fx);
    let (method, _) = fx.method("test", static_sig(&[I4], VOID), vec![], |il| {
        let (try_start, try_end, handler_end, end, skip) =
            (il.label(), il.label(), il.label(), il.label(), il.label());
        il.mark(try_start)
            .emit(Opcode::LdArg(0))
            .branch(dotnet_interp::vm::opcodes::BranchKind::False, skip);
        divide_by_zero(il);
        il.mark(skip).leave(end).mark(try_end);
        bump(il, log, 1);
        il.emit(Opcode::EndFinally)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::Ret)
            .fault((try_start, try_end), (try_end, handler_end));
    });
    assert_eq!(fx.run(method, &[StackValue::Int32(0)]), Ok(None));
    assert_eq!(unsafe { value.read() }, 0);
    assert!(fx.run(method, &[StackValue::Int32(1)]).is_err());
    assert_eq!(unsafe { value.read() }, 1);
}

#[test]
fn nested_finally_runs_before_outer_catch_across_frames() {
    let fx = Fixture::new();
    let (log, value) = counter(&fx);
    let (_, thrower) = fx.method("thrower", static_sig(&[], VOID), vec![], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start);
        divide_by_zero(il);
        il.leave(end).mark(try_end);
        bump(il, log, 1);
        il.emit(Opcode::EndFinally)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::Ret)
            .finally((try_start, try_end), (try_end, handler_end));
    });
    let catch_type = fx.runtime.type_token(fx.runtime.core_types().exception);
    let (method, _) = fx.method("caller", static_sig(&[], I4), vec![], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start)
            .emit(Opcode::Call(thrower))
            .leave(end)
            .mark(try_end)
            .emit(Opcode::Pop);
        bump(il, log, 10);
        il.leave(end)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::LdSFld(log))
            .emit(Opcode::Ret)
            .catch(catch_type, (try_start, try_end), (try_end, handler_end));
    });
    assert_eq!(fx.run(method, &[]), Ok(Some(StackValue::Int32(11))));
    assert_eq!(unsafe { value.read() }, 11);
}

#[test]
fn leave_from_catch_runs_enclosing_finally() {
    let fx = Fixture::new();
    let (log, value) = counter(&fx);
    let catch_type = fx.runtime.type_token(fx.runtime.core_types().exception);
    let (method, _) = fx.method("test", static_sig(&[], VOID), vec![], |il| {
        let (outer_start, inner_start, inner_end, catch_end, outer_end, finally_end, end) = (
            il.label(),
            il.label(),
            il.label(),
            il.label(),
            il.label(),
            il.label(),
            il.label(),
        );
        il.mark(outer_start).mark(inner_start);
        divide_by_zero(il);
        il.leave(end)
            .mark(inner_end)
            .emit(Opcode::Pop)
            .leave(end)
            .mark(catch_end)
            .mark(outer_end);
        bump(il, log, 1);
        il.emit(Opcode::EndFinally)
            .mark(finally_end)
            .mark(end)
            .emit(Opcode::Ret)
            .catch(catch_type, (inner_start, inner_end), (inner_end, catch_end))
            .finally((outer_start, outer_end), (outer_end, finally_end));
    });
    assert_eq!(fx.run(method, &[]), Ok(None));
    assert_eq!(unsafe { value.read() }, 1);
}

/// `log = log * 10 + digit`, so the final value spells the run order.
fn record(il: &mut dotnet_interp::vm::ILBuilder, field: Token, digit: i32) {
    il.emit(Opcode::LdSFld(field))
        .emit(Opcode::LdcI4(10))
        .emit(Opcode::Binary(BinaryOp::Mul))
        .emit(Opcode::LdcI4(digit))
        .emit(Opcode::Binary(BinaryOp::Add))
        .emit(Opcode::StSFld(field));
}

#[test]
fn one_leave_runs_nested_finally_blocks_innermost_first() {
    let fx = Fixture::new();
    let (log, value) = counter(&fx);
    let (method, _) = fx.method("test", static_sig(&[], I4), vec![], |il| {
        let (outer_start, inner_start, inner_end, outer_end, outer_handler_end, end) =
            (il.label(), il.label(), il.label(), il.label(), il.label(), il.label());
        il.mark(outer_start)
            .mark(inner_start)
            .leave(end)
            .mark(inner_end);
        record(il, log, 1);
        il.emit(Opcode::EndFinally).mark(outer_end);
        record(il, log, 2);
        il.emit(Opcode::EndFinally)
            .mark(outer_handler_end)
            .mark(end)
            .emit(Opcode::LdSFld(log))
            .emit(Opcode::Ret)
            .finally((inner_start, inner_end), (inner_end, outer_end))
            .finally((outer_start, outer_end), (outer_end, outer_handler_end));
    });
    assert_eq!(fx.run(method, &[]), Ok(Some(StackValue::Int32(12))));
    assert_eq!(unsafe { value.read() }, 12);
}

#[test]
fn catch_after_declining_filter_starts_with_only_the_exception() {
    let fx = Fixture::new();
    let catch_type = fx.runtime.type_token(fx.runtime.core_types().exception);
    let (handle, _) = fx.reserve();
    let def = body(handle, "test", static_sig(&[], I4), vec![LocalVar::new(I4)], |il| {
        let (try_start, try_end, filtered, filtered_end, caught_end, end) =
            (il.label(), il.label(), il.label(), il.label(), il.label(), il.label());
        il.mark(try_start);
        divide_by_zero(il);
        il.leave(end)
            .mark(try_end)
            .emit(Opcode::Pop)
            .emit(Opcode::LdcI4(0))
            .emit(Opcode::Prefixed(PrefixedOpcode::EndFilter))
            .mark(filtered)
            .emit(Opcode::Pop)
            .emit(Opcode::LdcI4(1))
            .emit(Opcode::StLoc(0))
            .leave(end)
            .mark(filtered_end)
            // With room for two entries, any leftover from the filter
            // overflows here.
            .emit(Opcode::LdcI4(7))
            .emit(Opcode::StLoc(0))
            .emit(Opcode::Pop)
            .leave(end)
            .mark(caught_end)
            .mark(end)
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::Ret)
            .filter(try_end, (try_start, try_end), (filtered, filtered_end))
            .catch(catch_type, (try_start, try_end), (filtered_end, caught_end));
    })
    .with_owner(fx.runtime.core_types().object)
    .with_max_stack(2);
    fx.install(def);
    assert_eq!(fx.run(handle, &[]), Ok(Some(StackValue::Int32(7))));
    assert_eq!(fx.interp.metrics().snapshot().exceptions_caught, 1);
}

#[test]
fn rethrow_preserves_the_exception_object() {
    let fx = Fixture::new();
    let catch_type = fx.runtime.type_token(fx.runtime.core_types().exception);
    let (method, _) = fx.method("test", static_sig(&[OBJECT], VOID), vec![], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start)
            .emit(Opcode::LdArg(0))
            .emit(Opcode::Throw)
            .mark(try_end)
            .emit(Opcode::Pop)
            .emit(Opcode::Prefixed(PrefixedOpcode::Rethrow))
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::Ret)
            .catch(catch_type, (try_start, try_end), (try_end, handler_end));
    });
    let thrown = fx.runtime.new_exception(ManagedExceptionKind::InvalidProgram);
    assert_eq!(
        fx.run(method, &[StackValue::ObjectRef(thrown)]),
        Err(Unwind::Exception(thrown))
    );
}

#[test]
fn rethrow_outside_catch_is_fatal() {
    let fx = Fixture::new();
    let (method, _) = fx.method("test", static_sig(&[], VOID), vec![], |il| {
        il.emit(Opcode::Prefixed(PrefixedOpcode::Rethrow)).emit(Opcode::Ret);
    });
    assert!(fx.run(method, &[]).unwrap_err().is_fatal());
}

#[test]
fn fatal_errors_run_finally_but_are_not_caught() {
    let fx = Fixture::new();
    let (log, value) = counter(&fx);
    let catch_type = fx.runtime.type_token(fx.runtime.core_types().object);
    let (method, _) = fx.method("test", static_sig(&[], VOID), vec![], |il| {
        let (try_start, catch_start, catch_end, finally_start, finally_end, end) =
            (il.label(), il.label(), il.label(), il.label(), il.label(), il.label());
        il.mark(try_start)
            .emit(Opcode::Jmp(0))
            .leave(end)
            .mark(catch_start)
            .emit(Opcode::Pop)
            .leave(end)
            .mark(catch_end)
            .mark(finally_start);
        bump(il, log, 1);
        il.emit(Opcode::EndFinally)
            .mark(finally_end)
            .mark(end)
            .emit(Opcode::Ret)
            .catch(catch_type, (try_start, catch_start), (catch_start, catch_end))
            .finally((try_start, catch_end), (finally_start, finally_end));
    });
    assert!(fx.run(method, &[]).unwrap_err().is_fatal());
    assert_eq!(unsafe { value.read() }, 1);
}

struct ForeignThrow(ObjectRef);

impl CompiledCode for ForeignThrow {
    fn invoke(&self, _call: &mut NativeCallState) -> ExecResult<NativeReturn> {
        Err(Unwind::Exception(self.0))
    }
}

#[test]
fn wrapped_foreign_exception_is_caught_by_its_payload_type() {
    let fx = Fixture::new();
    let payload = fx.runtime.new_string("thrown from elsewhere");
    let wrapper = fx.runtime.wrap_foreign_exception(payload);
    let object = fx.runtime.core_types().object;
    let (_, foreign) = fx.runtime.define_compiled_method(
        object,
        "foreign",
        static_sig(&[], VOID),
        std::sync::Arc::new(ForeignThrow(wrapper)),
    );
    let string = fx.runtime.type_token(fx.runtime.core_types().string);
    let (method, _) = fx.method("test", static_sig(&[], OBJECT), vec![LocalVar::new(OBJECT)], |il| {
        let (try_start, try_end, handler_end, end) = (il.label(), il.label(), il.label(), il.label());
        il.mark(try_start)
            .emit(Opcode::Call(foreign))
            .leave(end)
            .mark(try_end)
            .emit(Opcode::StLoc(0))
            .leave(end)
            .mark(handler_end)
            .mark(end)
            .emit(Opcode::LdLoc(0))
            .emit(Opcode::Ret)
            .catch(string, (try_start, try_end), (try_end, handler_end));
    });
    let caught = fx.run(method, &[]).unwrap().unwrap();
    assert_eq!(caught, StackValue::ObjectRef(payload));
    assert_eq!(fx.string(caught).as_deref(), Some("thrown from elsewhere"));
}

#[test]
fn synchronized_methods_release_the_monitor_on_unwind() {
    let fx = Fixture::new();
    let account = fx.runtime.define_type(TypeInfo::class("Account", vec![]), None);
    let (handle, _) = fx.reserve();
    let def = body(handle, "Withdraw", instance_sig(&[I4], VOID), vec![], |il| {
        let fine = il.label();
        il.emit(Opcode::LdArg(1))
            .branch(dotnet_interp::vm::opcodes::BranchKind::False, fine);
        divide_by_zero(il);
        il.mark(fine).emit(Opcode::Ret);
    })
    .with_owner(account)
    .synchronized();
    fx.install(def);
    let obj = fx.object_of(account);
    assert_eq!(
        fx.run(handle, &[StackValue::ObjectRef(obj), StackValue::Int32(0)]),
        Ok(None)
    );
    assert_eq!(fx.runtime.monitor_depth(obj), 0);
    assert!(fx.run(handle, &[StackValue::ObjectRef(obj), StackValue::Int32(1)]).is_err());
    assert_eq!(fx.runtime.monitor_depth(obj), 0);
}

#[test]
fn pending_interrupt_is_observed_at_backward_branch() {
    let fx = Fixture::new();
    let (method, _) = fx.method("spin", static_sig(&[], VOID), vec![], |il| {
        let top = il.label();
        il.mark(top)
            .emit(Opcode::Nop)
            .branch(dotnet_interp::vm::opcodes::BranchKind::Always, top);
    });
    let interrupt = fx.runtime.new_exception(ManagedExceptionKind::ThreadInterrupted);
    fx.runtime.interrupt(interrupt);
    assert_eq!(fx.run(method, &[]), Err(Unwind::Exception(interrupt)));
}

#[test]
fn runaway_recursion_raises_stack_overflow() {
    let config = InterpreterConfig {
        max_call_depth: 32,
        ..InterpreterConfig::default()
    };
    let fx = Fixture::with_config(config);
    let (handle, token) = fx.reserve();
    fx.define(handle, "forever", static_sig(&[], VOID), vec![], |il| {
        il.emit(Opcode::Call(token)).emit(Opcode::Ret);
    });
    assert_eq!(
        fx.exception_name(fx.run(handle, &[])),
        "System.StackOverflowException"
    );
}
