mod common;

use common::*;
use dotnet_interp::{
    callconv::{CompiledCode, NativeCallState, NativeReturn},
    types::{rules::BinaryOp, FlatField, PrimitiveKind, TypeHandle, TypeInfo, ValueTypeDescriptor},
    value::StackValue,
    vm::{
        cache::{CachedItem, IlOffsetCache, ResolvedType},
        opcodes::{BranchKind, Opcode},
        BackgroundTieringManager, ExecResult, GenericContext, Interpreter, InterpreterConfig, MethodDescriptor,
        MethodHandle, MethodRegistry, RecordingTieringManager, TierCompiler,
    },
};
use std::sync::Arc;

/// `add(a, b)` plus a driver that calls it twice.
fn add_and_driver(fx: &Fixture) -> (MethodHandle, MethodHandle) {
    let (add, add_token) = fx.method("add", static_sig(&[I4, I4], I4), vec![], |il| {
        il.emit(Opcode::LdArg(0))
            .emit(Opcode::LdArg(1))
            .emit(Opcode::Binary(BinaryOp::Add))
            .emit(Opcode::Ret);
    });
    let (driver, _) = fx.method("driver", static_sig(&[], I4), vec![], |il| {
        il.emit(Opcode::LdcI4(1))
            .emit(Opcode::LdcI4(2))
            .emit(Opcode::Call(add_token))
            .emit(Opcode::LdcI4(3))
            .emit(Opcode::Call(add_token))
            .emit(Opcode::Ret);
    });
    (add, driver)
}

#[test]
fn call_sites_resolve_once_per_offset() {
    let fx = Fixture::new();
    let (_, driver) = add_and_driver(&fx);

    assert_eq!(fx.run(driver, &[]), Ok(Some(StackValue::Int32(6))));
    let first = fx.interp.metrics().snapshot();
    assert_eq!(first.cache_misses, 2);
    assert_eq!(first.cache_hits, 0);

    assert_eq!(fx.run(driver, &[]), Ok(Some(StackValue::Int32(6))));
    let second = fx.interp.metrics().snapshot();
    assert_eq!(second.cache_misses, 2);
    assert_eq!(second.cache_hits, 2);
    assert_eq!(second.cache_races, 0);

    let desc = fx.interp.descriptor(driver).unwrap();
    assert_eq!(desc.call_site_cache(GenericContext::NONE).len(), 2);
}

#[test]
fn disabled_call_site_cache_resolves_every_time() {
    let config = InterpreterConfig {
        use_call_site_cache: false,
        ..InterpreterConfig::default()
    };
    let fx = Fixture::with_config(config);
    let (_, driver) = add_and_driver(&fx);
    for _ in 0..3 {
        assert_eq!(fx.run(driver, &[]), Ok(Some(StackValue::Int32(6))));
    }
    let stats = fx.interp.metrics().snapshot();
    assert_eq!((stats.cache_hits, stats.cache_misses), (0, 0));
    assert!(fx.interp.descriptor(driver).unwrap().call_site_cache(GenericContext::NONE).is_empty());
}

#[test]
fn descriptors_are_built_once_and_shared() {
    let fx = Fixture::new();
    let (add, driver) = add_and_driver(&fx);
    let registry = Arc::new(MethodRegistry::new());
    let a = Interpreter::new(fx.runtime.clone(), InterpreterConfig::default()).with_registry(registry.clone());
    let b = Interpreter::new(fx.runtime.clone(), InterpreterConfig::default()).with_registry(registry.clone());

    let from_a = a.descriptor(add).unwrap();
    let from_b = b.descriptor(add).unwrap();
    assert!(Arc::ptr_eq(&from_a, &from_b));
    assert_eq!(registry.len(), 1);

    // Call-site entries resolved by one interpreter serve the other.
    assert_eq!(a.invoke(driver, &[]), Ok(Some(StackValue::Int32(6))));
    assert_eq!(b.invoke(driver, &[]), Ok(Some(StackValue::Int32(6))));
    assert_eq!(b.metrics().snapshot().cache_misses, 0);
    assert_eq!(b.metrics().snapshot().cache_hits, 2);
}

#[test]
fn concurrent_first_calls_share_one_descriptor() {
    let fx = Fixture::new();
    let (add, _) = add_and_driver(&fx);
    let interp = Arc::new(fx.interp);
    let descriptors: Vec<Arc<MethodDescriptor>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let interp = interp.clone();
                scope.spawn(move || interp.descriptor(add).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(descriptors.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(interp.registry().len(), 1);
}

#[test]
fn racing_inserts_at_one_offset_keep_the_first_entry() {
    let cache = IlOffsetCache::default();
    let results: Vec<(CachedItem, bool)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let item = CachedItem::Type(Arc::new(ResolvedType {
                        handle: TypeHandle(7),
                        info: Arc::new(TypeInfo::primitive("Int32", PrimitiveKind::I4)),
                        ty: ValueTypeDescriptor::I4,
                    }));
                    cache.insert(12, item)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|(_, won)| *won).count(), 1);
    let resolved: Vec<Arc<ResolvedType>> = results
        .into_iter()
        .map(|(item, _)| match item {
            CachedItem::Type(ty) => ty,
            other => panic!("unexpected entry {:?}", other),
        })
        .collect();
    assert!(resolved.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(cache.len(), 1);
    match cache.get(12) {
        Some(CachedItem::Type(ty)) => assert!(Arc::ptr_eq(&ty, &resolved[0])),
        other => panic!("unexpected entry {:?}", other),
    }
}

fn tiered(config: InterpreterConfig) -> (Fixture, Arc<RecordingTieringManager>) {
    let Fixture { runtime, interp } = Fixture::with_config(config);
    let manager = Arc::new(RecordingTieringManager::default());
    let interp = interp.with_tiering(manager.clone());
    (Fixture { runtime, interp }, manager)
}

#[test]
fn promotion_requested_once_at_threshold() {
    let (fx, manager) = tiered(InterpreterConfig::default().with_tiering_threshold(3));
    let (add, driver) = add_and_driver(&fx);

    // The driver's first run calls `add` twice.
    fx.run(driver, &[]).unwrap();
    assert!(manager.requests().is_empty());
    fx.run(driver, &[]).unwrap();
    assert_eq!(manager.requests(), vec![add]);

    for _ in 0..5 {
        fx.run(driver, &[]).unwrap();
    }
    let requests = manager.requests();
    assert_eq!(requests.iter().filter(|&&h| h == add).count(), 1);
    assert!(requests.contains(&driver));
    assert_eq!(fx.interp.metrics().snapshot().promotions_requested, 2);

    let desc = fx.interp.descriptor(add).unwrap();
    assert_eq!(desc.tiering.calls(), 14);
    assert!(desc.tiering.is_requested());
}

#[test]
fn getter_fast_path_counts_toward_promotion() {
    let (fx, manager) = tiered(InterpreterConfig::default().with_tiering_threshold(3));
    let widget = fx.runtime.define_type(
        TypeInfo::class("Widget", vec![FlatField { offset: 0, kind: PrimitiveKind::I4 }]),
        None,
    );
    let size = fx.runtime.define_field(widget, I4, 0);
    let (getter, getter_token) = fx.method_on(widget, "get_Size", instance_sig(&[], I4), vec![], |il| {
        il.emit(Opcode::LdArg(0)).emit(Opcode::LdFld(size)).emit(Opcode::Ret);
    });
    let (driver, _) = fx.method("driver", static_sig(&[OBJECT], I4), vec![], |il| {
        il.emit(Opcode::LdArg(0))
            .emit(Opcode::Call(getter_token))
            .emit(Opcode::LdArg(0))
            .emit(Opcode::Call(getter_token))
            .emit(Opcode::Binary(BinaryOp::Add))
            .emit(Opcode::Ret);
    });
    let obj = StackValue::ObjectRef(fx.object_of(widget));

    assert_eq!(fx.run(driver, &[obj]), Ok(Some(StackValue::Int32(0))));
    assert!(manager.requests().is_empty());
    assert_eq!(fx.run(driver, &[obj]), Ok(Some(StackValue::Int32(0))));
    assert_eq!(manager.requests(), vec![getter]);

    let stats = fx.interp.metrics().snapshot();
    assert_eq!(stats.getter_fast_paths, 4);
    assert_eq!(stats.invocations, 2);
    assert_eq!(fx.interp.descriptor(getter).unwrap().tiering.calls(), 4);
}

fn count_down(fx: &Fixture) -> MethodHandle {
    let (method, _) = fx.method("count_down", static_sig(&[I4], I4), vec![], |il| {
        let (top, done) = (il.label(), il.label());
        il.mark(top);
        il.emit(Opcode::LdArg(0));
        il.branch(BranchKind::False, done);
        il.emit(Opcode::LdArg(0))
            .emit(Opcode::LdcI4(1))
            .emit(Opcode::Binary(BinaryOp::Sub))
            .emit(Opcode::StArg(0));
        il.branch(BranchKind::Always, top);
        il.mark(done);
        il.emit(Opcode::LdArg(0)).emit(Opcode::Ret);
    });
    method
}

#[test]
fn loop_methods_promote_on_first_call_when_not_interpreted() {
    let config = InterpreterConfig {
        interpret_loop_methods: false,
        ..InterpreterConfig::default().with_tiering_threshold(1000)
    };
    let (fx, manager) = tiered(config);
    let method = count_down(&fx);
    assert_eq!(fx.run(method, &[StackValue::Int32(10)]), Ok(Some(StackValue::Int32(0))));
    assert_eq!(manager.requests(), vec![method]);
}

#[test]
fn loop_methods_wait_for_threshold_when_interpreted() {
    let (fx, manager) = tiered(InterpreterConfig::default().with_tiering_threshold(1000));
    let method = count_down(&fx);
    fx.run(method, &[StackValue::Int32(10)]).unwrap();
    assert!(manager.requests().is_empty());
}

/// Compiles exactly one method, by name, into a native adder.
struct AdderCompiler(&'static str);

struct CompiledAdd;

impl CompiledCode for CompiledAdd {
    fn invoke(&self, call: &mut NativeCallState) -> ExecResult<NativeReturn> {
        let sum = (call.int_regs[0] as i32).wrapping_add(call.int_regs[1] as i32);
        Ok(NativeReturn {
            int: [sum as u32 as u64, 0],
            ..NativeReturn::default()
        })
    }
}

impl TierCompiler for AdderCompiler {
    fn compile(&self, method: &MethodDescriptor) -> Option<Arc<dyn CompiledCode>> {
        (method.name() == self.0).then(|| Arc::new(CompiledAdd) as Arc<dyn CompiledCode>)
    }
}

#[test]
fn background_compiler_installs_promoted_code() {
    let Fixture { runtime, interp } = Fixture::with_config(InterpreterConfig::default().with_tiering_threshold(2));
    let manager = Arc::new(BackgroundTieringManager::start(AdderCompiler("add"), interp.registry().clone()));
    let fx = Fixture {
        runtime,
        interp: interp.with_tiering(manager.clone()),
    };
    let (add, driver) = add_and_driver(&fx);

    assert_eq!(fx.run(driver, &[]), Ok(Some(StackValue::Int32(6))));
    // Drains the queue: `add` and nothing else gets compiled.
    assert_eq!(manager.shutdown(), 1);
    assert!(fx.interp.registry().compiled(add).is_some());
    assert!(fx.interp.registry().compiled(driver).is_none());

    let before = fx.interp.metrics().snapshot();
    assert_eq!(fx.run(driver, &[]), Ok(Some(StackValue::Int32(6))));
    let after = fx.interp.metrics().snapshot();
    assert_eq!(after.compiled_calls - before.compiled_calls, 2);
    // Only the driver was interpreted.
    assert_eq!(after.invocations - before.invocations, 1);
}

#[test]
fn promotion_requests_do_not_block_after_shutdown() {
    let registry = Arc::new(MethodRegistry::new());
    let manager = Arc::new(BackgroundTieringManager::start(AdderCompiler("add"), registry.clone()));
    assert_eq!(manager.shutdown(), 0);

    let Fixture { runtime, interp } = Fixture::with_config(InterpreterConfig::default().with_tiering_threshold(1));
    let fx = Fixture {
        runtime,
        interp: interp.with_registry(registry).with_tiering(manager),
    };
    let (_, driver) = add_and_driver(&fx);
    assert_eq!(fx.run(driver, &[]), Ok(Some(StackValue::Int32(6))));
}
