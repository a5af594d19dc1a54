// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async functions and async sequences driven through the run queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use coil_ast::{BinaryOp, BodyBuilder, FnBody, Ty};
use coil_mir::lower::{lower_function, LowerConfig, Lowered, StateMachineLowering};
use coil_rt::{Operation, Runtime, RuntimeBuilder, RuntimeError, Value, CANCELLED};

fn lower(body: FnBody) -> StateMachineLowering {
    match lower_function(&body, &LowerConfig::default()).expect("body lowers") {
        Lowered::StateMachine(m) => *m,
        Lowered::Plain => panic!("expected a state machine"),
    }
}

/// Host `fetch()` that hands out `op`.
fn serving(op: &Operation) -> RuntimeBuilder {
    let op = op.clone();
    Runtime::builder().host_fn("fetch", move |_| Ok(Value::Operation(op.clone())))
}

fn operation(value: Value) -> Operation {
    match value {
        Value::Operation(op) => op,
        other => panic!("expected an operation, got {}", other),
    }
}

/// `async fn doubled() -> int { return wait fetch() * 2 }`
fn doubled() -> FnBody {
    let mut b = BodyBuilder::new("doubled");
    b.set_async().set_return(Ty::Int);
    let call = b.call("fetch", vec![]);
    let w = b.wait(call);
    let two = b.int(2);
    let product = b.binary(BinaryOp::Mul, w, two);
    let r = b.ret(Some(product));
    b.finish(vec![r])
}

#[test]
fn completed_operation_still_resumes_through_the_queue() {
    let rt = serving(&Operation::ready(Value::Int(21)))
        .load(&lower(doubled()))
        .build();

    let result = operation(rt.call("doubled", vec![]).unwrap());
    assert!(!result.is_completed());
    assert_eq!(rt.queue().len(), 1);

    assert_eq!(rt.run_until_idle().unwrap(), 1);
    assert_eq!(result.result().unwrap(), Value::Int(42));
    assert!(rt.queue().is_empty());
}

#[test]
fn pending_operation_resumes_on_the_completing_thread() {
    let pending = Operation::new();
    let rt = serving(&pending).load(&lower(doubled())).build();

    let task = rt.spawn("doubled", None, vec![]).unwrap();
    assert!(!task.is_completed());
    assert_eq!(rt.run_until_idle().unwrap(), 0);

    // Resumes on the completing thread; nothing is queued.
    pending.complete(Value::Int(5)).unwrap();
    assert!(rt.queue().is_empty());
    assert_eq!(task.completion().result().unwrap(), Value::Int(10));
}

#[test]
fn fault_propagates_to_the_completion() {
    let rt = serving(&Operation::failed(Value::error("Io", Value::Unit)))
        .load(&lower(doubled()))
        .build();

    let result = operation(rt.call("doubled", vec![]).unwrap());
    rt.run_until_idle().unwrap();
    match result.outcome() {
        Some(Err(fault)) => assert_eq!(fault.error_tag(), Some("Io")),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn fault_can_be_caught_after_resuming() {
    // try { return wait fetch() } catch Io { return -1 }
    let mut b = BodyBuilder::new("fallback");
    b.set_async().set_return(Ty::Int);
    let call = b.call("fetch", vec![]);
    let w = b.wait(call);
    let r = b.ret(Some(w));
    let body = b.block(|_| vec![r]);
    let minus_one = b.int(-1);
    let r2 = b.ret(Some(minus_one));
    let handler = b.block(|_| vec![r2]);
    let clause = b.catch(Some("Io"), None, None, handler);
    let t = b.try_(body, vec![clause], None);

    let rt = serving(&Operation::failed(Value::error("Io", Value::Unit)))
        .load(&lower(b.finish(vec![t])))
        .build();
    let result = operation(rt.call("fallback", vec![]).unwrap());
    rt.run_until_idle().unwrap();
    assert_eq!(result.result().unwrap(), Value::Int(-1));
}

#[test]
fn cancel_runs_finally_and_faults_the_task() {
    // try { wait fetch() } finally { log() }
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let mut b = BodyBuilder::new("guarded");
    b.set_async();
    let call = b.call("fetch", vec![]);
    let w = b.wait(call);
    let s = b.expr(w);
    let body = b.block(|_| vec![s]);
    let log = b.call("log", vec![]);
    let ls = b.expr(log);
    let fin = b.block(|_| vec![ls]);
    let t = b.try_(body, vec![], Some(fin));

    let pending = Operation::new();
    let rt = serving(&pending)
        .host_fn("log", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Unit)
        })
        .load(&lower(b.finish(vec![t])))
        .build();

    let task = rt.spawn("guarded", None, vec![]).unwrap();
    assert!(task.cancel().unwrap());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    match task.completion().outcome() {
        Some(Err(fault)) => assert_eq!(fault.error_tag(), Some(CANCELLED)),
        other => panic!("unexpected outcome {:?}", other),
    }

    // The late completion finds a disposed object and does nothing.
    pending.complete(Value::Unit).unwrap();
    assert_eq!(rt.run_until_idle().unwrap(), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!task.cancel().unwrap());
}

#[test]
fn completion_from_another_thread_resumes_there() {
    let pending = Operation::new();
    let rt = serving(&pending).load(&lower(doubled())).build();
    let task = rt.spawn("doubled", None, vec![]).unwrap();

    let completer = pending.clone();
    std::thread::spawn(move || completer.complete(Value::Int(4)))
        .join()
        .unwrap()
        .unwrap();
    assert_eq!(task.completion().result().unwrap(), Value::Int(8));
}

#[test]
fn spawn_requires_an_async_function() {
    let mut b = BodyBuilder::new("gen");
    let one = b.int(1);
    let p = b.produce(one);
    let rt = Runtime::builder().load(&lower(b.finish(vec![p]))).build();
    assert!(matches!(
        rt.spawn("gen", None, vec![]),
        Err(RuntimeError::TypeError { expected: "async function", .. })
    ));
    assert!(matches!(
        rt.spawn("missing", None, vec![]),
        Err(RuntimeError::UndefinedFunction(_))
    ));
}

#[test]
fn async_sequence_pulls_through_operations() {
    // produce 1; produce wait fetch()
    let mut b = BodyBuilder::new("pairs");
    let one = b.int(1);
    let p1 = b.produce(one);
    let call = b.call("fetch", vec![]);
    let w = b.wait(call);
    let p2 = b.produce(w);

    let pending = Operation::new();
    let rt = serving(&pending).load(&lower(b.finish(vec![p1, p2]))).build();
    let seq = rt.async_generator(rt.call("pairs", vec![]).unwrap()).unwrap();

    let first = seq.next().unwrap();
    assert_eq!(first.result().unwrap(), Value::Option(Some(Box::new(Value::Int(1)))));

    let second = seq.next().unwrap();
    assert!(!second.is_completed());
    assert!(matches!(seq.next(), Err(RuntimeError::StepInProgress)));

    pending.complete(Value::Int(5)).unwrap();
    assert_eq!(second.result().unwrap(), Value::Option(Some(Box::new(Value::Int(5)))));

    assert_eq!(seq.next().unwrap().result().unwrap(), Value::Option(None));
    assert_eq!(seq.next().unwrap().result().unwrap(), Value::Option(None));
}

#[test]
fn disposing_async_sequence_cancels_waiting_pull() {
    let mut b = BodyBuilder::new("stream");
    let call = b.call("fetch", vec![]);
    let w = b.wait(call);
    let p = b.produce(w);

    let pending = Operation::new();
    let rt = serving(&pending).load(&lower(b.finish(vec![p]))).build();
    let seq = rt.async_generator(rt.call("stream", vec![]).unwrap()).unwrap();

    let pull = seq.next().unwrap();
    assert!(seq.dispose().unwrap());
    match pull.outcome() {
        Some(Err(fault)) => assert_eq!(fault.error_tag(), Some(CANCELLED)),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(matches!(seq.next(), Err(RuntimeError::Disposed)));
}
