//! Compilation broker behavior across threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use prism_target::{
    AdapterDirection, AdapterSig, CompilationBroker, CompileError, CompileRequest, CompiledMethod,
    Compiler, GeneratedCode, MethodFlavor, MethodId, ParamKind, StubRoutines, TargetConfig,
    TargetRuntime, TargetState,
};

const ROUTINES: StubRoutines = StubRoutines {
    static_resolve: 0x7100_0000,
    virtual_resolve: 0x7200_0000,
    interface_resolve: 0x7300_0000,
    trap: 0x7400_0000,
};

/// Time given to spawned threads to block on an in-progress compilation.
const SETTLE: Duration = Duration::from_millis(200);

// =============================================================================
// Helpers
// =============================================================================

fn runtime() -> TargetRuntime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    TargetRuntime::new(TargetConfig::for_testing(), ROUTINES).unwrap()
}

fn install(
    request: &CompileRequest<'_>,
    name: String,
) -> Result<Arc<CompiledMethod>, CompileError> {
    let method = CompiledMethod::new(name, MethodFlavor::Compiled).with_method(request.method());
    method.set_generated(request.region(), GeneratedCode::new(vec![0x90, 0x90, 0x90, 0xC3]))?;
    method.publish();
    Ok(Arc::new(method))
}

/// Names each compiled version `v0`, `v1`, ...
#[derive(Default)]
struct Versioned {
    compiled: AtomicUsize,
}

impl Compiler for Versioned {
    fn name(&self) -> &'static str {
        "versioned"
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Arc<CompiledMethod>, CompileError> {
        let version = self.compiled.fetch_add(1, Ordering::SeqCst);
        install(request, format!("v{version}"))
    }
}

/// Reports that it started, then blocks until the gate opens.
struct Gated {
    started: Mutex<Sender<()>>,
    gate: Mutex<Receiver<()>>,
    compiled: AtomicUsize,
    fail: bool,
}

impl Gated {
    fn new(fail: bool) -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = channel();
        let (gate_tx, gate_rx) = channel();
        let compiler = Arc::new(Self {
            started: Mutex::new(started_tx),
            gate: Mutex::new(gate_rx),
            compiled: AtomicUsize::new(0),
            fail,
        });
        (compiler, started_rx, gate_tx)
    }
}

impl Compiler for Gated {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Arc<CompiledMethod>, CompileError> {
        self.compiled.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().send(()).unwrap();
        self.gate.lock().unwrap().recv().unwrap();
        if self.fail {
            return Err(CompileError::Failed {
                method: request.method(),
                compiler: self.name(),
                reason: "unsupported bytecode".into(),
            });
        }
        install(request, "gated".into())
    }
}

fn names(broker: &CompilationBroker, method: MethodId) -> Vec<String> {
    broker
        .history(method)
        .iter()
        .map(|m| m.name().to_owned())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_concurrent_requests_share_one_compilation() {
    let runtime = Arc::new(runtime());
    let method = MethodId(1);
    let (compiler, started, gate) = Gated::new(false);

    let first = {
        let runtime = Arc::clone(&runtime);
        let compiler = Arc::clone(&compiler);
        thread::spawn(move || runtime.compile(method, &*compiler))
    };
    started.recv().unwrap();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let compiler = Arc::clone(&compiler);
            thread::spawn(move || runtime.compile(method, &*compiler))
        })
        .collect();
    thread::sleep(SETTLE);
    assert!(runtime.broker().is_compiling(method));
    gate.send(()).unwrap();

    let compiled = first.join().unwrap().unwrap();
    for waiter in waiters {
        let target = waiter.join().unwrap().unwrap();
        assert!(Arc::ptr_eq(&target, &compiled));
    }
    assert_eq!(compiler.compiled.load(Ordering::SeqCst), 1);
    assert!(matches!(
        runtime.broker().target_state(method),
        TargetState::Single(ref t) if Arc::ptr_eq(t, &compiled)
    ));
}

#[test]
fn test_history_grows_newest_first() {
    let runtime = runtime();
    let method = MethodId(2);
    let compiler = Versioned::default();

    assert!(runtime.broker().history(method).is_empty());
    for _ in 0..3 {
        runtime.compile(method, &compiler).unwrap();
    }
    assert_eq!(names(runtime.broker(), method), ["v2", "v1", "v0"]);
    assert_eq!(
        runtime.broker().current_target(method).unwrap().name(),
        "v2"
    );
}

#[test]
fn test_failed_recompilation_keeps_history_and_reaches_waiters() {
    let runtime = Arc::new(runtime());
    let method = MethodId(3);
    let versioned = Versioned::default();
    for _ in 0..3 {
        runtime.compile(method, &versioned).unwrap();
    }

    let (gated, started, gate) = Gated::new(true);
    let compiling = {
        let runtime = Arc::clone(&runtime);
        let gated = Arc::clone(&gated);
        thread::spawn(move || runtime.compile(method, &*gated))
    };
    started.recv().unwrap();

    // Mid-compile the previous versions stay current.
    let broker = runtime.broker();
    assert!(broker.is_compiling(method));
    assert_eq!(broker.current_target(method).unwrap().name(), "v2");
    match broker.target_state(method) {
        TargetState::Compiling(compilation) => {
            assert_eq!(compilation.method(), method);
            assert_eq!(compilation.compiler(), "gated");
            assert_eq!(compilation.thread(), compiling.thread().id());
            assert_eq!(compilation.previous().history().len(), 3);
            assert!(compilation.outcome().is_none());
        }
        other => panic!("expected a compilation in progress, got {other}"),
    }

    let waiter = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || runtime.compile(method, &Versioned::default()))
    };
    thread::sleep(SETTLE);
    gate.send(()).unwrap();

    let err = compiling.join().unwrap().unwrap_err();
    assert!(matches!(err, CompileError::Failed { compiler: "gated", .. }));
    let waited = waiter.join().unwrap().unwrap_err();
    assert_eq!(waited.to_string(), err.to_string());

    let state = runtime.broker().target_state(method);
    assert!(state.is_failed());
    assert_eq!(names(runtime.broker(), method), ["v2", "v1", "v0"]);

    // A later compile starts from the surviving history.
    runtime.compile(method, &versioned).unwrap();
    assert_eq!(names(runtime.broker(), method), ["v3", "v2", "v1", "v0"]);
    assert!(!runtime.broker().target_state(method).is_failed());
}

#[test]
fn test_bounded_wait_times_out() {
    let runtime = Arc::new(runtime());
    let method = MethodId(4);
    let (gated, started, gate) = Gated::new(false);
    let compiling = {
        let runtime = Arc::clone(&runtime);
        let gated = Arc::clone(&gated);
        thread::spawn(move || runtime.compile(method, &*gated))
    };
    started.recv().unwrap();

    let err = runtime
        .broker()
        .compile_timeout(method, &Versioned::default(), Duration::from_millis(20))
        .unwrap_err();
    assert!(matches!(err, CompileError::Timeout { method: m, .. } if m == method));

    gate.send(()).unwrap();
    let compiled = compiling.join().unwrap().unwrap();
    assert!(Arc::ptr_eq(
        &runtime.broker().current_target(method).unwrap(),
        &compiled
    ));
}

#[test]
fn test_adapters_are_shared_per_signature_and_direction() {
    let runtime = runtime();
    let adapters = runtime.adapters();
    let sig = AdapterSig::new([ParamKind::Int, ParamKind::Reference]);

    let a = adapters
        .make(&sig, AdapterDirection::BaselineToOptimized, false)
        .unwrap();
    let b = adapters
        .make(&sig, AdapterDirection::BaselineToOptimized, false)
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.flavor(), MethodFlavor::Adapter);
    assert!(a.is_published());

    let other_direction = adapters
        .make(&sig, AdapterDirection::OptimizedToBaseline, false)
        .unwrap();
    let static_call = adapters
        .make(&sig, AdapterDirection::BaselineToOptimized, true)
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &other_direction));
    assert!(!Arc::ptr_eq(&a, &static_call));
    assert_eq!(adapters.len(), 3);

    // Sub-word kinds share the int adapter.
    let narrow = AdapterSig::new([ParamKind::Byte, ParamKind::Reference]);
    let c = adapters
        .make(&narrow, AdapterDirection::BaselineToOptimized, false)
        .unwrap();
    assert!(Arc::ptr_eq(&a, &c));
}
