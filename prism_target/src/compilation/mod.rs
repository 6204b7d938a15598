//! Compilation tracking.
//!
//! The [`CompilationBroker`] owns the [`TargetState`] of every method and
//! serializes compilations per method:
//!
//! ```text
//! Uncompiled ──compile──> Compiling ──ok──> Single ──compile──> ... Multiple
//!                             │
//!                             └──err──> Failed (previous history kept)
//! ```
//!
//! A thread that requests a method another thread is compiling blocks on the
//! method's condition variable and receives the same outcome, success or
//! failure, as the compiling thread. A thread that requests a method it is
//! itself compiling further up its stack halts the VM: that can only happen
//! when the compiler's bootstrap closure is incomplete.

mod record;
mod state;

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

pub use record::{Compilation, CompileOutcome};
pub use state::TargetState;

use crate::config::TargetConfig;
use crate::error::{CompileError, fatal};
use crate::method::{CompiledMethod, MethodId};
use crate::region::CodeRegion;

// =============================================================================
// Compiler Interface
// =============================================================================

/// A code generator driven by the broker.
pub trait Compiler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Compile `request.method()` and install the result with
    /// [`CompiledMethod::set_generated`] into `request.region()`.
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Arc<CompiledMethod>, CompileError>;
}

/// A compilation handed to a [`Compiler`].
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    method: MethodId,
    broker: &'a CompilationBroker,
}

impl<'a> CompileRequest<'a> {
    /// Method to compile.
    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Region to allocate the code in.
    #[inline]
    pub fn region(&self) -> &'a Arc<CodeRegion> {
        &self.broker.region
    }

    /// Broker running the compilation, for compiling callees.
    #[inline]
    pub fn broker(&self) -> &'a CompilationBroker {
        self.broker
    }
}

// =============================================================================
// Broker
// =============================================================================

#[derive(Debug, Default)]
struct MethodState {
    state: Mutex<TargetState>,
    done: Condvar,
}

/// A compilation running on this thread: broker address, method, compiler.
type InFlightEntry = (usize, MethodId, &'static str);

thread_local! {
    /// Compilations running on this thread, innermost last.
    static IN_FLIGHT: RefCell<SmallVec<[InFlightEntry; 4]>> = RefCell::new(SmallVec::new());
}

/// Tracks and serializes compilations of every method.
pub struct CompilationBroker {
    region: Arc<CodeRegion>,
    states: DashMap<MethodId, Arc<MethodState>, FxBuildHasher>,
    wait_timeout: Option<Duration>,
    verbose: bool,
    trace_bundles: bool,
}

impl CompilationBroker {
    /// Create a broker compiling into `region`.
    pub fn new(region: Arc<CodeRegion>, config: &TargetConfig) -> Self {
        Self {
            region,
            states: DashMap::with_hasher(FxBuildHasher),
            wait_timeout: config.compile_wait_timeout,
            verbose: config.verbose_compilation,
            trace_bundles: config.trace_bundles,
        }
    }

    /// Region compilers allocate into.
    #[inline]
    pub fn region(&self) -> &Arc<CodeRegion> {
        &self.region
    }

    /// Compile `method`, or wait for the compilation already in progress.
    ///
    /// Waiting is bounded by [`TargetConfig::compile_wait_timeout`].
    pub fn compile(
        &self,
        method: MethodId,
        compiler: &dyn Compiler,
    ) -> Result<Arc<CompiledMethod>, CompileError> {
        self.compile_inner(method, compiler, self.wait_timeout)
    }

    /// [`CompilationBroker::compile`] waiting at most `timeout` for another
    /// thread's compilation.
    pub fn compile_timeout(
        &self,
        method: MethodId,
        compiler: &dyn Compiler,
        timeout: Duration,
    ) -> Result<Arc<CompiledMethod>, CompileError> {
        self.compile_inner(method, compiler, Some(timeout))
    }

    /// Newest compiled version of `method`.
    pub fn current_target(&self, method: MethodId) -> Option<Arc<CompiledMethod>> {
        let state = self.states.get(&method)?.value().clone();
        let guard = state.state.lock();
        guard.current().cloned()
    }

    /// Snapshot of the state of `method`.
    pub fn target_state(&self, method: MethodId) -> TargetState {
        match self.states.get(&method) {
            Some(entry) => entry.value().state.lock().clone(),
            None => TargetState::Uncompiled,
        }
    }

    /// All compiled versions of `method`, newest first.
    pub fn history(&self, method: MethodId) -> Vec<Arc<CompiledMethod>> {
        self.target_state(method).history()
    }

    /// Whether `method` is being compiled.
    pub fn is_compiling(&self, method: MethodId) -> bool {
        self.target_state(method).is_compiling()
    }

    /// Identity of this broker for the in-flight stack. The address is stable
    /// while any of its compilations runs, since they all borrow `self`.
    #[inline]
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn state_of(&self, method: MethodId) -> Arc<MethodState> {
        Arc::clone(self.states.entry(method).or_default().value())
    }

    fn compile_inner(
        &self,
        method: MethodId,
        compiler: &dyn Compiler,
        timeout: Option<Duration>,
    ) -> Result<Arc<CompiledMethod>, CompileError> {
        let name = compiler.name();
        check_recursion(self.id(), method, name);

        let state = self.state_of(method);
        let mut guard = state.state.lock();
        if let TargetState::Compiling(compilation) = &*guard {
            let compilation = Arc::clone(compilation);
            debug!(
                %method,
                compiler = compilation.compiler(),
                "waiting for compilation on another thread"
            );
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                if let Some(outcome) = compilation.outcome() {
                    return outcome.clone();
                }
                match deadline {
                    Some(deadline) => {
                        if state.done.wait_until(&mut guard, deadline).timed_out()
                            && compilation.outcome().is_none()
                        {
                            return Err(CompileError::Timeout {
                                method,
                                waited: timeout.unwrap_or_default(),
                            });
                        }
                    }
                    None => state.done.wait(&mut guard),
                }
            }
        }

        let compilation = Arc::new(Compilation::new(method, name, guard.settled().clone()));
        *guard = TargetState::Compiling(Arc::clone(&compilation));
        drop(guard);

        let in_flight = InFlight::enter(self.id(), &state, &compilation);
        if self.verbose {
            info!(%method, compiler = name, "compiling");
        } else {
            debug!(%method, compiler = name, "compiling");
        }
        let outcome = compiler.compile(&CompileRequest { method, broker: self });
        self.report(&compilation, &outcome);
        in_flight.complete(outcome.clone());
        outcome
    }

    fn report(&self, compilation: &Compilation, outcome: &CompileOutcome) {
        let method = compilation.method();
        let compiler = compilation.compiler();
        let elapsed = compilation.elapsed();
        match outcome {
            Ok(target) => {
                if self.verbose {
                    info!(%method, compiler, code_len = target.code_len(), ?elapsed, "compiled");
                } else {
                    debug!(%method, compiler, code_len = target.code_len(), ?elapsed, "compiled");
                }
                if self.trace_bundles {
                    debug!("{}", target.trace_bundle());
                }
            }
            Err(err) => warn!(%method, compiler, ?elapsed, error = %err, "compilation failed"),
        }
    }
}

impl std::fmt::Debug for CompilationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationBroker")
            .field("methods", &self.states.len())
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

fn check_recursion(broker: usize, method: MethodId, compiler: &'static str) {
    IN_FLIGHT.with(|in_flight| {
        let in_flight = in_flight.borrow();
        if in_flight.contains(&(broker, method, compiler)) {
            fatal!("recursive compilation of {method} by {compiler}");
        }
        let mut same_broker = in_flight.iter().filter(|(b, _, _)| *b == broker);
        if let Some((_, _, outer)) = same_broker.find(|(_, m, _)| *m == method) {
            fatal!("{method} requested from {compiler} while {outer} compiles it on this thread");
        }
    });
}

// =============================================================================
// In-Flight Guard
// =============================================================================

/// Registers a compilation on the current thread and publishes its outcome.
///
/// Dropped without an outcome (the compiler panicked), it records
/// [`CompileError::Panicked`] so waiters do not block forever.
struct InFlight<'a> {
    state: &'a MethodState,
    compilation: &'a Arc<Compilation>,
}

impl<'a> InFlight<'a> {
    fn enter(broker: usize, state: &'a MethodState, compilation: &'a Arc<Compilation>) -> Self {
        IN_FLIGHT.with(|in_flight| {
            in_flight
                .borrow_mut()
                .push((broker, compilation.method(), compilation.compiler()))
        });
        Self { state, compilation }
    }

    fn complete(self, outcome: CompileOutcome) {
        self.publish(outcome);
    }

    fn publish(&self, outcome: CompileOutcome) {
        let mut guard = self.state.state.lock();
        let previous = self.compilation.previous();
        *guard = match &outcome {
            Ok(target) => previous.with_new(Arc::clone(target)),
            Err(cause) => TargetState::Failed {
                cause: cause.clone(),
                previous: Box::new(previous.clone()),
            },
        };
        self.compilation.finish(outcome);
        self.state.done.notify_all();
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        IN_FLIGHT.with(|in_flight| {
            in_flight.borrow_mut().pop();
        });
        if self.compilation.outcome().is_none() {
            let method = self.compilation.method();
            let compiler = self.compilation.compiler();
            warn!(%method, compiler, "compiler panicked");
            self.publish(Err(CompileError::Panicked { method, compiler }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::method::{GeneratedCode, MethodFlavor};

    fn broker() -> CompilationBroker {
        let config = TargetConfig::for_testing();
        CompilationBroker::new(CodeRegion::new(&config).unwrap(), &config)
    }

    struct Counting {
        runs: AtomicUsize,
    }

    impl Compiler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn compile(
            &self,
            request: &CompileRequest<'_>,
        ) -> Result<Arc<CompiledMethod>, CompileError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            let method = CompiledMethod::new(format!("v{run}"), MethodFlavor::Compiled)
                .with_method(request.method());
            method.set_generated(request.region(), GeneratedCode::new(vec![0xC3]))?;
            Ok(Arc::new(method))
        }
    }

    struct Failing;

    impl Compiler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn compile(
            &self,
            request: &CompileRequest<'_>,
        ) -> Result<Arc<CompiledMethod>, CompileError> {
            Err(CompileError::Failed {
                method: request.method(),
                compiler: self.name(),
                reason: "unsupported bytecode".into(),
            })
        }
    }

    struct Recursive;

    impl Compiler for Recursive {
        fn name(&self) -> &'static str {
            "recursive"
        }

        fn compile(
            &self,
            request: &CompileRequest<'_>,
        ) -> Result<Arc<CompiledMethod>, CompileError> {
            request.broker().compile(request.method(), self)
        }
    }

    /// Compiles the same method in another broker before installing its own.
    struct Delegating<'b> {
        other: &'b CompilationBroker,
        inner: Counting,
    }

    impl Compiler for Delegating<'_> {
        fn name(&self) -> &'static str {
            "delegating"
        }

        fn compile(
            &self,
            request: &CompileRequest<'_>,
        ) -> Result<Arc<CompiledMethod>, CompileError> {
            self.other.compile(request.method(), &self.inner)?;
            self.inner.compile(request)
        }
    }

    struct Panicking;

    impl Compiler for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn compile(&self, _: &CompileRequest<'_>) -> Result<Arc<CompiledMethod>, CompileError> {
            panic!("code generator bug");
        }
    }

    #[test]
    fn test_compile_builds_history() {
        let broker = broker();
        let compiler = Counting {
            runs: AtomicUsize::new(0),
        };
        let method = MethodId(1);
        assert!(broker.current_target(method).is_none());
        for _ in 0..3 {
            broker.compile(method, &compiler).unwrap();
        }
        let names: Vec<_> = broker
            .history(method)
            .iter()
            .map(|m| m.name().to_owned())
            .collect();
        assert_eq!(names, ["v2", "v1", "v0"]);
        assert_eq!(broker.current_target(method).unwrap().name(), "v2");
    }

    #[test]
    fn test_failure_keeps_history_and_is_reported() {
        let broker = broker();
        let method = MethodId(2);
        let counting = Counting {
            runs: AtomicUsize::new(0),
        };
        broker.compile(method, &counting).unwrap();

        let err = broker.compile(method, &Failing).unwrap_err();
        assert!(matches!(err, CompileError::Failed { .. }));
        assert!(broker.target_state(method).is_failed());
        assert_eq!(broker.current_target(method).unwrap().name(), "v0");

        broker.compile(method, &counting).unwrap();
        assert_eq!(broker.history(method).len(), 2);
    }

    #[test]
    #[should_panic(expected = "recursive compilation of method#3 by recursive")]
    fn test_recursive_compile_is_fatal() {
        let broker = broker();
        let _ = broker.compile(MethodId(3), &Recursive);
    }

    #[test]
    fn test_isolated_brokers_compile_same_method_on_one_thread() {
        let outer = broker();
        let isolated = broker();
        let method = MethodId(3);
        let compiler = Delegating {
            other: &isolated,
            inner: Counting {
                runs: AtomicUsize::new(0),
            },
        };
        let target = outer.compile(method, &compiler).unwrap();
        assert_eq!(target.name(), "v1");
        assert_eq!(isolated.current_target(method).unwrap().name(), "v0");
        assert!(!isolated.is_compiling(method));
    }

    #[test]
    fn test_panicking_compiler_records_failure() {
        let broker = Arc::new(broker());
        let method = MethodId(4);
        let worker = {
            let broker = Arc::clone(&broker);
            std::thread::spawn(move || {
                let _ = broker.compile(method, &Panicking);
            })
        };
        assert!(worker.join().is_err());
        assert!(matches!(
            broker.target_state(method),
            TargetState::Failed {
                cause: CompileError::Panicked { .. },
                ..
            }
        ));
        assert!(!broker.is_compiling(method));
    }
}
