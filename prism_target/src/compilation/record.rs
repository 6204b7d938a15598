//! In-flight compilation records.

use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::TargetState;
use crate::error::CompileError;
use crate::method::{CompiledMethod, MethodId};

/// Outcome of a compilation, shared with every waiter.
pub type CompileOutcome = Result<Arc<CompiledMethod>, CompileError>;

/// One compilation of one method.
#[derive(Debug)]
pub struct Compilation {
    method: MethodId,
    compiler: &'static str,
    thread: ThreadId,
    started: Instant,
    previous: TargetState,
    outcome: OnceLock<CompileOutcome>,
}

impl Compilation {
    /// Start a compilation on the current thread.
    pub(crate) fn new(method: MethodId, compiler: &'static str, previous: TargetState) -> Self {
        Self {
            method,
            compiler,
            thread: thread::current().id(),
            started: Instant::now(),
            previous,
            outcome: OnceLock::new(),
        }
    }

    /// Method being compiled.
    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Name of the compiler.
    #[inline]
    pub fn compiler(&self) -> &'static str {
        self.compiler
    }

    /// Thread running the compilation.
    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Time since the compilation started.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// State the method was in when the compilation started.
    #[inline]
    pub fn previous(&self) -> &TargetState {
        &self.previous
    }

    /// Outcome, once finished.
    #[inline]
    pub fn outcome(&self) -> Option<&CompileOutcome> {
        self.outcome.get()
    }

    /// Record the outcome. Returns `false` if one was already recorded.
    pub(crate) fn finish(&self, outcome: CompileOutcome) -> bool {
        self.outcome.set(outcome).is_ok()
    }
}
