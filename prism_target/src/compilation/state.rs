//! Per-method compilation state.

use std::fmt;
use std::sync::Arc;

use super::Compilation;
use crate::error::CompileError;
use crate::method::CompiledMethod;

/// Compilation history and status of one method.
///
/// Versions are kept newest first.
#[derive(Debug, Clone, Default)]
pub enum TargetState {
    /// Never compiled.
    #[default]
    Uncompiled,
    /// One compiled version.
    Single(Arc<CompiledMethod>),
    /// Several compiled versions, newest first.
    Multiple(Arc<[Arc<CompiledMethod>]>),
    /// A compilation is in progress.
    Compiling(Arc<Compilation>),
    /// The last compilation failed.
    Failed {
        /// Failure reported to every waiter.
        cause: CompileError,
        /// State before the failed compilation.
        previous: Box<TargetState>,
    },
}

impl TargetState {
    /// History with `new` added as the newest version.
    ///
    /// In-progress and failed states contribute the history they were
    /// entered from.
    pub fn with_new(&self, new: Arc<CompiledMethod>) -> TargetState {
        match self {
            TargetState::Uncompiled => TargetState::Single(new),
            TargetState::Single(old) => TargetState::Multiple(Arc::from([new, Arc::clone(old)])),
            TargetState::Multiple(versions) => {
                let mut all = Vec::with_capacity(versions.len() + 1);
                all.push(new);
                all.extend(versions.iter().cloned());
                TargetState::Multiple(all.into())
            }
            TargetState::Compiling(compilation) => compilation.previous().with_new(new),
            TargetState::Failed { previous, .. } => previous.with_new(new),
        }
    }

    /// State with any in-progress or failed status removed.
    pub fn settled(&self) -> &TargetState {
        match self {
            TargetState::Compiling(compilation) => compilation.previous().settled(),
            TargetState::Failed { previous, .. } => previous.settled(),
            other => other,
        }
    }

    /// Newest compiled version.
    pub fn current(&self) -> Option<&Arc<CompiledMethod>> {
        match self.settled() {
            TargetState::Single(method) => Some(method),
            TargetState::Multiple(versions) => versions.first(),
            _ => None,
        }
    }

    /// All compiled versions, newest first.
    pub fn history(&self) -> Vec<Arc<CompiledMethod>> {
        match self.settled() {
            TargetState::Single(method) => vec![Arc::clone(method)],
            TargetState::Multiple(versions) => versions.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Whether a compilation is in progress.
    #[inline]
    pub fn is_compiling(&self) -> bool {
        matches!(self, TargetState::Compiling(_))
    }

    /// Whether the last compilation failed.
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, TargetState::Failed { .. })
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Uncompiled => f.write_str("uncompiled"),
            TargetState::Single(method) => write!(f, "{method}"),
            TargetState::Multiple(versions) => write!(f, "{} versions", versions.len()),
            TargetState::Compiling(compilation) => {
                write!(f, "compiling by {}", compilation.compiler())
            }
            TargetState::Failed { cause, .. } => write!(f, "failed: {cause}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{MethodFlavor, MethodId};

    fn version(name: &str) -> Arc<CompiledMethod> {
        Arc::new(CompiledMethod::new(name, MethodFlavor::Compiled))
    }

    fn names(state: &TargetState) -> Vec<String> {
        state.history().iter().map(|m| m.name().to_owned()).collect()
    }

    #[test]
    fn test_history_combination() {
        let one = TargetState::Uncompiled.with_new(version("a"));
        assert!(matches!(one, TargetState::Single(_)));
        let two = one.with_new(version("b"));
        assert_eq!(names(&two), ["b", "a"]);
        let three = two.with_new(version("c"));
        assert_eq!(names(&three), ["c", "b", "a"]);
        assert_eq!(three.current().map(|m| m.name()), Some("c"));
    }

    #[test]
    fn test_failed_state_keeps_previous_history() {
        let previous = TargetState::Uncompiled.with_new(version("a"));
        let failed = TargetState::Failed {
            cause: CompileError::Panicked {
                method: MethodId(1),
                compiler: "test",
            },
            previous: Box::new(previous),
        };
        assert!(failed.is_failed());
        assert_eq!(failed.current().map(|m| m.name()), Some("a"));
        assert_eq!(names(&failed.with_new(version("b"))), ["b", "a"]);
    }

    #[test]
    fn test_uncompiled_has_no_current() {
        assert!(TargetState::Uncompiled.current().is_none());
        assert!(TargetState::Uncompiled.history().is_empty());
        assert_eq!(TargetState::Uncompiled.to_string(), "uncompiled");
    }
}
