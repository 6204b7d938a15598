//! Target configuration parameters.
//!
//! All sizes are tunable per VM instance. Defaults suit a long-running VM on
//! the host architecture.

use std::time::Duration;

use thiserror::Error;

use crate::arch::Isa;
use crate::region::PAGE_SIZE;

/// Configuration for the compiled-code layer.
///
/// # Example
///
/// ```ignore
/// use prism_target::{Isa, TargetConfig};
///
/// let config = TargetConfig {
///     isa: Isa::Aarch64,
///     code_region_size: 32 * 1024 * 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct TargetConfig {
    // =========================================================================
    // Code Generation
    // =========================================================================
    /// Instruction set that generated code, stubs and adapters target.
    ///
    /// Default: the host architecture
    pub isa: Isa,

    /// Capacity of the code region in bytes.
    ///
    /// All bundles are allocated from one region so that every call between
    /// compiled methods stays within reach of a direct call instruction.
    /// Must not exceed [`Isa::call_reach`].
    ///
    /// Default: 64MB
    pub code_region_size: usize,

    /// Map the code region executable.
    ///
    /// Disabled for tests and tooling that only inspect generated code.
    ///
    /// Default: true
    pub executable_code: bool,

    // =========================================================================
    // Compilation
    // =========================================================================
    /// Upper bound on how long a thread waits for another thread's
    /// compilation of the same method.
    ///
    /// `None` waits until the compile completes.
    ///
    /// Default: None
    pub compile_wait_timeout: Option<Duration>,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Log every compile start and finish at info level.
    ///
    /// Default: false
    pub verbose_compilation: bool,

    /// Dump the bundle of every compiled method at debug level once its
    /// compilation finishes.
    ///
    /// Default: false
    pub trace_bundles: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            isa: Isa::host(),
            code_region_size: 64 * 1024 * 1024, // 64MB
            executable_code: true,
            compile_wait_timeout: None,
            verbose_compilation: false,
            trace_bundles: false,
        }
    }
}

impl TargetConfig {
    /// Create a small, non-executable AMD64 configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            isa: Isa::Amd64,
            code_region_size: 1024 * 1024, // 1MB
            executable_code: false,
            compile_wait_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    /// Create a configuration with verbose compilation logging.
    pub fn verbose() -> Self {
        Self {
            verbose_compilation: true,
            trace_bundles: true,
            ..Default::default()
        }
    }

    /// Builder: set the target ISA.
    pub fn with_isa(mut self, isa: Isa) -> Self {
        self.isa = isa;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_region_size < PAGE_SIZE {
            return Err(ConfigError::RegionTooSmall(self.code_region_size));
        }
        if self.code_region_size as u64 > self.isa.call_reach() {
            return Err(ConfigError::RegionOutOfCallReach {
                size: self.code_region_size,
                isa: self.isa,
            });
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Code region is smaller than one page.
    #[error("code region of {0} bytes is smaller than one page")]
    RegionTooSmall(usize),
    /// Code region is larger than a direct call can span.
    #[error("code region of {size} bytes exceeds the direct call reach of {isa}")]
    RegionOutOfCallReach {
        /// Requested region size.
        size: usize,
        /// Target ISA.
        isa: Isa,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TargetConfig::default().validate().is_ok());
        assert!(TargetConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_region_too_small() {
        let config = TargetConfig {
            code_region_size: 128,
            ..TargetConfig::for_testing()
        };
        assert_eq!(config.validate(), Err(ConfigError::RegionTooSmall(128)));
    }

    #[test]
    fn test_region_beyond_aarch64_reach() {
        let config = TargetConfig {
            code_region_size: 256 * 1024 * 1024,
            ..TargetConfig::for_testing().with_isa(Isa::Aarch64)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RegionOutOfCallReach { .. })
        ));
        assert!(config.with_isa(Isa::Amd64).validate().is_ok());
    }
}
