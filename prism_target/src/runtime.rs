//! Per-VM services.
//!
//! [`TargetRuntime`] wires the code region, stubs, adapter cache and
//! compilation broker together and serves as the [`CalleeResolver`] used when
//! linking.

use std::sync::Arc;

use tracing::info;

use crate::adapter::AdapterCache;
use crate::compilation::{CompilationBroker, Compiler};
use crate::config::TargetConfig;
use crate::error::{CompileError, TargetError};
use crate::link::CalleeResolver;
use crate::method::{CompiledMethod, MethodId};
use crate::region::CodeRegion;
use crate::stubs::{StubRoutines, Stubs};

/// Compiled-code services of one VM.
#[derive(Debug)]
pub struct TargetRuntime {
    config: TargetConfig,
    region: Arc<CodeRegion>,
    stubs: Stubs,
    adapters: AdapterCache,
    broker: CompilationBroker,
}

impl TargetRuntime {
    /// Map the code region and generate the stubs.
    pub fn new(config: TargetConfig, routines: StubRoutines) -> Result<Self, TargetError> {
        let region = CodeRegion::new(&config)?;
        let stubs = Stubs::generate(&region, &routines)?;
        let adapters = AdapterCache::new(Arc::clone(&region));
        let broker = CompilationBroker::new(Arc::clone(&region), &config);
        info!(
            isa = %config.isa,
            region_size = config.code_region_size,
            "target runtime initialized"
        );
        Ok(Self {
            config,
            region,
            stubs,
            adapters,
            broker,
        })
    }

    /// Configuration.
    #[inline]
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Code region.
    #[inline]
    pub fn region(&self) -> &Arc<CodeRegion> {
        &self.region
    }

    /// Shared stubs.
    #[inline]
    pub fn stubs(&self) -> &Stubs {
        &self.stubs
    }

    /// Adapter cache.
    #[inline]
    pub fn adapters(&self) -> &AdapterCache {
        &self.adapters
    }

    /// Compilation broker.
    #[inline]
    pub fn broker(&self) -> &CompilationBroker {
        &self.broker
    }

    /// Compile `method` with `compiler`; see [`CompilationBroker::compile`].
    pub fn compile(
        &self,
        method: MethodId,
        compiler: &dyn Compiler,
    ) -> Result<Arc<CompiledMethod>, CompileError> {
        self.broker.compile(method, compiler)
    }
}

impl CalleeResolver for TargetRuntime {
    fn current_target(&self, method: MethodId) -> Option<Arc<CompiledMethod>> {
        self.broker.current_target(method)
    }

    fn static_trampoline(&self) -> usize {
        self.stubs.static_trampoline().code_start()
    }
}
