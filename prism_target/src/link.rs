//! Call linking.
//!
//! A freshly generated method has placeholder targets in all of its direct
//! call sites. Linking points each site at the current compiled version of
//! its callee, or at the static trampoline when the callee has not been
//! compiled yet. The trampoline resolves the callee on first call; a later
//! relink replaces trampoline-bound sites with the real entry.
//!
//! Before a method is published its call sites are fixed up with plain
//! stores. After publication a site may be executing on another thread, so
//! only atomically patchable sites can be rewritten and a site that is not
//! patchable is fatal.

use std::sync::Arc;

use tracing::debug;

use crate::error::fatal;
use crate::method::{CompiledMethod, DirectCallee, MethodId};

// =============================================================================
// Callee Resolution
// =============================================================================

/// Source of call targets consulted while linking.
pub trait CalleeResolver {
    /// Current compiled version of `method`, if any.
    fn current_target(&self, method: MethodId) -> Option<Arc<CompiledMethod>>;

    /// Baseline entry address of the static trampoline.
    fn static_trampoline(&self) -> usize;
}

// =============================================================================
// Linking
// =============================================================================

/// Link every direct call of `method`.
///
/// When `adapter` is given and `method` is not yet published, the prologue
/// call into the adapter is fixed up first. Returns whether every callee was
/// resolved to compiled code; the same flag is recorded on the method.
pub fn link_direct_calls(
    method: &CompiledMethod,
    adapter: Option<&CompiledMethod>,
    resolver: &dyn CalleeResolver,
) -> bool {
    if let Some(adapter) = adapter {
        link_adapter_call(method, adapter);
    }

    let stops = method.stops();
    let mut fully_linked = true;
    for (index, callee) in method.direct_callees().iter().enumerate() {
        let position = stops.position(index);
        let target = match callee {
            DirectCallee::Target(target) => Some(Arc::clone(target)),
            DirectCallee::Method(id) => resolver.current_target(*id),
        };
        let address = match target {
            Some(target) => target.code_start() + method.call_entry_offset(&target),
            None => {
                fully_linked = false;
                if method.patchable_call_site(position).is_none() {
                    fatal!(
                        "call to unresolved {callee} at {position:#x} in {method} is not patchable"
                    );
                }
                resolver.static_trampoline() + method.call_entry_point().offset()
            }
        };
        if method.call_target_at(position) == Some(address) {
            continue;
        }
        link_call_site(method, position, address);
        debug!(
            method = %method,
            position = format_args!("{position:#x}"),
            callee = %callee,
            target = format_args!("{address:#x}"),
            "linked direct call"
        );
    }
    method.set_fully_linked(fully_linked);
    fully_linked
}

fn link_adapter_call(method: &CompiledMethod, adapter: &CompiledMethod) {
    if method.is_published() {
        return;
    }
    let Some(position) = method.adapter_call_position() else {
        fatal!("{method} has no adapter call to link to {adapter}");
    };
    method.fixup_call_site(position, adapter.code_start());
    debug!(method = %method, adapter = %adapter, "linked adapter call");
}

fn link_call_site(method: &CompiledMethod, position: u32, address: usize) {
    if !method.is_published() {
        method.fixup_call_site(position, address);
        return;
    }
    match method.patchable_call_site(position) {
        Some(site) => method.patch_call_site(site, address),
        None => fatal!("call site {position:#x} in published {method} is not patchable"),
    }
}
