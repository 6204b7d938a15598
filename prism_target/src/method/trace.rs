//! Human-readable dumps of a compiled method's tables.

use std::fmt::Write;

use super::CompiledMethod;
use crate::stops::StopKind;

impl CompiledMethod {
    /// Multi-line dump of the bundle: layout, stops, catch table, callees
    /// and literals.
    pub fn trace_bundle(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {self} [{:#x}, {:#x})",
            self.flavor,
            self.code_start(),
            self.code_end()
        );
        if let Some(layout) = self.bundle_layout() {
            let _ = write!(out, "{layout}");
        }

        let stops = self.stops();
        if !stops.is_empty() {
            let _ = writeln!(out, "stops:");
            for (index, (kind, position, native)) in stops.iter().enumerate() {
                let native = if native { " native" } else { "" };
                let _ = write!(out, "  {index}: {kind} @ {position:#x}{native}");
                if kind == StopKind::DirectCall {
                    let _ = write!(out, " -> {}", self.direct_callees()[index]);
                }
                out.push('\n');
            }
        }

        let catch = self.catch_table();
        if !catch.is_empty() {
            let _ = write!(out, "catch ranges:\n{catch}");
        }

        let scalars = self.scalar_literals();
        if !scalars.is_empty() {
            let _ = writeln!(out, "scalar literals: {} bytes", scalars.len());
        }
        for (index, literal) in self.reference_literals().iter().enumerate() {
            let _ = writeln!(out, "  reference literal {index}: {:#018x}", literal.0);
        }
        out
    }

    /// One line per stop: its frame map and, for safepoints, register map.
    pub fn reference_maps_to_string(&self) -> String {
        let stops = self.stops();
        let layout = self.reference_map_layout();
        let mut out = String::new();
        if layout.size() == 0 {
            return out;
        }
        for (index, (kind, position, _)) in stops.iter().enumerate() {
            let _ = write!(
                out,
                "{kind} @ {position:#x}: frame {}",
                self.frame_reference_map(index)
            );
            if kind == StopKind::Safepoint {
                let safepoint = index - stops.calls();
                let _ = write!(out, " registers {}", self.register_reference_map(safepoint));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::TargetConfig;
    use crate::method::{DirectCallee, GeneratedCode, MethodFlavor, MethodId};
    use crate::region::CodeRegion;

    use super::*;

    #[test]
    fn test_reference_maps_to_string() {
        let region: Arc<CodeRegion> = CodeRegion::new(&TargetConfig::for_testing()).unwrap();
        let mut code = vec![0x90; 16];
        code[2] = 0xE8;
        let method = CompiledMethod::new("maps", MethodFlavor::Compiled);
        let generated = GeneratedCode::new(code)
            .with_direct_call(2, false, DirectCallee::Method(MethodId(4)))
            .with_safepoint(10)
            .with_reference_maps(1, 1, vec![0b0000_0101, 0b1000_0000, 0b0000_0010]);
        method.set_generated(&region, generated).unwrap();

        assert_eq!(
            method.reference_maps_to_string(),
            "direct call @ 0x2: frame 10100000\n\
             safepoint @ 0xa: frame 00000001 registers 01000000\n"
        );
        let dump = method.trace_bundle();
        assert!(dump.contains("0: direct call @ 0x2 -> method#4"));
        assert!(dump.contains("1: safepoint @ 0xa"));
    }

    #[test]
    fn test_trace_empty_method() {
        let method = CompiledMethod::new("empty", MethodFlavor::Stub);
        assert!(method.reference_maps_to_string().is_empty());
        assert!(method.trace_bundle().starts_with("stub empty"));
    }
}
