//! Developer tooling: inspection of a running spatial system.
//!
//! # Invariants
//! - Inspection is read-only; nothing here mutates the system or
//!   disturbs cache statistics.

mod inspector;

pub use inspector::{CellBoxDump, DataInfo, GridLine, SpatialInspector, SpatialSummary};

pub fn crate_info() -> &'static str {
    "gridspace-tools v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("tools"));
    }
}
