//! SSA construction and phi cleanup.

pub mod cleanup;
mod convert;

pub use cleanup::{DeadPhiElimination, GraphPass, RedundantPhiElimination};
pub use convert::convert;

use crate::graph::Graph;

/// Run the standard phi cleanup: redundant phis first so that dead phi
/// removal sees the substituted uses, each pass to a fixpoint.
pub fn run_cleanup(graph: &mut Graph) {
    let mut passes: [Box<dyn GraphPass>; 2] = [
        Box::new(RedundantPhiElimination),
        Box::new(DeadPhiElimination),
    ];
    for pass in passes.iter_mut() {
        while pass.run(graph) {}
    }
}
