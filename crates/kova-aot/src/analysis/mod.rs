//! Graph analyses: dominance, natural loops, and liveness.

pub mod dominance;
pub mod liveness;
pub mod loops;

pub use dominance::{reverse_postorder, DominatorTree};
pub use liveness::{Liveness, LiveInterval};
pub use loops::{find_natural_loops, NaturalLoop};
