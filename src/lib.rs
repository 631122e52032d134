//! **knitshape** — stitch-count sampling solvers for knit garment shaping.
//!
//! Three sibling solvers share one architecture (objective + analytic
//! gradient + constraints → nonlinear optimizer):
//!
//! 1. **Global** (`global`): one variable per edge of the course flow
//!    graph, with interface-conservation constraints and an optional
//!    variable-aliasing reduction (`reduction`).
//! 2. **Local** (`local`): one variable per position of a boundary-
//!    pinned course interval, with per-step shaping-ratio constraints.
//! 3. **Short-row** (`shortrow`): one variable per wale sample, with
//!    L1/L2 simplicity between neighbors.
//!
//! Supporting modules: the optimization driver (`optimizer`, argmin
//! L-BFGS + augmented-Lagrangian outer loop), the finite-difference
//! gradient checker (`gradcheck`), and the C ABI (`ffi`).

pub mod types;
pub mod reduction;
pub mod optimizer;
pub mod gradcheck;
pub mod global;
pub mod local;
pub mod shortrow;
pub mod ffi;
