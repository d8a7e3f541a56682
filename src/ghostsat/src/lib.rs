//! ghostsat: a complete solver for quantified boolean formulas given as
//! non-CNF circuits with an arbitrary prenex quantifier prefix.
//!
//! The engine works on a ghosted copy of the circuit: every gate owns one
//! shadow variable per player, and a database of game-state sequents
//! (Lnow, Lfut, F) drives watched-literal propagation, conflict analysis by
//! Q-resolution, and CEGAR-style gate synthesis. When free variables are
//! enabled, the answer is a winning strategy as a formula over them.

pub mod analyze;
pub mod cegar;
pub mod circuit;
pub mod error;
pub mod fmla;
pub mod fmla_io;
pub mod heap;
pub mod lit;
pub mod output;
pub mod parse;
pub mod prefix;
pub mod sat;
pub mod sequent;
pub mod solver;
pub mod trail;

pub use crate::analyze::Strategy;
pub use crate::circuit::{BuildOpts, Circuit};
pub use crate::error::{FmlaError, Result, SolverError};
pub use crate::fmla::{FmlaOp, FmlaRef, Fmlas};
pub use crate::lit::{Lit, Ply, Var};
pub use crate::parse::{parse_circuit, parse_ghostq, parse_qcir, ParsedCircuit};
pub use crate::prefix::QType;
pub use crate::sequent::SeqId;
pub use crate::solver::{Outcome, Solver, SolverOpts, Stats};
