//! Builtin flow implementations.
//!
//! Real EDA tool wrappers (synthesizers, simulators, place-and-route
//! drivers) are external collaborators and not part of this crate; these
//! modules are the minimal flows needed to exercise the runner and DSE
//! engine end-to-end — a no-op success, a deliberately slow flow for the
//! timeout contract, a two-stage dependency chain, and a synthetic
//! synthesis flow with a closed-form Fmax used by the optimizer's tests.

pub mod echo;
pub mod openroad;
pub mod sleepy;
pub mod synthetic_synth;
pub mod yosys_synth;
