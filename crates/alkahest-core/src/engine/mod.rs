//! # Engine Module
//!
//! The stateful logic core: everything between a validated pair of end
//! states and the raw outputs of one execution unit.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Per-stage settings structs and their
//!   pure validation functions
//! - **Lambda schedules** ([`lambda`]) - Construction and validation of the
//!   interpolation state sequence
//! - **Alchemical systems** ([`alchemy`], [`restraint`]) - Interpolatable
//!   system construction, atom-index resolution, Boresch restraints and
//!   their standard-state correction
//! - **State ensembles** ([`states`]) - Thermodynamic/sampler state pairs,
//!   index-aligned with the schedule
//! - **Compute abstraction** ([`platform`], [`cache`]) - The collaborating
//!   physics engine behind a platform trait, per-unit context caches, and
//!   the process-wide shared pool with its reset contract
//! - **Sampling** ([`sampler`]) - The multi-state sampler state machine
//!   with replica-exchange, SAMS, and independent strategies
//! - **Persistence** ([`reporter`]) - Multi-state storage and checkpoints
//! - **Statistics** ([`analysis`]) - Free-energy estimators, overlap
//!   matrices, convergence and mixing diagnostics
//! - **Services** ([`services`]) - Contracts for the external
//!   parameterization, solvation, and restraint-search collaborators
//! - **Error Handling** ([`error`]) - Engine-specific error types

pub mod alchemy;
pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod lambda;
pub mod platform;
pub mod reporter;
pub mod restraint;
pub mod sampler;
pub mod services;
pub mod states;
