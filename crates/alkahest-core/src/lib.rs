//! # Alkahest Core Library
//!
//! A library for orchestrating alchemical absolute binding and solvation
//! free-energy calculations: end-state validation, lambda schedule
//! construction, alchemical system assembly, multi-state sampling, and the
//! statistical aggregation of multi-repeat thermodynamic cycles.
//!
//! ## Architectural Philosophy
//!
//! The library is designed with a strict three-layer architecture to ensure
//! a clear separation of concerns:
//!
//! - **[`core`]: The Foundation.** Stateless data models (`ChemicalSystem`,
//!   components, physical quantities) and the pure validation functions
//!   gating protocol creation.
//!
//! - **[`engine`]: The Logic Core.** This stateful layer owns the
//!   simulation lifecycle: lambda schedules, alchemical system
//!   construction, compute context caches, the multi-state sampler state
//!   machine, storage, and the statistical estimators.
//!
//! - **[`workflows`]: The Public API.** The highest-level, user-facing
//!   layer: the absolute binding and solvation protocols, the per-leg unit
//!   pipeline, and the result aggregation that turns raw unit outputs into
//!   a free energy with uncertainty.
//!
//! The physics engine itself (integration, full energy evaluation),
//! force-field parameterization, solvation geometry construction, and
//! restraint geometry search are external collaborators consumed through
//! the trait contracts in [`engine::services`] and [`engine::platform`].

pub mod core;
pub mod engine;
pub mod workflows;
