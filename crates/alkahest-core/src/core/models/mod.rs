//! Data models for chemical end states.
//!
//! - [`component`] - Typed chemical components (protein, solvent, small molecules)
//! - [`system`] - The [`system::ChemicalSystem`] end-state description
//! - [`topology`] - Residue/atom layout of a built structural model

pub mod component;
pub mod system;
pub mod topology;
