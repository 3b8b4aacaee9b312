//! Contracts for the external collaborator services.
//!
//! Parameterization, solvation geometry construction, and restraint geometry
//! search are not part of this library; they are consumed through the traits
//! below. Implementations wrap whatever tooling the deployment uses.

use super::config::{ForcefieldSettings, SolvationSettings, ThermoSettings};
use super::error::EngineError;
use super::restraint::BoreschGeometry;
use crate::core::models::component::{
    Component, ProteinComponent, SmallMoleculeComponent, SolventComponent,
};
use crate::core::models::topology::Topology;
use crate::core::validation::NonbondedMethod;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Per-atom nonbonded parameters of a fully parameterized system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NonbondedParameters {
    pub mass: f64,
    pub charge: f64,
    pub sigma: f64,
    pub epsilon: f64,
}

/// A fully parameterized molecular system as emitted by the system
/// generator service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterizedSystem {
    pub atoms: Vec<NonbondedParameters>,
    pub nonbonded_method: NonbondedMethod,
    pub box_vectors: Option<[Vector3<f64>; 3]>,
}

impl ParameterizedSystem {
    pub fn n_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn uses_periodic_boundary_conditions(&self) -> bool {
        self.box_vectors.is_some()
    }
}

/// A built structural model plus the residue index set of each component.
#[derive(Debug, Clone)]
pub struct StructuralModel {
    pub topology: Topology,
    pub positions: Vec<Vector3<f64>>,
    pub box_vectors: Option<[Vector3<f64>; 3]>,
    /// Residue indices belonging to each component, in model order.
    pub comp_resids: HashMap<Component, Vec<usize>>,
}

/// Emits fully parameterized systems from a topology plus small-molecule
/// definitions.
pub trait SystemGenerator {
    fn create_system(
        &self,
        topology: &Topology,
        small_molecules: &[SmallMoleculeComponent],
    ) -> Result<ParameterizedSystem, EngineError>;
}

/// Produces a reusable [`SystemGenerator`] for a settings combination,
/// optionally backed by an on-disk template cache.
pub trait SystemGeneratorService: Send + Sync {
    fn system_generator(
        &self,
        forcefield: &ForcefieldSettings,
        thermo: &ThermoSettings,
        cache: Option<&Path>,
        has_solvent: bool,
    ) -> Result<Box<dyn SystemGenerator>, EngineError>;
}

/// Builds the solvated structural model for a set of components.
pub trait ModellerService: Send + Sync {
    fn build_model(
        &self,
        protein: Option<&ProteinComponent>,
        solvent: Option<&SolventComponent>,
        small_molecules: &[SmallMoleculeComponent],
        settings: &SolvationSettings,
    ) -> Result<StructuralModel, EngineError>;
}

/// Locates restraint geometry parameters from equilibrated coordinates.
pub trait RestraintSearchService: Send + Sync {
    fn find_boresch_geometry(
        &self,
        topology: &Topology,
        positions: &[Vector3<f64>],
        guest_indices: &[usize],
    ) -> Result<BoreschGeometry, EngineError>;
}
