//! Shared in-tree reference services for workflow tests.

use crate::core::models::component::{
    Component, ProteinComponent, SmallMoleculeComponent, SolventComponent,
};
use crate::core::models::topology::{Topology, TopologyResidue};
use crate::core::validation::NonbondedMethod;
use crate::engine::config::{ForcefieldSettings, SolvationSettings, ThermoSettings};
use crate::engine::error::EngineError;
use crate::engine::platform::ReferencePlatform;
use crate::engine::restraint::BoreschGeometry;
use crate::engine::services::{
    ModellerService, NonbondedParameters, ParameterizedSystem, RestraintSearchService,
    StructuralModel, SystemGenerator, SystemGeneratorService,
};
use crate::workflows::unit::ExecutionContext;
use nalgebra::Vector3;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn test_box() -> [Vector3<f64>; 3] {
    [
        Vector3::new(30.0, 0.0, 0.0),
        Vector3::new(0.0, 30.0, 0.0),
        Vector3::new(0.0, 0.0, 30.0),
    ]
}

pub struct TestGenerator {
    periodic: bool,
}

impl SystemGenerator for TestGenerator {
    fn create_system(
        &self,
        topology: &Topology,
        _small_molecules: &[SmallMoleculeComponent],
    ) -> Result<ParameterizedSystem, EngineError> {
        Ok(ParameterizedSystem {
            atoms: vec![
                NonbondedParameters {
                    mass: 12.0,
                    charge: 0.1,
                    sigma: 3.4,
                    epsilon: 0.2,
                };
                topology.n_atoms()
            ],
            nonbonded_method: if self.periodic {
                NonbondedMethod::Pme
            } else {
                NonbondedMethod::NoCutoff
            },
            box_vectors: self.periodic.then(test_box),
        })
    }
}

/// Reference implementations of every collaborator service, producing a
/// small deterministic model.
pub struct TestServices;

impl SystemGeneratorService for TestServices {
    fn system_generator(
        &self,
        _forcefield: &ForcefieldSettings,
        _thermo: &ThermoSettings,
        _cache: Option<&Path>,
        has_solvent: bool,
    ) -> Result<Box<dyn SystemGenerator>, EngineError> {
        Ok(Box::new(TestGenerator {
            periodic: has_solvent,
        }))
    }
}

impl ModellerService for TestServices {
    fn build_model(
        &self,
        protein: Option<&ProteinComponent>,
        solvent: Option<&SolventComponent>,
        small_molecules: &[SmallMoleculeComponent],
        _settings: &SolvationSettings,
    ) -> Result<StructuralModel, EngineError> {
        let mut residues = Vec::new();
        let mut comp_resids = std::collections::HashMap::new();
        let mut next_atom = 0;
        let mut push_residues =
            |name: &str, count: usize, atoms_each: usize, residues: &mut Vec<TopologyResidue>| {
                let mut indices = Vec::new();
                for _ in 0..count {
                    indices.push(residues.len());
                    residues.push(TopologyResidue {
                        name: name.to_string(),
                        atom_indices: (next_atom..next_atom + atoms_each).collect(),
                    });
                    next_atom += atoms_each;
                }
                indices
            };

        if let Some(protein) = protein {
            let indices = push_residues("ALA", 3, 3, &mut residues);
            comp_resids.insert(Component::Protein(protein.clone()), indices);
        }
        for molecule in small_molecules {
            let indices = push_residues("LIG", 1, molecule.n_atoms, &mut residues);
            comp_resids.insert(Component::SmallMolecule(molecule.clone()), indices);
        }
        if let Some(solvent) = solvent {
            let indices = push_residues("HOH", 5, 3, &mut residues);
            comp_resids.insert(Component::Solvent(solvent.clone()), indices);
        }

        let topology = Topology::new(residues);
        let positions = (0..topology.n_atoms())
            .map(|i| {
                Vector3::new(
                    (i % 5) as f64 * 1.5,
                    (i / 5) as f64 * 1.5,
                    (i % 3) as f64 * 0.7,
                )
            })
            .collect();
        let box_vectors = solvent.is_some().then(test_box);
        Ok(StructuralModel {
            topology,
            positions,
            box_vectors,
            comp_resids,
        })
    }
}

impl RestraintSearchService for TestServices {
    fn find_boresch_geometry(
        &self,
        _topology: &Topology,
        positions: &[Vector3<f64>],
        guest_indices: &[usize],
    ) -> Result<BoreschGeometry, EngineError> {
        if guest_indices.len() < 3 {
            return Err(EngineError::Internal(
                "guest has fewer than three atoms".to_string(),
            ));
        }
        let host = [0usize, 1, 2];
        let guest = [guest_indices[0], guest_indices[1], guest_indices[2]];
        Ok(BoreschGeometry {
            host_atoms: host,
            guest_atoms: guest,
            r0: (positions[host[2]] - positions[guest[0]]).norm().max(1.0),
            theta_a0: PI / 2.0,
            theta_b0: PI / 2.0,
            phi_a0: 0.0,
            phi_b0: 0.0,
            phi_c0: 0.0,
        })
    }
}

pub fn execution_context<'a>(
    basepath: &'a Path,
    services: &'a TestServices,
) -> ExecutionContext<'a, ReferencePlatform> {
    ExecutionContext {
        shared_basepath: basepath,
        generator_service: services,
        modeller_service: services,
        restraint_service: services,
        platform: Arc::new(ReferencePlatform::new()),
        forcefield_cache: None,
    }
}

pub fn storage_files_under(path: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap().path();
            if entry.is_dir() {
                stack.push(entry);
            } else if entry.extension().is_some_and(|e| e == "nc") {
                found.push(entry);
            }
        }
    }
    found
}
