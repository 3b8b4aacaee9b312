//! End-state and solvent compatibility validation.
//!
//! Pure functions over [`ChemicalSystem`] pairs. Everything here runs before
//! any simulation resource is allocated; a failure creates no units.

use super::models::component::{Component, ComponentKind, SolventComponent};
use super::models::system::ChemicalSystem;
use crate::core::models::component::{ProteinComponent, SmallMoleculeComponent};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("No protein component found in state A")]
    MissingProteinComponent,

    #[error("No solvent component found in state A")]
    MissingSolventComponent,

    #[error(
        "More than one unique component found in state A ({count}), only one \
         alchemical species is supported"
    )]
    MultipleAlchemicalComponents { count: usize },

    #[error("Only disappearing small molecule components are supported, found a {kind} component")]
    UnsupportedAlchemicalComponent { kind: ComponentKind },

    #[error("No alchemical components found: state A and state B are identical")]
    NoAlchemicalComponents,

    #[error("Components appearing in state B are not supported ({count} found)")]
    UniqueComponentsInStateB { count: usize },

    #[error("State B must contain exactly one solvent component and nothing else")]
    StateBNotPureSolvent,

    #[error("Protein components are not allowed for absolute solvation free energies")]
    ProteinInSolvationState,

    #[error(
        "Nonbonded method {method} cannot be used with a solvent component; \
         explicit solvent requires a periodic method"
    )]
    SolventRequiresPeriodicMethod { method: NonbondedMethod },

    #[error("Nonbonded method {method} requires a solvent component, none was found")]
    PeriodicMethodRequiresSolvent { method: NonbondedMethod },
}

/// How long-range nonbonded interactions are treated by the physics engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NonbondedMethod {
    /// Particle-mesh Ewald, periodic.
    Pme,
    /// All pairs, no cutoff, non-periodic. Used for vacuum legs.
    NoCutoff,
}

impl NonbondedMethod {
    pub fn is_periodic(&self) -> bool {
        matches!(self, NonbondedMethod::Pme)
    }
}

impl std::fmt::Display for NonbondedMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NonbondedMethod::Pme => "PME",
            NonbondedMethod::NoCutoff => "NoCutoff",
        };
        f.write_str(s)
    }
}

/// The components that differ between the two end states.
#[derive(Debug, Clone, PartialEq)]
pub struct AlchemicalComponents {
    /// Components disappearing from state A.
    pub state_a: Vec<Component>,
    /// Components appearing in state B.
    pub state_b: Vec<Component>,
}

/// Computes the per-side unique components of an end-state pair.
pub fn get_alchemical_components(
    state_a: &ChemicalSystem,
    state_b: &ChemicalSystem,
) -> AlchemicalComponents {
    let (only_a, only_b) = state_a.component_diff(state_b);
    AlchemicalComponents {
        state_a: only_a.into_iter().cloned().collect(),
        state_b: only_b.into_iter().cloned().collect(),
    }
}

/// Splits a chemical system into its typed constituents.
pub fn get_components(
    state: &ChemicalSystem,
) -> (
    Option<&SolventComponent>,
    Option<&ProteinComponent>,
    Vec<&SmallMoleculeComponent>,
) {
    (state.solvent(), state.protein(), state.small_molecules())
}

/// Checks that the declared solvent component is compatible with the
/// configured nonbonded method.
pub fn validate_solvent(
    state: &ChemicalSystem,
    nonbonded_method: NonbondedMethod,
) -> Result<(), ValidationError> {
    match (state.solvent(), nonbonded_method.is_periodic()) {
        (Some(_), false) => Err(ValidationError::SolventRequiresPeriodicMethod {
            method: nonbonded_method,
        }),
        (None, true) => Err(ValidationError::PeriodicMethodRequiresSolvent {
            method: nonbonded_method,
        }),
        _ => Ok(()),
    }
}

/// Checks that the alchemical component set describes a single disappearing
/// small molecule.
pub fn validate_alchemical_components(
    alchemical: &AlchemicalComponents,
) -> Result<(), ValidationError> {
    if !alchemical.state_b.is_empty() {
        return Err(ValidationError::UniqueComponentsInStateB {
            count: alchemical.state_b.len(),
        });
    }
    if alchemical.state_a.is_empty() {
        return Err(ValidationError::NoAlchemicalComponents);
    }
    if alchemical.state_a.len() > 1 {
        return Err(ValidationError::MultipleAlchemicalComponents {
            count: alchemical.state_a.len(),
        });
    }
    match &alchemical.state_a[0] {
        Component::SmallMolecule(_) => Ok(()),
        other => Err(ValidationError::UnsupportedAlchemicalComponent {
            kind: other.kind(),
        }),
    }
}
