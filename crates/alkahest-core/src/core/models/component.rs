//! Chemical components making up an end state.
//!
//! A component is an immutable description of one constituent of a
//! [`ChemicalSystem`](super::system::ChemicalSystem): the protein, the bulk
//! solvent, or an individual small molecule. Component identity is the pair
//! (kind, name), which is what the end-state difference logic compares.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProteinComponent {
    pub name: String,
}

impl ProteinComponent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SolventComponent {
    pub name: String,
    /// Net charge balancing ions are described by their element symbols.
    pub positive_ion: String,
    pub negative_ion: String,
}

impl SolventComponent {
    pub fn water() -> Self {
        Self {
            name: "water".to_string(),
            positive_ion: "Na+".to_string(),
            negative_ion: "Cl-".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SmallMoleculeComponent {
    pub name: String,
    /// Number of atoms in the molecule, as declared by its definition.
    pub n_atoms: usize,
}

impl SmallMoleculeComponent {
    pub fn new(name: impl Into<String>, n_atoms: usize) -> Self {
        Self {
            name: name.into(),
            n_atoms,
        }
    }
}

/// One constituent of a chemical end state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    Protein(ProteinComponent),
    Solvent(SolventComponent),
    SmallMolecule(SmallMoleculeComponent),
}

impl Component {
    pub fn name(&self) -> &str {
        match self {
            Component::Protein(p) => &p.name,
            Component::Solvent(s) => &s.name,
            Component::SmallMolecule(m) => &m.name,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Protein(_) => ComponentKind::Protein,
            Component::Solvent(_) => ComponentKind::Solvent,
            Component::SmallMolecule(_) => ComponentKind::SmallMolecule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Protein,
    Solvent,
    SmallMolecule,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentKind::Protein => "protein",
            ComponentKind::Solvent => "solvent",
            ComponentKind::SmallMolecule => "small molecule",
        };
        f.write_str(s)
    }
}

/// An explicit atom mapping between two components.
///
/// Absolute transformations decouple a whole component, so no mapping is
/// consumed; the type exists so callers holding one from a network planner
/// can still pass it through the protocol entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMapping {
    pub component_a: Component,
    pub component_b: Component,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_identity_is_kind_and_name() {
        let a = Component::SmallMolecule(SmallMoleculeComponent::new("benzene", 12));
        let b = Component::SmallMolecule(SmallMoleculeComponent::new("benzene", 12));
        let c = Component::Protein(ProteinComponent::new("benzene"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn kind_reports_the_variant() {
        let solvent = Component::Solvent(SolventComponent::water());
        assert_eq!(solvent.kind(), ComponentKind::Solvent);
        assert_eq!(solvent.name(), "water");
    }
}
