//! The [`ChemicalSystem`] end-state description.

use super::component::{Component, ProteinComponent, SmallMoleculeComponent, SolventComponent};
use serde::{Deserialize, Serialize};

/// An immutable description of one chemical end state.
///
/// Components are kept in insertion order; the set-difference between the
/// two end states of a transformation identifies the alchemical species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChemicalSystem {
    components: Vec<Component>,
}

impl ChemicalSystem {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn protein(&self) -> Option<&ProteinComponent> {
        self.components.iter().find_map(|c| match c {
            Component::Protein(p) => Some(p),
            _ => None,
        })
    }

    pub fn solvent(&self) -> Option<&SolventComponent> {
        self.components.iter().find_map(|c| match c {
            Component::Solvent(s) => Some(s),
            _ => None,
        })
    }

    pub fn small_molecules(&self) -> Vec<&SmallMoleculeComponent> {
        self.components
            .iter()
            .filter_map(|c| match c {
                Component::SmallMolecule(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    /// Components unique to `self` and components unique to `other`,
    /// in that order. Components present in both are omitted.
    pub fn component_diff<'a>(
        &'a self,
        other: &'a ChemicalSystem,
    ) -> (Vec<&'a Component>, Vec<&'a Component>) {
        let unique_self = self
            .components
            .iter()
            .filter(|c| !other.components.contains(c))
            .collect();
        let unique_other = other
            .components
            .iter()
            .filter(|c| !self.components.contains(c))
            .collect();
        (unique_self, unique_other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn benzene() -> Component {
        Component::SmallMolecule(SmallMoleculeComponent::new("benzene", 12))
    }

    fn toluene() -> Component {
        Component::SmallMolecule(SmallMoleculeComponent::new("toluene", 15))
    }

    fn water() -> Component {
        Component::Solvent(SolventComponent::water())
    }

    #[test]
    fn component_diff_identifies_unique_components_on_each_side() {
        let state_a = ChemicalSystem::new(vec![benzene(), water()]);
        let state_b = ChemicalSystem::new(vec![water(), toluene()]);

        let (only_a, only_b) = state_a.component_diff(&state_b);
        assert_eq!(only_a, vec![&benzene()]);
        assert_eq!(only_b, vec![&toluene()]);
    }

    #[test]
    fn component_diff_is_empty_for_identical_systems() {
        let state_a = ChemicalSystem::new(vec![benzene(), water()]);
        let state_b = state_a.clone();

        let (only_a, only_b) = state_a.component_diff(&state_b);
        assert!(only_a.is_empty());
        assert!(only_b.is_empty());
    }

    #[test]
    fn typed_accessors_find_components_by_kind() {
        let system = ChemicalSystem::new(vec![
            Component::Protein(ProteinComponent::new("t4-lysozyme")),
            water(),
            benzene(),
        ]);

        assert_eq!(system.protein().unwrap().name, "t4-lysozyme");
        assert_eq!(system.solvent().unwrap().name, "water");
        assert_eq!(system.small_molecules().len(), 1);
    }
}
