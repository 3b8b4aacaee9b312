//! Structural topology of a built molecular model.
//!
//! The topology is the residue/atom layout produced by the modeller service.
//! It is deliberately minimal: the engine only needs a deterministic
//! residue-then-atom traversal order to resolve alchemical atom indices in a
//! way that is reproducible across checkpoint/restart cycles.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyResidue {
    pub name: String,
    /// Atom indices owned by this residue, in traversal order.
    pub atom_indices: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    residues: Vec<TopologyResidue>,
}

impl Topology {
    pub fn new(residues: Vec<TopologyResidue>) -> Self {
        Self { residues }
    }

    pub fn residues(&self) -> &[TopologyResidue] {
        &self.residues
    }

    pub fn n_residues(&self) -> usize {
        self.residues.len()
    }

    pub fn n_atoms(&self) -> usize {
        self.residues.iter().map(|r| r.atom_indices.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_count_sums_over_residues() {
        let topology = Topology::new(vec![
            TopologyResidue {
                name: "LIG".to_string(),
                atom_indices: vec![0, 1, 2],
            },
            TopologyResidue {
                name: "HOH".to_string(),
                atom_indices: vec![3, 4, 5],
            },
        ]);
        assert_eq!(topology.n_residues(), 2);
        assert_eq!(topology.n_atoms(), 6);
    }
}
