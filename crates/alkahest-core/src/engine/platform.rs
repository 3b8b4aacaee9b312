//! Compute platform abstraction and the CPU reference platform.
//!
//! The physics engine proper (integration, full energy evaluation) is an
//! external collaborator; samplers drive it through [`ComputePlatform`] and
//! [`ComputeContext`]. The in-tree [`ReferencePlatform`] is a CPU-bound
//! implementation of the contract over a tethered-particle model. It exists
//! for the defensive pre-minimization stage, validation dry runs, and the
//! test suite; production deployments plug in an accelerated engine.

use super::alchemy::AlchemicalSystem;
use super::config::IntegratorSettings;
use super::error::EngineError;
use super::states::{SamplerState, ThermodynamicState};
use crate::core::units::{Temperature, BOLTZMANN_KCAL_PER_MOL_K};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::Rng;

/// Conversion from bar * A^3 to kcal/mol for the pV term.
const PV_KCAL_PER_MOL: f64 = 1.4393e-5;

/// An exclusive handle onto native simulation state.
///
/// Contexts are owned by a single unit for its lifetime and must be
/// released deterministically through the owning cache.
pub trait ComputeContext {
    /// Local energy minimization, moving `state` towards a nearby minimum.
    fn minimize(&mut self, state: &mut SamplerState, max_iterations: usize);

    /// Advances the configuration by `n_steps` integrator steps and returns
    /// the final potential energy in kcal/mol. A non-finite return value
    /// signals numerical divergence; the caller decides on restarts.
    fn propagate(
        &mut self,
        thermodynamic: &ThermodynamicState,
        state: &mut SamplerState,
        n_steps: usize,
        rng: &mut StdRng,
    ) -> f64;

    /// Potential energy of `state` under `thermodynamic`, in kcal/mol.
    fn potential_energy(&self, thermodynamic: &ThermodynamicState, state: &SamplerState) -> f64;

    /// Dimensionless reduced potential u = beta * (U + p V).
    fn reduced_potential(&self, thermodynamic: &ThermodynamicState, state: &SamplerState) -> f64 {
        let u = self.potential_energy(thermodynamic, state);
        let pv = match (thermodynamic.pressure, state.volume()) {
            (Some(p), Some(v)) => p.as_bar() * v * PV_KCAL_PER_MOL,
            _ => 0.0,
        };
        thermodynamic.beta() * (u + pv)
    }

    fn reassign_velocities(
        &self,
        state: &mut SamplerState,
        temperature: Temperature,
        rng: &mut StdRng,
    );
}

/// A factory for [`ComputeContext`]s on one compute backend.
pub trait ComputePlatform: Send + Sync {
    type Context: ComputeContext;

    fn name(&self) -> &'static str;

    fn create_context(
        &self,
        system: &AlchemicalSystem,
        integrator: &IntegratorSettings,
    ) -> Result<Self::Context, EngineError>;
}

/// The CPU-bound reference platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferencePlatform;

impl ReferencePlatform {
    pub fn new() -> Self {
        Self
    }
}

impl ComputePlatform for ReferencePlatform {
    type Context = ReferenceContext;

    fn name(&self) -> &'static str {
        "Reference"
    }

    fn create_context(
        &self,
        system: &AlchemicalSystem,
        _integrator: &IntegratorSettings,
    ) -> Result<Self::Context, EngineError> {
        if system.n_atoms() == 0 {
            return Err(EngineError::ContextCreation {
                platform: self.name().to_string(),
                message: "cannot create a context for an empty system".to_string(),
            });
        }
        Ok(ReferenceContext {
            system: system.clone(),
            reference_positions: None,
        })
    }
}

/// Reference-platform context over a tethered-particle model.
///
/// Every atom is tethered harmonically to its first-seen position; the
/// tether of an alchemical atom weakens with the decoupling progress of the
/// electrostatic and steric lambdas, and the restraint force (if present)
/// is scaled by the restraint lambda. This reproduces the lifecycle and
/// numerical behavior the samplers depend on without reimplementing
/// molecular dynamics.
#[derive(Debug, Clone)]
pub struct ReferenceContext {
    system: AlchemicalSystem,
    reference_positions: Option<Vec<Vector3<f64>>>,
}

const TETHER_K: f64 = 1.0;
const MAX_DISPLACEMENT: f64 = 0.3;

impl ReferenceContext {
    fn ensure_reference(&mut self, state: &SamplerState) {
        if self.reference_positions.is_none() {
            self.reference_positions = Some(state.positions.clone());
        }
    }

    fn tether_constant(&self, atom: usize, thermodynamic: &ThermodynamicState) -> f64 {
        if self.system.region.alchemical_atoms.contains(&atom) {
            let coupling = 0.5
                * ((1.0 - thermodynamic.lambdas.electrostatics)
                    + (1.0 - thermodynamic.lambdas.sterics));
            TETHER_K * coupling
        } else {
            TETHER_K
        }
    }

    fn energy(&self, thermodynamic: &ThermodynamicState, positions: &[Vector3<f64>]) -> f64 {
        let reference = match &self.reference_positions {
            Some(reference) => reference,
            None => return self.restraint_energy(thermodynamic, positions),
        };

        let mut total = 0.0;
        for (i, (r, r0)) in positions.iter().zip(reference).enumerate() {
            let k = self.tether_constant(i, thermodynamic);
            total += 0.5 * k * (r - r0).norm_squared();
        }
        total + self.restraint_energy(thermodynamic, positions)
    }

    fn restraint_energy(
        &self,
        thermodynamic: &ThermodynamicState,
        positions: &[Vector3<f64>],
    ) -> f64 {
        match &self.system.restraint {
            Some(restraint) => restraint.energy(positions, thermodynamic.lambdas.restraints),
            None => 0.0,
        }
    }
}

impl ComputeContext for ReferenceContext {
    fn minimize(&mut self, state: &mut SamplerState, max_iterations: usize) {
        self.ensure_reference(state);
        let reference = self.reference_positions.as_ref().unwrap().clone();
        for _ in 0..max_iterations {
            let mut moved = false;
            for (r, r0) in state.positions.iter_mut().zip(&reference) {
                let delta = *r0 - *r;
                if delta.norm_squared() > 1e-12 {
                    *r += delta * 0.5;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    fn propagate(
        &mut self,
        thermodynamic: &ThermodynamicState,
        state: &mut SamplerState,
        n_steps: usize,
        rng: &mut StdRng,
    ) -> f64 {
        self.ensure_reference(state);
        let beta = thermodynamic.beta();
        let n_atoms = state.positions.len();
        let step_scale =
            MAX_DISPLACEMENT * (thermodynamic.temperature.as_kelvin() / 300.0).sqrt();

        let mut energy = self.energy(thermodynamic, &state.positions);
        if !energy.is_finite() {
            return energy;
        }

        for _ in 0..n_steps {
            let atom = rng.gen_range(0..n_atoms);
            let displacement = Vector3::new(
                (rng.r#gen::<f64>() - 0.5) * 2.0 * step_scale,
                (rng.r#gen::<f64>() - 0.5) * 2.0 * step_scale,
                (rng.r#gen::<f64>() - 0.5) * 2.0 * step_scale,
            );

            let old = state.positions[atom];
            state.positions[atom] = old + displacement;
            let trial = self.energy(thermodynamic, &state.positions);

            let delta = trial - energy;
            if delta <= 0.0 || rng.r#gen::<f64>() < (-beta * delta).exp() {
                energy = trial;
            } else {
                state.positions[atom] = old;
            }

            if !energy.is_finite() {
                return energy;
            }
        }
        energy
    }

    fn potential_energy(&self, thermodynamic: &ThermodynamicState, state: &SamplerState) -> f64 {
        self.energy(thermodynamic, &state.positions)
    }

    fn reassign_velocities(
        &self,
        state: &mut SamplerState,
        temperature: Temperature,
        rng: &mut StdRng,
    ) {
        let kt = BOLTZMANN_KCAL_PER_MOL_K * temperature.as_kelvin();
        let velocities = self
            .system
            .system
            .atoms
            .iter()
            .map(|atom| {
                let sigma = (kt / atom.mass.max(1.0)).sqrt();
                Vector3::new(
                    (rng.r#gen::<f64>() - 0.5) * 2.0 * sigma,
                    (rng.r#gen::<f64>() - 0.5) * 2.0 * sigma,
                    (rng.r#gen::<f64>() - 0.5) * 2.0 * sigma,
                )
            })
            .collect();
        state.velocities = Some(velocities);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validation::NonbondedMethod;
    use crate::engine::alchemy::{AlchemicalFactory, AlchemicalRegion};
    use crate::engine::lambda::LambdaState;
    use crate::engine::services::{NonbondedParameters, ParameterizedSystem};
    use rand::SeedableRng;

    fn test_system(n_atoms: usize) -> AlchemicalSystem {
        let system = ParameterizedSystem {
            atoms: vec![
                NonbondedParameters {
                    mass: 12.0,
                    charge: 0.1,
                    sigma: 3.4,
                    epsilon: 0.1,
                };
                n_atoms
            ],
            nonbonded_method: NonbondedMethod::NoCutoff,
            box_vectors: None,
        };
        AlchemicalFactory::new().create_alchemical_system(
            &system,
            AlchemicalRegion {
                alchemical_atoms: vec![0],
            },
        )
    }

    fn coupled_state() -> ThermodynamicState {
        ThermodynamicState::new(LambdaState::coupled(), Temperature::kelvin(298.15), None)
    }

    #[test]
    fn context_creation_fails_for_empty_systems() {
        let platform = ReferencePlatform::new();
        let result = platform.create_context(&test_system(0), &IntegratorSettings::default());
        assert!(matches!(result, Err(EngineError::ContextCreation { .. })));
    }

    #[test]
    fn minimization_pulls_positions_back_to_the_reference() {
        let platform = ReferencePlatform::new();
        let mut context = platform
            .create_context(&test_system(2), &IntegratorSettings::default())
            .unwrap();

        let reference = vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)];
        let mut state = SamplerState::new(reference.clone());
        context.ensure_reference(&state);

        state.positions[1] = Vector3::new(5.0, 5.0, 5.0);
        context.minimize(&mut state, 100);
        assert!((state.positions[1] - reference[1]).norm() < 1e-6);
    }

    #[test]
    fn propagation_returns_finite_energy_and_moves_atoms() {
        let platform = ReferencePlatform::new();
        let mut context = platform
            .create_context(&test_system(3), &IntegratorSettings::default())
            .unwrap();
        let mut state = SamplerState::new(vec![Vector3::zeros(); 3]);
        let mut rng = StdRng::seed_from_u64(7);

        let energy = context.propagate(&coupled_state(), &mut state, 500, &mut rng);
        assert!(energy.is_finite());
        assert!(state.positions.iter().any(|p| p.norm() > 0.0));
    }

    #[test]
    fn non_finite_positions_surface_as_non_finite_energy() {
        let platform = ReferencePlatform::new();
        let mut context = platform
            .create_context(&test_system(2), &IntegratorSettings::default())
            .unwrap();
        let mut state = SamplerState::new(vec![
            Vector3::new(f64::NAN, 0.0, 0.0),
            Vector3::zeros(),
        ]);
        let mut rng = StdRng::seed_from_u64(7);

        let energy = context.propagate(&coupled_state(), &mut state, 10, &mut rng);
        assert!(!energy.is_finite());
    }

    #[test]
    fn decoupled_alchemical_atoms_lose_their_tether() {
        let platform = ReferencePlatform::new();
        let mut context = platform
            .create_context(&test_system(2), &IntegratorSettings::default())
            .unwrap();
        let state = SamplerState::new(vec![Vector3::zeros(); 2]);
        context.ensure_reference(&state);

        let mut displaced = state.clone();
        displaced.positions[0] = Vector3::new(2.0, 0.0, 0.0);

        let decoupled = ThermodynamicState::new(
            LambdaState {
                electrostatics: 1.0,
                sterics: 1.0,
                restraints: 0.0,
            },
            Temperature::kelvin(298.15),
            None,
        );
        assert_eq!(context.potential_energy(&decoupled, &displaced), 0.0);
        assert!(context.potential_energy(&coupled_state(), &displaced) > 0.0);
    }

    #[test]
    fn reduced_potential_includes_the_pv_term_for_periodic_states() {
        let platform = ReferencePlatform::new();
        let mut context = platform
            .create_context(&test_system(1), &IntegratorSettings::default())
            .unwrap();
        let box_vectors = Some([
            Vector3::new(30.0, 0.0, 0.0),
            Vector3::new(0.0, 30.0, 0.0),
            Vector3::new(0.0, 0.0, 30.0),
        ]);
        let state = SamplerState::new(vec![Vector3::zeros()]).with_box_vectors(box_vectors);
        context.ensure_reference(&state);

        let without_pressure = coupled_state();
        let with_pressure = ThermodynamicState::new(
            LambdaState::coupled(),
            Temperature::kelvin(298.15),
            Some(crate::core::units::Pressure::bar(1.0)),
        );
        let u0 = context.reduced_potential(&without_pressure, &state);
        let u1 = context.reduced_potential(&with_pressure, &state);
        assert!(u1 > u0);
    }
}
