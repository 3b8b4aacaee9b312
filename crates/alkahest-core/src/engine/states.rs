//! Thermodynamic and sampler state ensembles.

use super::alchemy::AlchemicalSystem;
use super::error::EngineError;
use super::lambda::{LambdaSchedule, LambdaState};
use crate::core::units::{Pressure, Temperature};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A snapshot of the control parameters and thermodynamic constants of one
/// interpolation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermodynamicState {
    pub lambdas: LambdaState,
    pub temperature: Temperature,
    pub pressure: Option<Pressure>,
}

impl ThermodynamicState {
    pub fn new(lambdas: LambdaState, temperature: Temperature, pressure: Option<Pressure>) -> Self {
        Self {
            lambdas,
            temperature,
            pressure,
        }
    }

    /// Inverse thermal energy in mol/kcal.
    pub fn beta(&self) -> f64 {
        1.0 / self.temperature.kt().value()
    }
}

/// Atomic configuration carried by one replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerState {
    pub positions: Vec<Vector3<f64>>,
    pub velocities: Option<Vec<Vector3<f64>>>,
    pub box_vectors: Option<[Vector3<f64>; 3]>,
}

impl SamplerState {
    pub fn new(positions: Vec<Vector3<f64>>) -> Self {
        Self {
            positions,
            velocities: None,
            box_vectors: None,
        }
    }

    pub fn with_box_vectors(mut self, box_vectors: Option<[Vector3<f64>; 3]>) -> Self {
        self.box_vectors = box_vectors;
        self
    }

    pub fn n_atoms(&self) -> usize {
        self.positions.len()
    }

    /// Box volume in cubic angstrom, if periodic.
    pub fn volume(&self) -> Option<f64> {
        self.box_vectors
            .map(|[a, b, c]| a.dot(&b.cross(&c)).abs())
    }
}

/// The per-replica (thermodynamic state, sampler state) pairs for a leg,
/// index-aligned with its lambda schedule.
#[derive(Debug, Clone)]
pub struct StateEnsemble {
    pub thermodynamic_states: Vec<ThermodynamicState>,
    pub sampler_states: Vec<SamplerState>,
}

impl StateEnsemble {
    pub fn len(&self) -> usize {
        self.thermodynamic_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thermodynamic_states.is_empty()
    }
}

/// Builds one thermodynamic state per schedule window and replicates the
/// initial configuration across all of them.
///
/// Pressure is only attached for periodic systems; box vectors are
/// propagated into every sampler state when present.
pub fn create_state_ensemble(
    system: &AlchemicalSystem,
    initial_positions: Vec<Vector3<f64>>,
    schedule: &LambdaSchedule,
    temperature: Temperature,
    pressure: Option<Pressure>,
) -> Result<StateEnsemble, EngineError> {
    let pressure = if system.system.uses_periodic_boundary_conditions() {
        pressure
    } else {
        None
    };

    let thermodynamic_states: Vec<ThermodynamicState> = schedule
        .states()
        .map(|lambdas| ThermodynamicState::new(lambdas, temperature, pressure))
        .collect();

    let sampler_state =
        SamplerState::new(initial_positions).with_box_vectors(system.system.box_vectors);
    let sampler_states = vec![sampler_state; thermodynamic_states.len()];

    // The schedule was validated before any simulation work began, so a
    // divergence here is an internal logic error.
    if thermodynamic_states.len() != schedule.len() {
        return Err(EngineError::EnsembleMismatch {
            schedule: schedule.len(),
            states: thermodynamic_states.len(),
        });
    }

    Ok(StateEnsemble {
        thermodynamic_states,
        sampler_states,
    })
}
