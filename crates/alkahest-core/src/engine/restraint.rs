//! Boresch-style orientational restraints and their standard-state
//! correction.
//!
//! A Boresch restraint ties a guest molecule to its host through one
//! distance, two angles, and three dihedrals over six anchor atoms. The
//! restraint is controlled by a named global parameter so the lambda
//! schedule can scale it from off to fully engaged.

use super::config::{BoreschRestraintSettings, RestraintSettings};
use super::error::EngineError;
use super::states::ThermodynamicState;
use crate::core::units::{Energy, BOLTZMANN_KCAL_PER_MOL_K};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Standard-state volume for a 1 M reference concentration, in cubic
/// angstrom.
const STANDARD_STATE_VOLUME: f64 = 1660.5392;

/// Anchor atoms and reference values located by the restraint geometry
/// search service.
///
/// Host atoms are ordered `[h2, h1, h0]` and guest atoms `[g0, g1, g2]`;
/// the restrained coordinates are the h0-g0 distance, the angles at h0 and
/// g0, and the three dihedrals spanning the anchor chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoreschGeometry {
    pub host_atoms: [usize; 3],
    pub guest_atoms: [usize; 3],
    /// Reference distance in angstrom.
    pub r0: f64,
    /// Reference angles in radians.
    pub theta_a0: f64,
    pub theta_b0: f64,
    /// Reference dihedrals in radians.
    pub phi_a0: f64,
    pub phi_b0: f64,
    pub phi_c0: f64,
}

/// A controllable six-degree-of-freedom restraint force.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoreschRestraint {
    pub settings: BoreschRestraintSettings,
    pub geometry: BoreschGeometry,
    pub controlling_parameter_name: String,
}

impl BoreschRestraint {
    /// Builds the restraint force for the configured restraint family.
    ///
    /// Only the Boresch geometry family is implemented; harmonic and
    /// flat-bottom settings are rejected.
    pub fn from_settings(
        settings: &RestraintSettings,
        geometry: BoreschGeometry,
        controlling_parameter_name: impl Into<String>,
    ) -> Result<Self, EngineError> {
        match settings {
            RestraintSettings::Boresch(boresch) => Ok(Self {
                settings: boresch.clone(),
                geometry,
                controlling_parameter_name: controlling_parameter_name.into(),
            }),
            RestraintSettings::Harmonic(_) => {
                Err(EngineError::not_implemented("harmonic restraints"))
            }
            RestraintSettings::FlatBottom(_) => {
                Err(EngineError::not_implemented("flat-bottom restraints"))
            }
        }
    }

    /// Restraint energy in kcal/mol for the given coordinates, scaled by
    /// the control parameter value.
    pub fn energy(&self, positions: &[Vector3<f64>], scale: f64) -> f64 {
        if scale == 0.0 {
            return 0.0;
        }

        let [h2, h1, h0] = self.geometry.host_atoms;
        let [g0, g1, g2] = self.geometry.guest_atoms;
        let k = &self.settings;

        let r = distance(&positions[h0], &positions[g0]);
        let theta_a = angle(&positions[h1], &positions[h0], &positions[g0]);
        let theta_b = angle(&positions[h0], &positions[g0], &positions[g1]);
        let phi_a = dihedral(
            &positions[h2],
            &positions[h1],
            &positions[h0],
            &positions[g0],
        );
        let phi_b = dihedral(
            &positions[h1],
            &positions[h0],
            &positions[g0],
            &positions[g1],
        );
        let phi_c = dihedral(
            &positions[h0],
            &positions[g0],
            &positions[g1],
            &positions[g2],
        );

        let harmonic = |k: f64, x: f64, x0: f64| 0.5 * k * (x - x0).powi(2);
        let periodic = |k: f64, x: f64, x0: f64| 0.5 * k * wrap_angle(x - x0).powi(2);

        scale
            * (harmonic(k.k_distance, r, self.geometry.r0)
                + harmonic(k.k_theta_a, theta_a, self.geometry.theta_a0)
                + harmonic(k.k_theta_b, theta_b, self.geometry.theta_b0)
                + periodic(k.k_phi_a, phi_a, self.geometry.phi_a0)
                + periodic(k.k_phi_b, phi_b, self.geometry.phi_b0)
                + periodic(k.k_phi_c, phi_c, self.geometry.phi_c0))
    }

    /// Analytic standard-state correction for releasing the restrained
    /// guest into a 1 M reference volume (Boresch et al., J. Phys. Chem. B
    /// 2003).
    ///
    /// Returned with the sign convention that the correction is added to
    /// the binding free energy alongside `-dG_complex + dG_solvent`.
    pub fn standard_state_correction(&self, state: &ThermodynamicState) -> Energy {
        let kt = BOLTZMANN_KCAL_PER_MOL_K * state.temperature.as_kelvin();
        let k = &self.settings;
        let g = &self.geometry;

        let force_constant_product =
            k.k_distance * k.k_theta_a * k.k_theta_b * k.k_phi_a * k.k_phi_b * k.k_phi_c;

        let numerator = 8.0 * PI.powi(2) * STANDARD_STATE_VOLUME * force_constant_product.sqrt();
        let denominator =
            g.r0.powi(2) * g.theta_a0.sin() * g.theta_b0.sin() * (2.0 * PI * kt).powi(3);

        Energy::kcal_per_mol(-kt * (numerator / denominator).ln())
    }
}

fn distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    (a - b).norm()
}

fn angle(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> f64 {
    let v1 = a - b;
    let v2 = c - b;
    let cosine = (v1.dot(&v2) / (v1.norm() * v2.norm())).clamp(-1.0, 1.0);
    cosine.acos()
}

fn dihedral(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>, d: &Vector3<f64>) -> f64 {
    let b1 = b - a;
    let b2 = c - b;
    let b3 = d - c;
    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let m = n1.cross(&(b2 / b2.norm()));
    let x = n1.dot(&n2);
    let y = m.dot(&n2);
    y.atan2(x)
}

/// Maps an angle difference onto (-pi, pi].
fn wrap_angle(delta: f64) -> f64 {
    let mut d = delta % (2.0 * PI);
    if d > PI {
        d -= 2.0 * PI;
    } else if d <= -PI {
        d += 2.0 * PI;
    }
    d
}
