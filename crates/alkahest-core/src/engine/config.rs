//! Per-stage simulation settings and their validation.
//!
//! Each stage of the pipeline owns a plain configuration struct, validated
//! by a pure function at construction time. All checks in this module run
//! before any compute resource is allocated.

use crate::core::units::{Energy, Pressure, Temperature, TimeSpan};
use crate::core::validation::NonbondedMethod;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error(
        "Components elec, vdw, and restraints must have an equal number of lambda \
         windows. Got {elec} elec windows, {vdw} vdw windows, and {restraints} \
         restraints windows"
    )]
    LambdaComponentMismatch {
        elec: usize,
        vdw: usize,
        restraints: usize,
    },

    #[error("Number of replicas {n_replicas} does not equal the number of lambda windows {n_windows}")]
    ReplicaWindowMismatch { n_replicas: usize, n_windows: usize },

    #[error(
        "There are states along this lambda schedule where atoms have charges but no \
         LJ interactions: lambda {index}: elec {elec} vdw {vdw}"
    )]
    NakedCharge { index: usize, elec: f64, vdw: f64 },

    #[error("Lambda {component} window {index} is {value}, outside [0, 1]")]
    LambdaOutOfRange {
        component: &'static str,
        index: usize,
        value: f64,
    },

    #[error("An analytic lambda schedule needs at least one window per component, got elec {n_elec} vdw {n_vdw}")]
    EmptyLambdaPhase { n_elec: usize, n_vdw: usize },

    #[error(
        "Timestep of {timestep_fs} fs requires a hydrogen mass of at least 3 amu, got {hydrogen_mass} amu"
    )]
    TimestepHydrogenMass { timestep_fs: f64, hydrogen_mass: f64 },

    #[error("{label} length of {length_fs} fs is not an exact multiple of the {timestep_fs} fs timestep")]
    IndivisibleSimulationTime {
        label: &'static str,
        length_fs: f64,
        timestep_fs: f64,
    },

    #[error("{label} step count {steps} is not an exact multiple of the {mc_steps} steps per MCMC move")]
    IndivisibleMcmcSteps {
        label: &'static str,
        steps: usize,
        mc_steps: usize,
    },

    #[error("Solvent padding must be positive, got {padding} angstrom")]
    NonPositivePadding { padding: f64 },

    #[error("Unsupported water model: {model}")]
    UnsupportedWaterModel { model: String },

    #[error("protocol_repeats must be at least 1")]
    NoRepeats,
}

/// Explicit per-component lambda window arrays.
///
/// A value is the decoupling progress of that interaction class: 0 is fully
/// coupled, 1 is fully decoupled. The restraint component scales the
/// restraint in the opposite sense, from off (0) to fully engaged (1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaSettings {
    pub lambda_elec: Vec<f64>,
    pub lambda_vdw: Vec<f64>,
    pub lambda_restraints: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermoSettings {
    pub temperature: Temperature,
    /// Absent for non-periodic (vacuum) legs.
    pub pressure: Option<Pressure>,
}

impl Default for ThermoSettings {
    fn default() -> Self {
        Self {
            temperature: Temperature::kelvin(298.15),
            pressure: Some(Pressure::bar(1.0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcefieldSettings {
    pub nonbonded_method: NonbondedMethod,
    /// Mass repartitioned onto hydrogens, in amu.
    pub hydrogen_mass: f64,
    pub small_molecule_forcefield: String,
}

impl Default for ForcefieldSettings {
    fn default() -> Self {
        Self {
            nonbonded_method: NonbondedMethod::Pme,
            hydrogen_mass: 3.0,
            small_molecule_forcefield: "openff-2.1.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorSettings {
    pub timestep: TimeSpan,
    /// Langevin collision rate in 1/ps.
    pub collision_rate: f64,
    /// Integrator steps per MCMC move; one sampler iteration runs one move
    /// per replica.
    pub n_steps: usize,
    pub reassign_velocities: bool,
    /// Bounded restarts with reassigned velocities on non-finite energies.
    pub n_restart_attempts: usize,
    pub constraint_tolerance: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            timestep: TimeSpan::femtoseconds(4.0),
            collision_rate: 1.0,
            n_steps: 250,
            reassign_velocities: false,
            n_restart_attempts: 20,
            constraint_tolerance: 1e-6,
        }
    }
}

/// Which multi-state sampling strategy a unit runs.
///
/// Fixed at sampler construction; strategy-specific parameters live on their
/// own variant so SAMS knobs cannot leak into a replica-exchange setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplerSettings {
    ReplicaExchange,
    Sams(SamsSettings),
    Independent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamsSettings {
    /// Maximum allowed deviation of the state-visit histogram from flat
    /// before switching to the asymptotically optimal gain schedule.
    pub flatness_criterion: f64,
    /// Initial adaptation rate.
    pub gamma0: f64,
}

impl Default for SamsSettings {
    fn default() -> Self {
        Self {
            flatness_criterion: 0.2,
            gamma0: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineAnalysisSettings {
    /// Iterations between free-energy estimates during production.
    pub interval: usize,
    /// No estimate is attempted before this many iterations have run.
    pub minimum_iterations: usize,
    /// Production ends early once the estimated error drops to this target.
    pub target_error: Option<Energy>,
}

impl Default for OnlineAnalysisSettings {
    fn default() -> Self {
        Self {
            interval: 250,
            minimum_iterations: 500,
            target_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStateSimulationSettings {
    pub n_replicas: usize,
    pub minimization_steps: usize,
    pub equilibration_length: TimeSpan,
    pub production_length: TimeSpan,
    pub sampler: SamplerSettings,
    pub online_analysis: OnlineAnalysisSettings,
}

impl Default for MultiStateSimulationSettings {
    fn default() -> Self {
        Self {
            n_replicas: 11,
            minimization_steps: 5000,
            equilibration_length: TimeSpan::nanoseconds(1.0),
            production_length: TimeSpan::nanoseconds(10.0),
            sampler: SamplerSettings::ReplicaExchange,
            online_analysis: OnlineAnalysisSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    pub output_filename: String,
    pub checkpoint_storage_filename: String,
    /// Iterations between checkpoint writes.
    pub checkpoint_interval: usize,
    pub real_time_analysis_filename: Option<String>,
}

impl OutputSettings {
    pub fn for_leg(prefix: &str) -> Self {
        Self {
            output_filename: format!("{prefix}.nc"),
            checkpoint_storage_filename: format!("{prefix}_checkpoint.nc"),
            checkpoint_interval: 250,
            real_time_analysis_filename: Some("real_time_analysis.json".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Requested compute platform name; `None` selects the fastest
    /// available platform.
    pub compute_platform: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolvationBackend {
    OpenMm,
    Packmol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvationSettings {
    pub water_model: String,
    /// Minimum solute-box distance in angstrom.
    pub solvent_padding: f64,
    pub backend: SolvationBackend,
}

impl Default for SolvationSettings {
    fn default() -> Self {
        Self {
            water_model: "tip3p".to_string(),
            solvent_padding: 12.0,
            backend: SolvationBackend::OpenMm,
        }
    }
}

const SUPPORTED_WATER_MODELS: [&str; 3] = ["tip3p", "tip4pew", "spce"];

pub fn validate_solvation_settings(settings: &SolvationSettings) -> Result<(), ConfigError> {
    if settings.solvent_padding <= 0.0 {
        return Err(ConfigError::NonPositivePadding {
            padding: settings.solvent_padding,
        });
    }
    if !SUPPORTED_WATER_MODELS.contains(&settings.water_model.as_str()) {
        return Err(ConfigError::UnsupportedWaterModel {
            model: settings.water_model.clone(),
        });
    }
    Ok(())
}

/// Window counts for the analytic two-phase solvation schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlchemicalSettings {
    pub lambda_elec_windows: usize,
    pub lambda_vdw_windows: usize,
}

impl Default for AlchemicalSettings {
    fn default() -> Self {
        Self {
            lambda_elec_windows: 12,
            lambda_vdw_windows: 18,
        }
    }
}

/// Geometric restraint family and its parameters.
///
/// Only the Boresch family is currently implemented; the other variants are
/// accepted as configuration but rejected when the restraint is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RestraintSettings {
    Boresch(BoreschRestraintSettings),
    Harmonic(HarmonicRestraintSettings),
    FlatBottom(FlatBottomRestraintSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoreschRestraintSettings {
    /// Distance force constant in kcal/(mol A^2).
    pub k_distance: f64,
    /// Angle force constants in kcal/(mol rad^2).
    pub k_theta_a: f64,
    pub k_theta_b: f64,
    /// Dihedral force constants in kcal/(mol rad^2).
    pub k_phi_a: f64,
    pub k_phi_b: f64,
    pub k_phi_c: f64,
}

impl Default for BoreschRestraintSettings {
    fn default() -> Self {
        Self {
            k_distance: 20.0,
            k_theta_a: 20.0,
            k_theta_b: 20.0,
            k_phi_a: 20.0,
            k_phi_b: 20.0,
            k_phi_c: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarmonicRestraintSettings {
    pub k_distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatBottomRestraintSettings {
    pub k_distance: f64,
    pub well_radius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquilibrationSettings {
    pub equilibration_length: TimeSpan,
}

impl Default for EquilibrationSettings {
    fn default() -> Self {
        Self {
            equilibration_length: TimeSpan::picoseconds(100.0),
        }
    }
}

/// Timesteps above 2 fs are only stable with repartitioned hydrogen masses.
pub fn validate_timestep(hydrogen_mass: f64, timestep: TimeSpan) -> Result<(), ConfigError> {
    if timestep.as_femtoseconds() > 2.0 && hydrogen_mass < 3.0 {
        return Err(ConfigError::TimestepHydrogenMass {
            timestep_fs: timestep.as_femtoseconds(),
            hydrogen_mass,
        });
    }
    Ok(())
}

fn exact_steps(
    label: &'static str,
    length: TimeSpan,
    timestep: TimeSpan,
    mc_steps: usize,
) -> Result<usize, ConfigError> {
    let ratio = length.as_femtoseconds() / timestep.as_femtoseconds();
    let steps = ratio.round();
    if (ratio - steps).abs() > 1e-9 {
        return Err(ConfigError::IndivisibleSimulationTime {
            label,
            length_fs: length.as_femtoseconds(),
            timestep_fs: timestep.as_femtoseconds(),
        });
    }
    let steps = steps as usize;
    if steps % mc_steps != 0 {
        return Err(ConfigError::IndivisibleMcmcSteps {
            label,
            steps,
            mc_steps,
        });
    }
    Ok(steps)
}

/// Converts the configured equilibration/production lengths into integrator
/// step counts, requiring exact division by the timestep and by the per-MCMC
/// move step count.
pub fn get_simsteps(
    equil_length: TimeSpan,
    prod_length: TimeSpan,
    timestep: TimeSpan,
    mc_steps: usize,
) -> Result<(usize, usize), ConfigError> {
    let equil = exact_steps("Equilibration", equil_length, timestep, mc_steps)?;
    let prod = exact_steps("Production", prod_length, timestep, mc_steps)?;
    Ok((equil, prod))
}
