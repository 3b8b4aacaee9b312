//! Protocol-level settings bundles.
//!
//! Each protocol owns one flat bundle of the per-stage settings structs
//! from [`crate::engine::config`]. The defaults are a reasonable starting
//! point for production calculations; inspect and customize them before
//! running anything expensive.

use crate::engine::config::{
    validate_solvation_settings, validate_timestep, AlchemicalSettings, BoreschRestraintSettings,
    ConfigError, EngineSettings, EquilibrationSettings, ForcefieldSettings, IntegratorSettings,
    LambdaSettings, MultiStateSimulationSettings, OutputSettings, RestraintSettings,
    SolvationSettings, ThermoSettings,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteBindingSettings {
    pub protocol_repeats: usize,
    pub forcefield_settings: ForcefieldSettings,
    pub thermo_settings: ThermoSettings,
    pub solvation_settings: SolvationSettings,
    pub engine_settings: EngineSettings,
    pub integrator_settings: IntegratorSettings,
    pub restraint_settings: RestraintSettings,
    /// Pre-restraint equilibration of the complex leg.
    pub complex_equil_settings: EquilibrationSettings,
    pub solvent_lambda_settings: LambdaSettings,
    pub complex_lambda_settings: LambdaSettings,
    pub solvent_simulation_settings: MultiStateSimulationSettings,
    pub complex_simulation_settings: MultiStateSimulationSettings,
    pub solvent_output_settings: OutputSettings,
    pub complex_output_settings: OutputSettings,
}

impl Default for AbsoluteBindingSettings {
    fn default() -> Self {
        Self {
            protocol_repeats: 3,
            forcefield_settings: ForcefieldSettings::default(),
            thermo_settings: ThermoSettings::default(),
            solvation_settings: SolvationSettings::default(),
            engine_settings: EngineSettings::default(),
            integrator_settings: IntegratorSettings::default(),
            restraint_settings: RestraintSettings::Boresch(BoreschRestraintSettings::default()),
            complex_equil_settings: EquilibrationSettings::default(),
            solvent_lambda_settings: LambdaSettings {
                lambda_elec: vec![
                    0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0,
                ],
                lambda_vdw: vec![
                    0.0, 0.0, 0.0, 0.0, 0.0, 0.12, 0.24, 0.36, 0.48, 0.6, 0.7, 0.77, 0.85, 1.0,
                ],
                lambda_restraints: vec![0.0; 14],
            },
            complex_lambda_settings: LambdaSettings {
                lambda_elec: vec![
                    0.0, 0.0, 0.0, 0.0, 0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0,
                    1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0,
                ],
                lambda_vdw: vec![
                    0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.1,
                    0.2, 0.3, 0.4, 0.5, 0.6, 0.65, 0.7, 0.75, 0.8, 0.85, 0.9, 0.95, 1.0,
                ],
                lambda_restraints: vec![
                    0.0, 0.2, 0.4, 0.6, 0.8, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0,
                    1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0,
                ],
            },
            solvent_simulation_settings: MultiStateSimulationSettings {
                n_replicas: 14,
                ..MultiStateSimulationSettings::default()
            },
            complex_simulation_settings: MultiStateSimulationSettings {
                n_replicas: 28,
                ..MultiStateSimulationSettings::default()
            },
            solvent_output_settings: OutputSettings::for_leg("solvent"),
            complex_output_settings: OutputSettings::for_leg("complex"),
        }
    }
}

impl AbsoluteBindingSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_repeats == 0 {
            return Err(ConfigError::NoRepeats);
        }
        validate_timestep(
            self.forcefield_settings.hydrogen_mass,
            self.integrator_settings.timestep,
        )?;
        validate_solvation_settings(&self.solvation_settings)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteSolvationSettings {
    pub protocol_repeats: usize,
    pub forcefield_settings: ForcefieldSettings,
    pub thermo_settings: ThermoSettings,
    /// Window counts for the analytic two-phase schedule shared by both
    /// legs.
    pub alchemical_settings: AlchemicalSettings,
    pub solvation_settings: SolvationSettings,
    pub engine_settings: EngineSettings,
    pub integrator_settings: IntegratorSettings,
    pub solvent_simulation_settings: MultiStateSimulationSettings,
    pub vacuum_simulation_settings: MultiStateSimulationSettings,
    pub solvent_output_settings: OutputSettings,
    pub vacuum_output_settings: OutputSettings,
}

impl Default for AbsoluteSolvationSettings {
    fn default() -> Self {
        let alchemical_settings = AlchemicalSettings::default();
        let n_replicas =
            alchemical_settings.lambda_elec_windows + alchemical_settings.lambda_vdw_windows;
        Self {
            protocol_repeats: 3,
            forcefield_settings: ForcefieldSettings::default(),
            thermo_settings: ThermoSettings::default(),
            alchemical_settings,
            solvation_settings: SolvationSettings::default(),
            engine_settings: EngineSettings::default(),
            integrator_settings: IntegratorSettings::default(),
            solvent_simulation_settings: MultiStateSimulationSettings {
                n_replicas,
                ..MultiStateSimulationSettings::default()
            },
            vacuum_simulation_settings: MultiStateSimulationSettings {
                n_replicas,
                equilibration_length: crate::core::units::TimeSpan::nanoseconds(0.5),
                production_length: crate::core::units::TimeSpan::nanoseconds(2.0),
                ..MultiStateSimulationSettings::default()
            },
            solvent_output_settings: OutputSettings::for_leg("solvent"),
            vacuum_output_settings: OutputSettings::for_leg("vacuum"),
        }
    }
}

impl AbsoluteSolvationSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_repeats == 0 {
            return Err(ConfigError::NoRepeats);
        }
        validate_timestep(
            self.forcefield_settings.hydrogen_mass,
            self.integrator_settings.timestep,
        )?;
        validate_solvation_settings(&self.solvation_settings)?;
        Ok(())
    }
}
