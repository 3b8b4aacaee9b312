//! The absolute solvation free-energy protocol.
//!
//! Runs solvent and vacuum legs with the analytic two-phase lambda
//! schedule; the vacuum leg always runs without a cutoff.

use super::results::{Leg, ProtocolResult, ThermodynamicCycle};
use super::settings::AbsoluteSolvationSettings;
use super::unit::{LambdaSource, LegConfig, ProtocolUnit, ProtocolUnitResult, UnitSettings};
use crate::core::models::component::{Component, ComponentMapping};
use crate::core::models::system::ChemicalSystem;
use crate::core::validation::{self, AlchemicalComponents, ValidationError};
use crate::engine::config::ConfigError;
use crate::engine::error::EngineError;
use crate::engine::lambda::LambdaSchedule;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub struct AbsoluteSolvationProtocol {
    settings: AbsoluteSolvationSettings,
}

impl AbsoluteSolvationProtocol {
    pub fn new(settings: AbsoluteSolvationSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn default_settings() -> AbsoluteSolvationSettings {
        AbsoluteSolvationSettings::default()
    }

    pub fn settings(&self) -> &AbsoluteSolvationSettings {
        &self.settings
    }

    /// A solvation transformation starts from a ligand in solvent and ends
    /// in pure solvent; proteins are not allowed.
    fn validate_endstates(
        state_a: &ChemicalSystem,
        state_b: &ChemicalSystem,
    ) -> Result<AlchemicalComponents, ValidationError> {
        let pure_solvent = state_b.len() == 1
            && matches!(state_b.components().first(), Some(Component::Solvent(_)));
        if !pure_solvent {
            return Err(ValidationError::StateBNotPureSolvent);
        }
        if state_a.protein().is_some() {
            return Err(ValidationError::ProteinInSolvationState);
        }

        let alchemical = validation::get_alchemical_components(state_a, state_b);
        validation::validate_alchemical_components(&alchemical)?;
        Ok(alchemical)
    }

    #[instrument(skip_all, name = "solvation_create")]
    pub fn create(
        &self,
        state_a: &ChemicalSystem,
        state_b: &ChemicalSystem,
        mapping: Option<&ComponentMapping>,
        extends: Option<&ProtocolResult>,
    ) -> Result<Vec<ProtocolUnit>, EngineError> {
        if extends.is_some() {
            return Err(EngineError::not_implemented("extending prior runs"));
        }
        if mapping.is_some() {
            debug!("component mappings are ignored for absolute transformations");
        }

        let alchemical = Self::validate_endstates(state_a, state_b)?;

        // Both legs share the analytic schedule; validate it against each
        // leg's replica count before creating any unit.
        let alchemical_settings = &self.settings.alchemical_settings;
        for simulation in [
            &self.settings.solvent_simulation_settings,
            &self.settings.vacuum_simulation_settings,
        ] {
            LambdaSchedule::windowed(
                alchemical_settings.lambda_elec_windows,
                alchemical_settings.lambda_vdw_windows,
                simulation.n_replicas,
            )?;
        }

        validation::validate_solvent(
            state_a,
            self.settings.forcefield_settings.nonbonded_method,
        )?;
        crate::engine::config::validate_solvation_settings(&self.settings.solvation_settings)?;

        let alchemical_name = alchemical.state_a[0].name().to_string();
        let mut units = Vec::with_capacity(2 * self.settings.protocol_repeats);
        for repeat in 0..self.settings.protocol_repeats {
            units.push(self.build_unit(
                LegConfig::solvent(),
                &alchemical_name,
                repeat,
                state_a,
                state_b,
                &alchemical,
            ));
            units.push(self.build_unit(
                LegConfig::vacuum(),
                &alchemical_name,
                repeat,
                state_a,
                state_b,
                &alchemical,
            ));
        }

        info!(
            n_units = units.len(),
            repeats = self.settings.protocol_repeats,
            ligand = %alchemical_name,
            "solvation protocol units created"
        );
        Ok(units)
    }

    fn build_unit(
        &self,
        leg_config: LegConfig,
        alchemical_name: &str,
        repeat: usize,
        state_a: &ChemicalSystem,
        state_b: &ChemicalSystem,
        alchemical: &AlchemicalComponents,
    ) -> ProtocolUnit {
        let settings = &self.settings;
        let (simulation, output) = match leg_config.leg {
            Leg::Vacuum => (
                settings.vacuum_simulation_settings.clone(),
                settings.vacuum_output_settings.clone(),
            ),
            _ => (
                settings.solvent_simulation_settings.clone(),
                settings.solvent_output_settings.clone(),
            ),
        };

        let leg = leg_config.leg;
        ProtocolUnit {
            repeat_id: Uuid::new_v4(),
            generation: 0,
            name: format!(
                "Absolute Solvation, {alchemical_name} {leg} leg: repeat {repeat} generation 0"
            ),
            leg_config,
            state_a: state_a.clone(),
            state_b: state_b.clone(),
            alchemical_components: alchemical.clone(),
            settings: UnitSettings {
                forcefield: settings.forcefield_settings.clone(),
                thermo: settings.thermo_settings,
                solvation: settings.solvation_settings.clone(),
                engine: settings.engine_settings.clone(),
                integrator: settings.integrator_settings.clone(),
                simulation,
                output,
                lambda: LambdaSource::Windowed {
                    n_elec: settings.alchemical_settings.lambda_elec_windows,
                    n_vdw: settings.alchemical_settings.lambda_vdw_windows,
                },
                restraint: None,
                equilibration: None,
            },
        }
    }

    /// Groups the flat unit result stream by leg, repeat, and generation.
    pub fn gather(
        &self,
        unit_results: impl IntoIterator<Item = ProtocolUnitResult>,
    ) -> Result<ProtocolResult, EngineError> {
        ProtocolResult::from_unit_results(ThermodynamicCycle::Solvation, unit_results)
    }
}
