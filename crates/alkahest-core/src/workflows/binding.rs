//! The absolute binding free-energy protocol.
//!
//! `create` validates the end-state pair and all per-leg configuration
//! before building `protocol_repeats` independent units per leg (solvent
//! and complex); `gather` groups the flat unit result stream into the
//! structure backing the statistical reducers.

use super::results::{ProtocolResult, ThermodynamicCycle};
use super::settings::AbsoluteBindingSettings;
use super::unit::{LambdaSource, LegConfig, ProtocolUnit, ProtocolUnitResult, UnitSettings};
use crate::core::models::component::ComponentMapping;
use crate::core::models::system::ChemicalSystem;
use crate::core::validation::{
    self, AlchemicalComponents, ValidationError,
};
use crate::engine::config::ConfigError;
use crate::engine::error::EngineError;
use crate::engine::lambda::LambdaSchedule;
use crate::workflows::results::Leg;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub struct AbsoluteBindingProtocol {
    settings: AbsoluteBindingSettings,
}

impl AbsoluteBindingProtocol {
    pub fn new(settings: AbsoluteBindingSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn default_settings() -> AbsoluteBindingSettings {
        AbsoluteBindingSettings::default()
    }

    pub fn settings(&self) -> &AbsoluteBindingSettings {
        &self.settings
    }

    /// A binding transformation starts from a ligand bound to a solvated
    /// protein and ends with that ligand decoupled; state B must introduce
    /// nothing new.
    fn validate_endstates(
        state_a: &ChemicalSystem,
        state_b: &ChemicalSystem,
    ) -> Result<AlchemicalComponents, ValidationError> {
        if state_a.protein().is_none() {
            return Err(ValidationError::MissingProteinComponent);
        }
        if state_a.solvent().is_none() {
            return Err(ValidationError::MissingSolventComponent);
        }

        let alchemical = validation::get_alchemical_components(state_a, state_b);
        validation::validate_alchemical_components(&alchemical)?;
        Ok(alchemical)
    }

    /// Builds the execution units for one calculation.
    ///
    /// All structural and configuration invariants are checked before any
    /// unit exists; a violation creates no units. Extension of prior runs
    /// is not supported.
    #[instrument(skip_all, name = "binding_create")]
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

        // Validate both lambda schedules before creating any unit.
        LambdaSchedule::from_settings(
            &self.settings.solvent_lambda_settings,
            self.settings.solvent_simulation_settings.n_replicas,
        )?;
        LambdaSchedule::from_settings(
            &self.settings.complex_lambda_settings,
            self.settings.complex_simulation_settings.n_replicas,
        )?;

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
                LegConfig::complex(),
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
            "binding protocol units created"
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
        let unit_settings = match leg_config.leg {
            Leg::Complex => UnitSettings {
                forcefield: settings.forcefield_settings.clone(),
                thermo: settings.thermo_settings,
                solvation: settings.solvation_settings.clone(),
                engine: settings.engine_settings.clone(),
                integrator: settings.integrator_settings.clone(),
                simulation: settings.complex_simulation_settings.clone(),
                output: settings.complex_output_settings.clone(),
                lambda: LambdaSource::Explicit(settings.complex_lambda_settings.clone()),
                restraint: Some(settings.restraint_settings.clone()),
                equilibration: Some(settings.complex_equil_settings),
            },
            _ => UnitSettings {
                forcefield: settings.forcefield_settings.clone(),
                thermo: settings.thermo_settings,
                solvation: settings.solvation_settings.clone(),
                engine: settings.engine_settings.clone(),
                integrator: settings.integrator_settings.clone(),
                simulation: settings.solvent_simulation_settings.clone(),
                output: settings.solvent_output_settings.clone(),
                lambda: LambdaSource::Explicit(settings.solvent_lambda_settings.clone()),
                restraint: None,
                equilibration: None,
            },
        };

        let leg = leg_config.leg;
        ProtocolUnit {
            repeat_id: Uuid::new_v4(),
            generation: 0,
            name: format!(
                "Absolute Binding, {alchemical_name} {leg} leg: repeat {repeat} generation 0"
            ),
            leg_config,
            state_a: state_a.clone(),
            state_b: state_b.clone(),
            alchemical_components: alchemical.clone(),
            settings: unit_settings,
        }
    }

    /// Groups the flat unit result stream by leg, repeat, and generation.
    ///
    /// Failed units are skipped for statistics but retained in the grouped
    /// structure for diagnostics; gathering the same stream twice yields an
    /// identical structure.
    pub fn gather(
        &self,
        unit_results: impl IntoIterator<Item = ProtocolUnitResult>,
    ) -> Result<ProtocolResult, EngineError> {
        ProtocolResult::from_unit_results(ThermodynamicCycle::Binding, unit_results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::component::{
        Component, ProteinComponent, SmallMoleculeComponent, SolventComponent,
    };
    use crate::core::units::TimeSpan;
    use crate::engine::config::{
        EquilibrationSettings, IntegratorSettings, LambdaSettings,
        MultiStateSimulationSettings, OnlineAnalysisSettings, SamplerSettings,
    };
    use crate::workflows::test_support::{execution_context, TestServices};
    use crate::workflows::unit::execute_units;
    use tempfile::TempDir;

    fn protein() -> Component {
        Component::Protein(ProteinComponent::new("t4-lysozyme"))
    }

    fn water() -> Component {
        Component::Solvent(SolventComponent::water())
    }

    fn benzene() -> Component {
        Component::SmallMolecule(SmallMoleculeComponent::new("benzene", 12))
    }

    fn toluene() -> Component {
        Component::SmallMolecule(SmallMoleculeComponent::new("toluene", 15))
    }

    fn binding_states() -> (ChemicalSystem, ChemicalSystem) {
        (
            ChemicalSystem::new(vec![protein(), water(), benzene()]),
            ChemicalSystem::new(vec![protein(), water()]),
        )
    }

    fn protocol() -> AbsoluteBindingProtocol {
        AbsoluteBindingProtocol::new(AbsoluteBindingSettings::default()).unwrap()
    }

    #[test]
    fn create_builds_repeats_for_both_legs_with_fresh_repeat_ids() {
        let (state_a, state_b) = binding_states();
        let units = protocol().create(&state_a, &state_b, None, None).unwrap();

        assert_eq!(units.len(), 6);
        assert_eq!(
            units
                .iter()
                .filter(|u| u.leg_config.leg == Leg::Complex)
                .count(),
            3
        );
        assert_eq!(
            units
                .iter()
                .filter(|u| u.leg_config.leg == Leg::Solvent)
                .count(),
            3
        );
        assert!(units.iter().all(|u| u.generation == 0));

        let mut ids: Vec<_> = units.iter().map(|u| u.repeat_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn complex_units_carry_the_restraint_stage_and_solvent_units_do_not() {
        let (state_a, state_b) = binding_states();
        let units = protocol().create(&state_a, &state_b, None, None).unwrap();

        for unit in &units {
            match unit.leg_config.leg {
                Leg::Complex => {
                    assert!(unit.leg_config.with_restraint);
                    assert!(unit.settings.restraint.is_some());
                    assert_eq!(unit.settings.simulation.n_replicas, 28);
                }
                Leg::Solvent => {
                    assert!(!unit.leg_config.with_restraint);
                    assert!(unit.settings.restraint.is_none());
                    assert_eq!(unit.settings.simulation.n_replicas, 14);
                }
                Leg::Vacuum => panic!("binding protocol created a vacuum unit"),
            }
        }
    }

    #[test]
    fn extends_is_rejected_before_any_validation() {
        let (state_a, state_b) = binding_states();
        let protocol = protocol();
        let prior = protocol.gather(Vec::new()).unwrap();
        let result = protocol.create(&state_a, &state_b, None, Some(&prior));
        assert!(matches!(result, Err(EngineError::NotImplemented { .. })));
    }

    #[test]
    fn state_a_without_protein_fails() {
        let state_a = ChemicalSystem::new(vec![water(), benzene()]);
        let state_b = ChemicalSystem::new(vec![water()]);
        let result = protocol().create(&state_a, &state_b, None, None);
        assert!(matches!(
            result,
            Err(EngineError::Validation {
                source: ValidationError::MissingProteinComponent
            })
        ));
    }

    #[test]
    fn state_a_without_solvent_fails() {
        let state_a = ChemicalSystem::new(vec![protein(), benzene()]);
        let state_b = ChemicalSystem::new(vec![protein()]);
        let result = protocol().create(&state_a, &state_b, None, None);
        assert!(matches!(
            result,
            Err(EngineError::Validation {
                source: ValidationError::MissingSolventComponent
            })
        ));
    }

    #[test]
    fn two_disappearing_ligands_fail() {
        let state_a = ChemicalSystem::new(vec![protein(), water(), benzene(), toluene()]);
        let state_b = ChemicalSystem::new(vec![protein(), water()]);
        let result = protocol().create(&state_a, &state_b, None, None);
        assert!(matches!(
            result,
            Err(EngineError::Validation {
                source: ValidationError::MultipleAlchemicalComponents { count: 2 }
            })
        ));
    }

    #[test]
    fn unique_components_in_state_b_fail() {
        let state_a = ChemicalSystem::new(vec![protein(), water(), benzene()]);
        let state_b = ChemicalSystem::new(vec![protein(), water(), toluene()]);
        let result = protocol().create(&state_a, &state_b, None, None);
        assert!(matches!(
            result,
            Err(EngineError::Validation {
                source: ValidationError::UniqueComponentsInStateB { count: 1 }
            })
        ));
    }

    #[test]
    fn a_bad_lambda_schedule_creates_no_units() {
        let mut settings = AbsoluteBindingSettings::default();
        settings.solvent_lambda_settings = LambdaSettings {
            lambda_elec: vec![0.0, 0.5, 1.0],
            lambda_vdw: vec![0.0, 1.0, 1.0],
            lambda_restraints: vec![0.0; 3],
        };
        settings.solvent_simulation_settings.n_replicas = 3;
        let protocol = AbsoluteBindingProtocol::new(settings).unwrap();

        let (state_a, state_b) = binding_states();
        let result = protocol.create(&state_a, &state_b, None, None);
        assert!(matches!(
            result,
            Err(EngineError::Configuration {
                source: ConfigError::NakedCharge { index: 1, .. }
            })
        ));
    }

    fn fast_binding_settings() -> AbsoluteBindingSettings {
        let simulation = MultiStateSimulationSettings {
            n_replicas: 3,
            minimization_steps: 10,
            equilibration_length: TimeSpan::femtoseconds(400.0),
            production_length: TimeSpan::femtoseconds(6000.0),
            sampler: SamplerSettings::ReplicaExchange,
            online_analysis: OnlineAnalysisSettings {
                interval: 10,
                minimum_iterations: 10,
                target_error: None,
            },
        };
        AbsoluteBindingSettings {
            protocol_repeats: 2,
            integrator_settings: IntegratorSettings {
                n_steps: 50,
                ..IntegratorSettings::default()
            },
            complex_equil_settings: EquilibrationSettings {
                equilibration_length: TimeSpan::femtoseconds(40.0),
            },
            solvent_lambda_settings: LambdaSettings {
                lambda_elec: vec![0.0, 1.0, 1.0],
                lambda_vdw: vec![0.0, 0.0, 1.0],
                lambda_restraints: vec![0.0; 3],
            },
            complex_lambda_settings: LambdaSettings {
                lambda_elec: vec![0.0, 1.0, 1.0],
                lambda_vdw: vec![0.0, 0.0, 1.0],
                lambda_restraints: vec![0.0, 1.0, 1.0],
            },
            solvent_simulation_settings: simulation.clone(),
            complex_simulation_settings: simulation,
            ..AbsoluteBindingSettings::default()
        }
    }

    #[test]
    fn end_to_end_binding_calculation_produces_an_estimate() {
        let temp_dir = TempDir::new().unwrap();
        let services = TestServices;
        let ctx = execution_context(temp_dir.path(), &services);

        let protocol = AbsoluteBindingProtocol::new(fast_binding_settings()).unwrap();
        let (state_a, state_b) = binding_states();
        let units = protocol.create(&state_a, &state_b, None, None).unwrap();
        assert_eq!(units.len(), 4);

        let results = execute_units(&units, &ctx);
        assert!(results.iter().all(|r| r.is_ok()), "a unit failed: {results:?}");

        let gathered = protocol.gather(results).unwrap();
        let summaries = gathered.leg_summaries();
        assert!(summaries.iter().all(|s| s.completed == 2 && s.failed == 0));

        let estimate = gathered.get_estimate().unwrap();
        let uncertainty = gathered.get_uncertainty().unwrap();
        assert!(estimate.is_finite());
        assert!(uncertainty.is_finite());
        assert!(uncertainty.value() >= 0.0);

        // The individual estimates carry a standard-state correction for
        // each complex repeat.
        let individual = gathered.get_individual_estimates();
        assert_eq!(individual.standard_state.len(), 2);

        // Replica-state timeseries read back from the storage files.
        let replica_states = gathered.get_replica_states().unwrap();
        assert_eq!(replica_states[&Leg::Complex].len(), 2);
        assert!(replica_states[&Leg::Complex][0].len() >= 30);
    }

    #[test]
    fn replica_window_mismatch_creates_no_units() {
        let mut settings = AbsoluteBindingSettings::default();
        settings.solvent_simulation_settings.n_replicas = 10;
        let protocol = AbsoluteBindingProtocol::new(settings).unwrap();

        let (state_a, state_b) = binding_states();
        let result = protocol.create(&state_a, &state_b, None, None);
        assert!(matches!(
            result,
            Err(EngineError::Configuration {
                source: ConfigError::ReplicaWindowMismatch {
                    n_replicas: 10,
                    n_windows: 14
                }
            })
        ));
    }
}
