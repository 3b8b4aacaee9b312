//! The per-leg execution unit and its pipeline.
//!
//! One [`ProtocolUnit`] is one independent repeat of one leg of the
//! thermodynamic cycle. Units share no mutable state; each runs the same
//! parametrized pipeline, with a [`LegConfig`] value selecting the per-leg
//! specialization (which components enter the system, whether a restraint
//! stage runs, and any nonbonded-method override).

use crate::core::models::component::SmallMoleculeComponent;
use crate::core::models::system::ChemicalSystem;
use crate::core::units::Energy;
use crate::core::validation::{AlchemicalComponents, NonbondedMethod};
use crate::engine::alchemy::{AlchemicalFactory, AlchemicalRegion, AlchemicalSystem};
use crate::engine::analysis::{
    replica_transition_statistics, ForwardReverseAnalysis, MultiStateAnalyzer, OverlapMatrix,
    TransitionStatistics,
};
use crate::engine::cache::{shared_context_pool, ContextCache};
use crate::engine::config::{
    get_simsteps, validate_timestep, EngineSettings, EquilibrationSettings, ForcefieldSettings,
    IntegratorSettings, LambdaSettings, MultiStateSimulationSettings, OutputSettings,
    RestraintSettings, SolvationSettings, ThermoSettings,
};
use crate::engine::error::EngineError;
use crate::engine::lambda::{LambdaSchedule, LambdaState};
use crate::engine::platform::{ComputeContext, ComputePlatform, ReferencePlatform};
use crate::engine::reporter::MultiStateReporter;
use crate::engine::restraint::BoreschRestraint;
use crate::engine::sampler::MultiStateSampler;
use crate::engine::services::{
    ModellerService, ParameterizedSystem, RestraintSearchService, StructuralModel,
    SystemGeneratorService,
};
use crate::engine::states::{create_state_ensemble, SamplerState, ThermodynamicState};
use crate::workflows::results::Leg;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Iterations of the defensive pre-minimization pass.
const PRE_MINIMIZE_ITERATIONS: usize = 100;

/// Per-leg specialization of the unit pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegConfig {
    pub leg: Leg,
    pub with_restraint: bool,
    pub include_protein: bool,
    pub include_solvent: bool,
    pub nonbonded_override: Option<NonbondedMethod>,
}

impl LegConfig {
    pub fn complex() -> Self {
        Self {
            leg: Leg::Complex,
            with_restraint: true,
            include_protein: true,
            include_solvent: true,
            nonbonded_override: None,
        }
    }

    pub fn solvent() -> Self {
        Self {
            leg: Leg::Solvent,
            with_restraint: false,
            include_protein: false,
            include_solvent: true,
            nonbonded_override: None,
        }
    }

    pub fn vacuum() -> Self {
        Self {
            leg: Leg::Vacuum,
            with_restraint: false,
            include_protein: false,
            include_solvent: false,
            nonbonded_override: Some(NonbondedMethod::NoCutoff),
        }
    }
}

/// How a unit obtains its lambda schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LambdaSource {
    Explicit(LambdaSettings),
    Windowed { n_elec: usize, n_vdw: usize },
}

/// The settings bundle one unit runs with, cherry-picked per leg by the
/// protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSettings {
    pub forcefield: ForcefieldSettings,
    pub thermo: ThermoSettings,
    pub solvation: SolvationSettings,
    pub engine: EngineSettings,
    pub integrator: IntegratorSettings,
    pub simulation: MultiStateSimulationSettings,
    pub output: OutputSettings,
    pub lambda: LambdaSource,
    /// Restraint configuration; only consulted for restrained legs.
    pub restraint: Option<RestraintSettings>,
    pub equilibration: Option<EquilibrationSettings>,
}

/// Shared services and resources a unit executes against.
pub struct ExecutionContext<'a, P: ComputePlatform> {
    pub shared_basepath: &'a Path,
    pub generator_service: &'a dyn SystemGeneratorService,
    pub modeller_service: &'a dyn ModellerService,
    pub restraint_service: &'a dyn RestraintSearchService,
    pub platform: Arc<P>,
    pub forcefield_cache: Option<&'a Path>,
}

/// The raw outputs record of one completed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutput {
    pub repeat_id: Uuid,
    pub generation: u32,
    pub simtype: Leg,
    pub unit_estimate: Energy,
    pub unit_estimate_error: Energy,
    pub standard_state_correction: Option<Energy>,
    pub forward_and_reverse_energies: Option<ForwardReverseAnalysis>,
    pub unit_mbar_overlap: OverlapMatrix,
    pub replica_exchange_statistics: Option<TransitionStatistics>,
    pub equilibration_iterations: usize,
    pub production_iterations: usize,
    pub nc: PathBuf,
    pub last_checkpoint: PathBuf,
}

/// The failure record of a unit, kept inspectable for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub repeat_id: Uuid,
    pub generation: u32,
    pub simtype: Leg,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolUnitResult {
    Complete(UnitOutput),
    Failed(FailedUnit),
}

impl ProtocolUnitResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProtocolUnitResult::Complete(_))
    }

    pub fn outputs(&self) -> Option<&UnitOutput> {
        match self {
            ProtocolUnitResult::Complete(outputs) => Some(outputs),
            ProtocolUnitResult::Failed(_) => None,
        }
    }
}

/// One independent repeat of one leg at one extension generation.
#[derive(Debug, Clone)]
pub struct ProtocolUnit {
    pub repeat_id: Uuid,
    pub generation: u32,
    pub name: String,
    pub leg_config: LegConfig,
    pub state_a: ChemicalSystem,
    pub state_b: ChemicalSystem,
    pub alchemical_components: AlchemicalComponents,
    pub settings: UnitSettings,
}

enum RunOutcome<P: ComputePlatform> {
    Complete(Box<UnitOutput>),
    DryRun(Box<MultiStateSampler<P>>),
}

impl ProtocolUnit {
    /// Runs the unit to completion, converting any error into a failure
    /// record. Sibling units are unaffected either way.
    pub fn execute<P: ComputePlatform>(&self, ctx: &ExecutionContext<'_, P>) -> ProtocolUnitResult {
        let result = self.run(ctx, false);
        shared_context_pool().reset();
        match result {
            Ok(RunOutcome::Complete(outputs)) => ProtocolUnitResult::Complete(*outputs),
            Ok(RunOutcome::DryRun(_)) => ProtocolUnitResult::Failed(self.failure_record(
                &EngineError::Internal("dry-run outcome from a production execution".to_string()),
            )),
            Err(error) => {
                warn!(unit = %self.name, error = %error, "unit failed");
                ProtocolUnitResult::Failed(self.failure_record(&error))
            }
        }
    }

    /// Validation-only run: builds every pipeline stage, then releases all
    /// resources and surfaces the constructed sampler for inspection
    /// instead of running it. No storage files are left behind.
    pub fn dry_run<P: ComputePlatform>(
        &self,
        ctx: &ExecutionContext<'_, P>,
    ) -> Result<MultiStateSampler<P>, EngineError> {
        let result = self.run(ctx, true);
        shared_context_pool().reset();
        match result? {
            RunOutcome::DryRun(sampler) => Ok(*sampler),
            RunOutcome::Complete(_) => Err(EngineError::Internal(
                "production outcome from a dry run".to_string(),
            )),
        }
    }

    fn failure_record(&self, error: &EngineError) -> FailedUnit {
        FailedUnit {
            repeat_id: self.repeat_id,
            generation: self.generation,
            simtype: self.leg_config.leg,
            error: render_error_chain(error),
        }
    }

    #[instrument(skip_all, name = "unit_pipeline", fields(unit = %self.name))]
    fn run<P: ComputePlatform>(
        &self,
        ctx: &ExecutionContext<'_, P>,
        dry: bool,
    ) -> Result<RunOutcome<P>, EngineError> {
        let settings = &self.settings;

        // === Phase 0: Validation, before any resource is allocated ===
        validate_timestep(settings.forcefield.hydrogen_mass, settings.integrator.timestep)?;
        let (equil_steps, prod_steps) = get_simsteps(
            settings.simulation.equilibration_length,
            settings.simulation.production_length,
            settings.integrator.timestep,
            settings.integrator.n_steps,
        )?;
        if let Some(requested) = &settings.engine.compute_platform {
            if !requested.eq_ignore_ascii_case(ctx.platform.name()) {
                return Err(EngineError::PlatformUnavailable {
                    platform: requested.clone(),
                    message: format!("only '{}' is available", ctx.platform.name()),
                });
            }
        }

        // Output files of this unit live in their own directory so sibling
        // units never collide.
        let unit_dir = ctx.shared_basepath.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&unit_dir)
            .map_err(|e| EngineError::storage(unit_dir.clone(), e))?;

        // === Phase 1: Components for this leg ===
        let protein = self
            .leg_config
            .include_protein
            .then(|| self.state_a.protein())
            .flatten();
        let solvent = self
            .leg_config
            .include_solvent
            .then(|| self.state_a.solvent())
            .flatten();
        let small_molecules: Vec<SmallMoleculeComponent> = self
            .state_a
            .small_molecules()
            .into_iter()
            .cloned()
            .collect();

        let mut forcefield = settings.forcefield.clone();
        if let Some(method) = self.leg_config.nonbonded_override {
            forcefield.nonbonded_method = method;
        }

        // === Phase 2: Parameterize and build the structural model ===
        info!(leg = %self.leg_config.leg, "parameterizing and solvating system");
        let generator = ctx.generator_service.system_generator(
            &forcefield,
            &settings.thermo,
            ctx.forcefield_cache,
            solvent.is_some(),
        )?;
        let model = ctx.modeller_service.build_model(
            protein,
            solvent,
            &small_molecules,
            &settings.solvation,
        )?;
        let system = generator.create_system(&model.topology, &small_molecules)?;

        // === Phase 3: Defensive pre-minimization on the CPU platform ===
        let positions = pre_minimize(&system, model.positions.clone())?;

        // === Phase 4: Lambda schedule ===
        let schedule = match &settings.lambda {
            LambdaSource::Explicit(lambda_settings) => {
                LambdaSchedule::from_settings(lambda_settings, settings.simulation.n_replicas)?
            }
            LambdaSource::Windowed { n_elec, n_vdw } => {
                LambdaSchedule::windowed(*n_elec, *n_vdw, settings.simulation.n_replicas)?
            }
        };

        // === Phase 5: Alchemical system, with restraint for binding legs ===
        let alchemical_indices = AlchemicalFactory::resolve_alchemical_indices(
            &model,
            &self.alchemical_components.state_a,
        );
        let factory = AlchemicalFactory::new();
        let mut alchemical_system = factory.create_alchemical_system(
            &system,
            AlchemicalRegion {
                alchemical_atoms: alchemical_indices.clone(),
            },
        );
        if self.leg_config.with_restraint {
            let (restraint, correction) = self.find_restraint(
                ctx,
                &model,
                &alchemical_system,
                &alchemical_indices,
            )?;
            info!(
                correction_kcal_mol = correction.value(),
                "restraint located, standard-state correction computed"
            );
            alchemical_system = alchemical_system.with_restraint(restraint, correction);
        }
        let standard_state_correction = alchemical_system.standard_state_correction;

        // === Phase 6: State ensemble ===
        let ensemble = create_state_ensemble(
            &alchemical_system,
            positions,
            &schedule,
            settings.thermo.temperature,
            settings.thermo.pressure,
        )?;

        // === Phase 7: Reporter and sampler ===
        let reporter = MultiStateReporter::new(
            unit_dir.join(&settings.output.output_filename),
            unit_dir.join(&settings.output.checkpoint_storage_filename),
            settings.output.checkpoint_interval,
        )?;
        let real_time_path = settings
            .output
            .real_time_analysis_filename
            .as_ref()
            .map(|name| unit_dir.join(name));

        let mut sampler = MultiStateSampler::create(
            alchemical_system,
            ensemble,
            settings.simulation.sampler.clone(),
            settings.integrator.clone(),
            settings.simulation.online_analysis.clone(),
            reporter,
            ContextCache::new(ctx.platform.clone()),
            ContextCache::new(ctx.platform.clone()),
            real_time_path,
            StdRng::from_entropy(),
        )?;

        if dry {
            sampler.complete_dry_run()?;
            return Ok(RunOutcome::DryRun(Box::new(sampler)));
        }

        // === Phase 8: Minimize, equilibrate, produce ===
        let mc_steps = settings.integrator.n_steps;
        let drive_result = drive_sampler(
            &mut sampler,
            settings.simulation.minimization_steps,
            equil_steps / mc_steps,
            prod_steps / mc_steps,
        );
        // Contexts are released on every exit path before analysis starts.
        sampler.release_contexts();
        drive_result?;

        // === Phase 9: Post-hoc analysis ===
        let outputs = self.analyze(&sampler, standard_state_correction)?;
        Ok(RunOutcome::Complete(Box::new(outputs)))
    }

    /// Short equilibration, restraint geometry search, and standard-state
    /// correction for the complex leg.
    fn find_restraint<P: ComputePlatform>(
        &self,
        ctx: &ExecutionContext<'_, P>,
        model: &StructuralModel,
        alchemical_system: &AlchemicalSystem,
        guest_indices: &[usize],
    ) -> Result<(BoreschRestraint, Energy), EngineError> {
        let restraint_settings = self.settings.restraint.as_ref().ok_or_else(|| {
            EngineError::Internal("restrained leg without restraint settings".to_string())
        })?;
        let equilibration = self.settings.equilibration.unwrap_or_default();

        // Equilibrate briefly at the fully coupled state to get sensible
        // restraint geometry coordinates.
        let steps = (equilibration.equilibration_length.as_femtoseconds()
            / self.settings.integrator.timestep.as_femtoseconds())
        .round() as usize;
        let coupled = ThermodynamicState::new(
            LambdaState::coupled(),
            self.settings.thermo.temperature,
            None,
        );
        let reference = Arc::new(ReferencePlatform::new());
        let mut cache = ContextCache::new(reference);
        let context = cache.get_or_create(0, alchemical_system, &self.settings.integrator)?;
        let mut state = SamplerState::new(model.positions.clone());
        let mut rng = StdRng::from_entropy();
        context.propagate(&coupled, &mut state, steps, &mut rng);
        cache.drain();

        let geometry = ctx.restraint_service.find_boresch_geometry(
            &model.topology,
            &state.positions,
            guest_indices,
        )?;
        let restraint =
            BoreschRestraint::from_settings(restraint_settings, geometry, "lambda_restraints")?;

        // A transient thermodynamic state carries the fully engaged
        // restraint just long enough to read off the correction.
        let transient = ThermodynamicState::new(
            LambdaState {
                electrostatics: 0.0,
                sterics: 0.0,
                restraints: 1.0,
            },
            self.settings.thermo.temperature,
            self.settings.thermo.pressure,
        );
        let correction = restraint.standard_state_correction(&transient);
        Ok((restraint, correction))
    }

    fn analyze<P: ComputePlatform>(
        &self,
        sampler: &MultiStateSampler<P>,
        standard_state_correction: Option<Energy>,
    ) -> Result<UnitOutput, EngineError> {
        let records = sampler.records();
        let n_states = self.settings.simulation.n_replicas;
        let temperature = self.settings.thermo.temperature;

        let full = MultiStateAnalyzer::from_records(records, n_states, temperature);
        let equilibration = full.equilibration()?;
        let production_records = &records[equilibration.n_equilibration..];

        let analyzer =
            MultiStateAnalyzer::from_records(production_records, n_states, temperature);
        let (unit_estimate, unit_estimate_error) = analyzer.free_energy()?;
        let unit_mbar_overlap = analyzer.overlap_matrix()?;

        // A failed forward/reverse analysis is an explicit gap, not an
        // error: too few samples in the smallest slice is expected for
        // short runs.
        let forward_and_reverse_energies = match analyzer.forward_reverse(production_records) {
            Ok(analysis) => Some(analysis),
            Err(error) => {
                warn!(unit = %self.name, error = %error, "forward/reverse analysis unavailable");
                None
            }
        };

        let replica_exchange_statistics = if sampler.is_replica_exchanging() {
            let states: Vec<Vec<usize>> =
                records.iter().map(|r| r.replica_states.clone()).collect();
            Some(replica_transition_statistics(&states, n_states)?)
        } else {
            None
        };

        Ok(UnitOutput {
            repeat_id: self.repeat_id,
            generation: self.generation,
            simtype: self.leg_config.leg,
            unit_estimate,
            unit_estimate_error,
            standard_state_correction,
            forward_and_reverse_energies,
            unit_mbar_overlap,
            replica_exchange_statistics,
            equilibration_iterations: equilibration.n_equilibration,
            production_iterations: equilibration.n_effective,
            nc: sampler.storage_path(),
            last_checkpoint: sampler.checkpoint_path(),
        })
    }
}

/// Executes a batch of units, one worker per unit.
///
/// Units share no mutable state, so with the `parallel` feature enabled
/// they run concurrently on the rayon thread pool.
#[cfg(feature = "parallel")]
pub fn execute_units<P: ComputePlatform>(
    units: &[ProtocolUnit],
    ctx: &ExecutionContext<'_, P>,
) -> Vec<ProtocolUnitResult> {
    use rayon::prelude::*;
    units.par_iter().map(|unit| unit.execute(ctx)).collect()
}

/// Executes a batch of units sequentially.
#[cfg(not(feature = "parallel"))]
pub fn execute_units<P: ComputePlatform>(
    units: &[ProtocolUnit],
    ctx: &ExecutionContext<'_, P>,
) -> Vec<ProtocolUnitResult> {
    units.iter().map(|unit| unit.execute(ctx)).collect()
}

fn drive_sampler<P: ComputePlatform>(
    sampler: &mut MultiStateSampler<P>,
    minimization_steps: usize,
    equil_iterations: usize,
    prod_iterations: usize,
) -> Result<(), EngineError> {
    sampler.minimize(minimization_steps)?;
    sampler.equilibrate(equil_iterations)?;
    sampler.extend(prod_iterations)?;
    Ok(())
}

/// Short fixed-iteration minimization on a CPU-bound context, guarding the
/// accelerated platforms against numerically unstable initial
/// configurations.
fn pre_minimize(
    system: &ParameterizedSystem,
    positions: Vec<Vector3<f64>>,
) -> Result<Vec<Vector3<f64>>, EngineError> {
    let factory = AlchemicalFactory::new();
    let plain = factory.create_alchemical_system(
        system,
        AlchemicalRegion {
            alchemical_atoms: Vec::new(),
        },
    );

    let reference = Arc::new(ReferencePlatform::new());
    let mut cache = ContextCache::new(reference);
    let context = cache.get_or_create(0, &plain, &IntegratorSettings::default())?;
    let mut state = SamplerState::new(positions);
    context.minimize(&mut state, PRE_MINIMIZE_ITERATIONS);
    cache.drain();
    Ok(state.positions)
}

fn render_error_chain(error: &EngineError) -> String {
    let mut rendered = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
