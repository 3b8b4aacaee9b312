//! The multi-state sampler driver.
//!
//! Owns the simulation lifecycle of one execution unit: context acquisition,
//! minimization, equilibration, production, and teardown. The driver is a
//! state machine; every public operation checks the current stage and moves
//! it forward, with `Failed` reachable from any point on an unrecoverable
//! numerical or resource error and `DryRunComplete` terminal for
//! validation-only runs.
//!
//! Three sampling strategies share the driver: Hamiltonian replica exchange,
//! self-adjusted mixture sampling, and independent per-state sampling. All
//! three share the online-analysis instrumentation that periodically
//! estimates the free energy from accumulated samples and allows early
//! termination once a target error is reached.

use super::alchemy::AlchemicalSystem;
use super::analysis::MultiStateAnalyzer;
use super::cache::ContextCache;
use super::config::{IntegratorSettings, OnlineAnalysisSettings, SamplerSettings, SamsSettings};
use super::error::EngineError;
use super::platform::{ComputeContext, ComputePlatform};
use super::reporter::{IterationRecord, MultiStateReporter};
use super::states::{SamplerState, StateEnsemble, ThermodynamicState};
use crate::core::units::{EnergyUnit, Temperature};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerStage {
    Uninitialized,
    Prepared,
    Minimized,
    Equilibrated,
    ProductionRunning,
    Complete,
    DryRunComplete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SamsAdaptation {
    BurnIn,
    Asymptotic { t0: usize },
}

/// One online-analysis entry appended to the real-time analysis file.
#[derive(Debug, Clone, Serialize)]
struct OnlineAnalysisRecord {
    iteration: usize,
    estimate_kcal_mol: f64,
    error_kcal_mol: f64,
}

pub struct MultiStateSampler<P: ComputePlatform> {
    stage: SamplerStage,
    strategy: SamplerSettings,
    system: AlchemicalSystem,
    integrator: IntegratorSettings,
    online: OnlineAnalysisSettings,
    temperature: Temperature,
    thermodynamic_states: Vec<ThermodynamicState>,
    sampler_states: Vec<SamplerState>,
    /// Thermodynamic state index occupied by each replica.
    replica_states: Vec<usize>,
    reporter: MultiStateReporter,
    energy_cache: ContextCache<P>,
    propagation_cache: ContextCache<P>,
    real_time_analysis_path: Option<PathBuf>,
    records: Vec<IterationRecord>,
    log_weights: Vec<f64>,
    sams_adaptation: SamsAdaptation,
    state_histogram: Vec<usize>,
    iteration: usize,
    rng: StdRng,
}

impl<P: ComputePlatform> MultiStateSampler<P> {
    /// Builds the sampler and allocates its compute contexts.
    ///
    /// On success the driver is in `Prepared`: the reporter file exists and
    /// both context caches hold a live context.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        system: AlchemicalSystem,
        ensemble: StateEnsemble,
        strategy: SamplerSettings,
        integrator: IntegratorSettings,
        online: OnlineAnalysisSettings,
        reporter: MultiStateReporter,
        mut energy_cache: ContextCache<P>,
        mut propagation_cache: ContextCache<P>,
        real_time_analysis_path: Option<PathBuf>,
        rng: StdRng,
    ) -> Result<Self, EngineError> {
        let n_replicas = ensemble.len();
        if n_replicas == 0 || ensemble.sampler_states.len() != n_replicas {
            return Err(EngineError::EnsembleMismatch {
                schedule: n_replicas,
                states: ensemble.sampler_states.len(),
            });
        }

        energy_cache.get_or_create(0, &system, &integrator)?;
        propagation_cache.get_or_create(0, &system, &integrator)?;

        let temperature = ensemble.thermodynamic_states[0].temperature;
        info!(
            n_replicas,
            strategy = ?strategy,
            platform = energy_cache.platform().name(),
            "multi-state sampler prepared"
        );

        Ok(Self {
            stage: SamplerStage::Prepared,
            strategy,
            system,
            integrator,
            online,
            temperature,
            thermodynamic_states: ensemble.thermodynamic_states,
            sampler_states: ensemble.sampler_states,
            replica_states: (0..n_replicas).collect(),
            reporter,
            energy_cache,
            propagation_cache,
            real_time_analysis_path,
            records: Vec::new(),
            log_weights: vec![0.0; n_replicas],
            sams_adaptation: SamsAdaptation::BurnIn,
            state_histogram: vec![0; n_replicas],
            iteration: 0,
            rng,
        })
    }

    pub fn stage(&self) -> SamplerStage {
        self.stage
    }

    pub fn n_replicas(&self) -> usize {
        self.replica_states.len()
    }

    pub fn replica_states(&self) -> &[usize] {
        &self.replica_states
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn iterations_run(&self) -> usize {
        self.iteration
    }

    pub fn storage_path(&self) -> PathBuf {
        self.reporter.storage_path().to_path_buf()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.reporter.checkpoint_path().to_path_buf()
    }

    pub fn is_replica_exchanging(&self) -> bool {
        !matches!(self.strategy, SamplerSettings::Independent)
    }

    fn expect_stage(&self, expected: SamplerStage) -> Result<(), EngineError> {
        if self.stage != expected {
            return Err(EngineError::InvalidStage {
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }

    /// Local energy minimization of every replica configuration.
    pub fn minimize(&mut self, max_iterations: usize) -> Result<(), EngineError> {
        self.expect_stage(SamplerStage::Prepared)?;

        let context = self
            .propagation_cache
            .get_or_create(0, &self.system, &self.integrator)?;
        for state in &mut self.sampler_states {
            context.minimize(state, max_iterations);
        }

        self.stage = SamplerStage::Minimized;
        debug!(max_iterations, "replica configurations minimized");
        Ok(())
    }

    /// Runs `n_iterations` equilibration iterations.
    pub fn equilibrate(&mut self, n_iterations: usize) -> Result<(), EngineError> {
        self.expect_stage(SamplerStage::Minimized)?;

        for _ in 0..n_iterations {
            self.run_iteration()?;
        }

        self.stage = SamplerStage::Equilibrated;
        info!(n_iterations, "equilibration finished");
        Ok(())
    }

    /// Runs up to `n_iterations` production iterations, with periodic
    /// online analysis and early termination on reaching the target error.
    pub fn extend(&mut self, n_iterations: usize) -> Result<(), EngineError> {
        self.expect_stage(SamplerStage::Equilibrated)?;
        self.stage = SamplerStage::ProductionRunning;

        let production_start = self.iteration;
        for _ in 0..n_iterations {
            self.run_iteration()?;

            let produced = self.iteration - production_start;
            if produced >= self.online.minimum_iterations
                && self.online.interval > 0
                && produced % self.online.interval == 0
                && self.online_analysis()?
            {
                info!(
                    iteration = self.iteration,
                    "online error target reached, terminating production early"
                );
                break;
            }
        }

        self.reporter
            .write_checkpoint(self.iteration, &self.replica_states, &self.sampler_states)?;
        self.reporter.close()?;
        self.stage = SamplerStage::Complete;
        info!(iterations = self.iteration, "production finished");
        Ok(())
    }

    /// Terminates a validation-only run: releases both context caches and
    /// deletes the storage files without sampling anything.
    pub fn complete_dry_run(&mut self) -> Result<(), EngineError> {
        self.expect_stage(SamplerStage::Prepared)?;
        self.reporter.close_and_delete()?;
        self.energy_cache.drain();
        self.propagation_cache.drain();
        self.stage = SamplerStage::DryRunComplete;
        info!("dry run complete, resources released");
        Ok(())
    }

    /// Releases both context caches. Idempotent; called on every exit path.
    pub fn release_contexts(&mut self) {
        self.energy_cache.drain();
        self.propagation_cache.drain();
    }

    fn run_iteration(&mut self) -> Result<(), EngineError> {
        match self.try_run_iteration() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.stage = SamplerStage::Failed;
                Err(error)
            }
        }
    }

    fn try_run_iteration(&mut self) -> Result<(), EngineError> {
        let n_replicas = self.n_replicas();

        // Propagate every replica at its current thermodynamic state, with
        // bounded restarts on numerical divergence.
        for replica in 0..n_replicas {
            self.propagate_replica(replica)?;
        }

        // Evaluate the full reduced-potential matrix.
        let context = self
            .energy_cache
            .get_or_create(0, &self.system, &self.integrator)?;
        let mut potentials = vec![vec![0.0; n_replicas]; n_replicas];
        for (replica, sampler_state) in self.sampler_states.iter().enumerate() {
            for (state_index, thermodynamic) in self.thermodynamic_states.iter().enumerate() {
                potentials[replica][state_index] =
                    context.reduced_potential(thermodynamic, sampler_state);
            }
        }

        match self.strategy.clone() {
            SamplerSettings::ReplicaExchange => self.attempt_replica_swaps(&potentials),
            SamplerSettings::Sams(ref sams) => self.update_sams(&potentials, sams),
            SamplerSettings::Independent => {}
        }

        self.iteration += 1;
        let record = IterationRecord {
            iteration: self.iteration,
            replica_states: self.replica_states.clone(),
            reduced_potentials: potentials,
        };
        self.reporter.write_iteration(&record)?;
        self.reporter
            .maybe_checkpoint(self.iteration, &self.replica_states, &self.sampler_states)?;
        self.records.push(record);
        Ok(())
    }

    fn propagate_replica(&mut self, replica: usize) -> Result<(), EngineError> {
        let thermodynamic = self.thermodynamic_states[self.replica_states[replica]].clone();
        let context = self
            .propagation_cache
            .get_or_create(0, &self.system, &self.integrator)?;

        let mut attempts = 0;
        loop {
            let energy = context.propagate(
                &thermodynamic,
                &mut self.sampler_states[replica],
                self.integrator.n_steps,
                &mut self.rng,
            );
            if energy.is_finite() {
                return Ok(());
            }

            attempts += 1;
            if attempts > self.integrator.n_restart_attempts {
                return Err(EngineError::NumericalInstability {
                    iteration: self.iteration,
                    attempts: attempts - 1,
                });
            }
            warn!(
                replica,
                attempt = attempts,
                "non-finite energy during propagation, reassigning velocities"
            );
            context.reassign_velocities(
                &mut self.sampler_states[replica],
                thermodynamic.temperature,
                &mut self.rng,
            );
        }
    }

    /// Metropolis swaps between replicas in adjacent lambda states.
    fn attempt_replica_swaps(&mut self, potentials: &[Vec<f64>]) {
        let n_states = self.thermodynamic_states.len();
        if n_states < 2 {
            return;
        }

        for _ in 0..self.n_replicas() {
            let state_i = self.rng.gen_range(0..n_states - 1);
            let state_j = state_i + 1;

            let replica_a = self.replica_states.iter().position(|&s| s == state_i);
            let replica_b = self.replica_states.iter().position(|&s| s == state_j);
            let (Some(a), Some(b)) = (replica_a, replica_b) else {
                continue;
            };

            let delta = (potentials[a][state_j] + potentials[b][state_i])
                - (potentials[a][state_i] + potentials[b][state_j]);
            if delta <= 0.0 || self.rng.r#gen::<f64>() < (-delta).exp() {
                self.replica_states[a] = state_j;
                self.replica_states[b] = state_i;
            }
        }
    }

    /// SAMS state jumps plus log-weight adaptation.
    fn update_sams(&mut self, potentials: &[Vec<f64>], sams: &SamsSettings) {
        let n_states = self.thermodynamic_states.len();
        if n_states < 2 {
            return;
        }

        for replica in 0..self.n_replicas() {
            let current = self.replica_states[replica];
            let proposal = if current == 0 {
                1
            } else if current == n_states - 1 {
                n_states - 2
            } else if self.rng.r#gen::<f64>() < 0.5 {
                current - 1
            } else {
                current + 1
            };

            let log_acceptance = -(potentials[replica][proposal]
                - potentials[replica][current])
                + (self.log_weights[current] - self.log_weights[proposal]);
            if log_acceptance >= 0.0 || self.rng.r#gen::<f64>() < log_acceptance.exp() {
                self.replica_states[replica] = proposal;
            }

            let visited = self.replica_states[replica];
            self.state_histogram[visited] += 1;

            let gamma = match self.sams_adaptation {
                SamsAdaptation::BurnIn => sams.gamma0,
                SamsAdaptation::Asymptotic { t0 } => {
                    sams.gamma0 / (self.iteration - t0 + 1) as f64
                }
            };
            self.log_weights[visited] -= gamma;
        }

        // Re-anchor the weights so they stay bounded.
        let min = self
            .log_weights
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        for w in &mut self.log_weights {
            *w -= min;
        }

        if self.sams_adaptation == SamsAdaptation::BurnIn && self.histogram_is_flat(sams) {
            debug!(
                iteration = self.iteration,
                "visit histogram flat, switching to asymptotic gain schedule"
            );
            self.sams_adaptation = SamsAdaptation::Asymptotic { t0: self.iteration };
        }
    }

    fn histogram_is_flat(&self, sams: &SamsSettings) -> bool {
        let total: usize = self.state_histogram.iter().sum();
        if total < self.state_histogram.len() * 10 {
            return false;
        }
        let target = 1.0 / self.state_histogram.len() as f64;
        self.state_histogram.iter().all(|&count| {
            let fraction = count as f64 / total as f64;
            (fraction - target).abs() <= sams.flatness_criterion * target
        })
    }

    /// Runs the shared online analysis; returns true when the estimated
    /// error has reached the configured target.
    fn online_analysis(&mut self) -> Result<bool, EngineError> {
        let analyzer = MultiStateAnalyzer::from_records(
            &self.records,
            self.thermodynamic_states.len(),
            self.temperature,
        );
        let (estimate, error) = match analyzer.free_energy() {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "online analysis skipped");
                return Ok(false);
            }
        };

        if let Some(path) = &self.real_time_analysis_path {
            let record = OnlineAnalysisRecord {
                iteration: self.iteration,
                estimate_kcal_mol: estimate.value_in(EnergyUnit::KilocaloriePerMole),
                error_kcal_mol: error.value_in(EnergyUnit::KilocaloriePerMole),
            };
            MultiStateReporter::append_json_line(path, &record)?;
        }

        match self.online.target_error {
            Some(target) => Ok(error.value_in(EnergyUnit::KilocaloriePerMole)
                <= target.value_in(EnergyUnit::KilocaloriePerMole)),
            None => Ok(false),
        }
    }
}
