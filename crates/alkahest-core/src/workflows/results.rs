//! Grouping and statistical reduction of unit results.
//!
//! `gather` output lives here: per leg of the thermodynamic cycle, repeats
//! keyed by their identifier, each holding the per-generation unit outputs
//! in ascending order. All statistical reducers are read-only views over
//! that structure; failed units never enter the statistics but stay
//! inspectable.

use super::unit::{FailedUnit, ProtocolUnitResult, UnitOutput};
use crate::core::units::{Energy, EnergyUnit};
use crate::engine::analysis::{
    AnalysisError, ForwardReverseAnalysis, OverlapMatrix, TransitionStatistics,
};
use crate::engine::error::EngineError;
use crate::engine::reporter::MultiStateReporter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

/// One leg of the thermodynamic cycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Leg {
    Complex,
    Solvent,
    Vacuum,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Leg::Complex => "complex",
            Leg::Solvent => "solvent",
            Leg::Vacuum => "vacuum",
        };
        f.write_str(s)
    }
}

/// Which thermodynamic cycle the grouped results belong to, fixing the
/// combination formula and the set of active legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThermodynamicCycle {
    Binding,
    Solvation,
}

impl ThermodynamicCycle {
    pub fn active_legs(&self) -> &'static [Leg] {
        match self {
            ThermodynamicCycle::Binding => &[Leg::Complex, Leg::Solvent],
            ThermodynamicCycle::Solvation => &[Leg::Solvent, Leg::Vacuum],
        }
    }
}

/// A value per leg of the cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerLeg<T> {
    pub complex: T,
    pub solvent: T,
    pub vacuum: T,
}

impl<T> PerLeg<T> {
    pub fn get(&self, leg: Leg) -> &T {
        match leg {
            Leg::Complex => &self.complex,
            Leg::Solvent => &self.solvent,
            Leg::Vacuum => &self.vacuum,
        }
    }

    pub fn get_mut(&mut self, leg: Leg) -> &mut T {
        match leg {
            Leg::Complex => &mut self.complex,
            Leg::Solvent => &mut self.solvent,
            Leg::Vacuum => &mut self.vacuum,
        }
    }
}

/// The grouped results of one leg.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegResults {
    /// Per-generation unit outputs of each repeat, ascending by generation.
    pub repeats: BTreeMap<Uuid, Vec<UnitOutput>>,
    pub failures: Vec<FailedUnit>,
}

impl LegResults {
    /// The generation-0 output of each repeat, in repeat-id order.
    fn first_generations(&self) -> impl Iterator<Item = &UnitOutput> {
        self.repeats.values().filter_map(|outputs| outputs.first())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndividualEstimates {
    /// (estimate, estimator uncertainty) per repeat, per active leg.
    pub legs: BTreeMap<Leg, Vec<(Energy, Energy)>>,
    /// Standard-state correction per complex repeat (binding only).
    pub standard_state: Vec<Energy>,
}

/// Per-leg success/failure counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegSummary {
    pub leg: Leg,
    pub completed: usize,
    pub failed: usize,
}

/// The aggregated result of a multi-repeat, multi-leg calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolResult {
    cycle: ThermodynamicCycle,
    data: PerLeg<LegResults>,
}

impl ProtocolResult {
    /// Groups a flat unit result stream by leg, repeat, and generation.
    ///
    /// Failed units are recorded but excluded from grouping; stitching of
    /// more than two generations per repeat is not supported.
    pub fn from_unit_results(
        cycle: ThermodynamicCycle,
        unit_results: impl IntoIterator<Item = ProtocolUnitResult>,
    ) -> Result<Self, EngineError> {
        let mut data = PerLeg::<LegResults>::default();

        for result in unit_results {
            match result {
                ProtocolUnitResult::Complete(output) => {
                    data.get_mut(output.simtype)
                        .repeats
                        .entry(output.repeat_id)
                        .or_default()
                        .push(output);
                }
                ProtocolUnitResult::Failed(failure) => {
                    data.get_mut(failure.simtype).failures.push(failure);
                }
            }
        }

        for leg in [Leg::Complex, Leg::Solvent, Leg::Vacuum] {
            for outputs in data.get_mut(leg).repeats.values_mut() {
                outputs.sort_by_key(|o| o.generation);
                if outputs.len() > 2 {
                    return Err(EngineError::not_implemented(
                        "stitching together more than two generations",
                    ));
                }
            }
        }

        Ok(Self { cycle, data })
    }

    pub fn cycle(&self) -> ThermodynamicCycle {
        self.cycle
    }

    pub fn leg(&self, leg: Leg) -> &LegResults {
        self.data.get(leg)
    }

    /// Per-leg success and failure counts.
    pub fn leg_summaries(&self) -> Vec<LegSummary> {
        self.cycle
            .active_legs()
            .iter()
            .map(|&leg| {
                let results = self.data.get(leg);
                LegSummary {
                    leg,
                    completed: results.repeats.values().map(Vec::len).sum(),
                    failed: results.failures.len(),
                }
            })
            .collect()
    }

    /// The individual free-energy estimates of every repeat.
    pub fn get_individual_estimates(&self) -> IndividualEstimates {
        let mut legs = BTreeMap::new();
        for &leg in self.cycle.active_legs() {
            let estimates: Vec<(Energy, Energy)> = self
                .data
                .get(leg)
                .first_generations()
                .map(|o| (o.unit_estimate, o.unit_estimate_error))
                .collect();
            legs.insert(leg, estimates);
        }

        let standard_state = match self.cycle {
            ThermodynamicCycle::Binding => self
                .data
                .get(Leg::Complex)
                .first_generations()
                .map(|o| {
                    o.standard_state_correction.unwrap_or_else(|| {
                        warn!(
                            repeat_id = %o.repeat_id,
                            "complex repeat carries no standard-state correction, assuming zero"
                        );
                        Energy::kcal_per_mol(0.0)
                    })
                })
                .collect(),
            ThermodynamicCycle::Solvation => Vec::new(),
        };

        IndividualEstimates {
            legs,
            standard_state,
        }
    }

    /// The combined free-energy estimate over the thermodynamic cycle.
    ///
    /// Binding: `dG_bind = -dG_complex + dG_solvent + dG_standard_state`.
    /// Solvation: `dG_solv = dG_vacuum - dG_solvent`.
    /// Per-leg values are averaged across repeats in a common unit.
    pub fn get_estimate(&self) -> Result<Energy, EngineError> {
        let estimates = self.get_individual_estimates();
        let leg_mean = |leg: Leg| -> Result<f64, EngineError> {
            let values = values_in_kcal(&estimates.legs[&leg]);
            mean(&values).ok_or_else(|| AnalysisError::NoSamples.into())
        };

        let total = match self.cycle {
            ThermodynamicCycle::Binding => {
                let standard_state: Vec<f64> = estimates
                    .standard_state
                    .iter()
                    .map(|e| e.value_in(EnergyUnit::KilocaloriePerMole))
                    .collect();
                -leg_mean(Leg::Complex)?
                    + leg_mean(Leg::Solvent)?
                    + mean(&standard_state).ok_or(AnalysisError::NoSamples)?
            }
            ThermodynamicCycle::Solvation => leg_mean(Leg::Vacuum)? - leg_mean(Leg::Solvent)?,
        };
        Ok(Energy::kcal_per_mol(total))
    }

    /// The combined uncertainty: root-sum-square of the per-leg standard
    /// deviations across repeats, under the independent-error assumption.
    /// A leg with a single repeat contributes its estimator error instead.
    pub fn get_uncertainty(&self) -> Result<Energy, EngineError> {
        let estimates = self.get_individual_estimates();
        let leg_spread = |leg: Leg| -> Result<f64, EngineError> {
            let entries = &estimates.legs[&leg];
            if entries.is_empty() {
                return Err(AnalysisError::NoSamples.into());
            }
            if entries.len() == 1 {
                return Ok(entries[0].1.value_in(EnergyUnit::KilocaloriePerMole));
            }
            Ok(std_dev(&values_in_kcal(entries)))
        };

        let mut sum_of_squares = 0.0;
        for &leg in self.cycle.active_legs() {
            sum_of_squares += leg_spread(leg)?.powi(2);
        }
        if self.cycle == ThermodynamicCycle::Binding {
            let standard_state: Vec<f64> = estimates
                .standard_state
                .iter()
                .map(|e| e.value_in(EnergyUnit::KilocaloriePerMole))
                .collect();
            if standard_state.is_empty() {
                return Err(AnalysisError::NoSamples.into());
            }
            let spread = if standard_state.len() == 1 {
                0.0
            } else {
                std_dev(&standard_state)
            };
            sum_of_squares += spread.powi(2);
        }
        Ok(Energy::kcal_per_mol(sum_of_squares.sqrt()))
    }

    /// The forward/reverse convergence analysis of every repeat.
    ///
    /// Entries where the analysis could not be carried out stay in place as
    /// `None`; one warning per affected leg is emitted.
    pub fn get_forward_and_reverse_energy_analysis(
        &self,
    ) -> BTreeMap<Leg, Vec<Option<ForwardReverseAnalysis>>> {
        let mut result = BTreeMap::new();
        for &leg in self.cycle.active_legs() {
            let entries: Vec<Option<ForwardReverseAnalysis>> = self
                .data
                .get(leg)
                .first_generations()
                .map(|o| o.forward_and_reverse_energies.clone())
                .collect();
            if entries.iter().any(Option::is_none) {
                warn!(
                    leg = %leg,
                    "one or more repeats have no forward/reverse analysis, likely from \
                     estimator convergence failure on too few samples"
                );
            }
            result.insert(leg, entries);
        }
        result
    }

    /// The state overlap matrices of every repeat.
    pub fn get_overlap_matrices(&self) -> BTreeMap<Leg, Vec<OverlapMatrix>> {
        self.cycle
            .active_legs()
            .iter()
            .map(|&leg| {
                let matrices = self
                    .data
                    .get(leg)
                    .first_generations()
                    .map(|o| o.unit_mbar_overlap.clone())
                    .collect();
                (leg, matrices)
            })
            .collect()
    }

    /// The replica state-transition statistics of every repeat.
    ///
    /// Only available when a replica-exchanging strategy ran.
    pub fn get_replica_transition_statistics(
        &self,
    ) -> Result<BTreeMap<Leg, Vec<TransitionStatistics>>, EngineError> {
        let mut result = BTreeMap::new();
        for &leg in self.cycle.active_legs() {
            let stats: Option<Vec<TransitionStatistics>> = self
                .data
                .get(leg)
                .first_generations()
                .map(|o| o.replica_exchange_statistics.clone())
                .collect();
            match stats {
                Some(stats) => {
                    result.insert(leg, stats);
                }
                None => return Err(AnalysisError::ReplicaStatisticsUnavailable.into()),
            }
        }
        Ok(result)
    }

    /// The replica-state timeseries of every repeat, read back from the
    /// storage files.
    pub fn get_replica_states(
        &self,
    ) -> Result<BTreeMap<Leg, Vec<Vec<Vec<usize>>>>, EngineError> {
        let mut result = BTreeMap::new();
        for &leg in self.cycle.active_legs() {
            let mut timeseries = Vec::new();
            for output in self.data.get(leg).first_generations() {
                timeseries.push(MultiStateReporter::read_replica_thermodynamic_states(
                    &output.nc,
                )?);
            }
            result.insert(leg, timeseries);
        }
        Ok(result)
    }

    pub fn equilibration_iterations(&self) -> BTreeMap<Leg, Vec<usize>> {
        self.per_leg_metric(|o| o.equilibration_iterations)
    }

    pub fn production_iterations(&self) -> BTreeMap<Leg, Vec<usize>> {
        self.per_leg_metric(|o| o.production_iterations)
    }

    fn per_leg_metric<T>(&self, metric: impl Fn(&UnitOutput) -> T) -> BTreeMap<Leg, Vec<T>> {
        self.cycle
            .active_legs()
            .iter()
            .map(|&leg| {
                let values = self.data.get(leg).first_generations().map(&metric).collect();
                (leg, values)
            })
            .collect()
    }
}

fn values_in_kcal(estimates: &[(Energy, Energy)]) -> Vec<f64> {
    estimates
        .iter()
        .map(|(value, _)| value.value_in(EnergyUnit::KilocaloriePerMole))
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation across repeats.
fn std_dev(values: &[f64]) -> f64 {
    let Some(mean) = mean(values) else {
        return 0.0;
    };
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::{span, Event, Level, Metadata};

    fn overlap() -> OverlapMatrix {
        OverlapMatrix {
            matrix: vec![vec![0.9, 0.1], vec![0.1, 0.9]],
            eigenvalues: vec![1.0, 0.8],
            scalar: 0.2,
        }
    }

    fn forward_reverse() -> ForwardReverseAnalysis {
        ForwardReverseAnalysis {
            fractions: vec![0.5, 1.0],
            forward_dgs: vec![Energy::kcal_per_mol(1.0); 2],
            forward_ddgs: vec![Energy::kcal_per_mol(0.1); 2],
            reverse_dgs: vec![Energy::kcal_per_mol(1.0); 2],
            reverse_ddgs: vec![Energy::kcal_per_mol(0.1); 2],
        }
    }

    fn output(
        leg: Leg,
        estimate: f64,
        error: f64,
        standard_state: Option<f64>,
        with_forward_reverse: bool,
    ) -> UnitOutput {
        UnitOutput {
            repeat_id: Uuid::new_v4(),
            generation: 0,
            simtype: leg,
            unit_estimate: Energy::kcal_per_mol(estimate),
            unit_estimate_error: Energy::kcal_per_mol(error),
            standard_state_correction: standard_state.map(Energy::kcal_per_mol),
            forward_and_reverse_energies: with_forward_reverse.then(forward_reverse),
            unit_mbar_overlap: overlap(),
            replica_exchange_statistics: Some(TransitionStatistics {
                matrix: vec![vec![0.8, 0.2], vec![0.2, 0.8]],
                eigenvalues: vec![1.0, 0.6],
            }),
            equilibration_iterations: 100,
            production_iterations: 900,
            nc: std::path::PathBuf::from("unit/leg.nc"),
            last_checkpoint: std::path::PathBuf::from("unit/leg_checkpoint.nc"),
        }
    }

    /// Two repeats per leg chosen so the leg means are -10, -2, and 1 with
    /// population standard deviations 0.5, 0.2, and 0.1.
    fn binding_results() -> Vec<ProtocolUnitResult> {
        vec![
            ProtocolUnitResult::Complete(output(Leg::Complex, -10.5, 0.3, Some(1.1), true)),
            ProtocolUnitResult::Complete(output(Leg::Complex, -9.5, 0.3, Some(0.9), true)),
            ProtocolUnitResult::Complete(output(Leg::Solvent, -2.2, 0.2, None, true)),
            ProtocolUnitResult::Complete(output(Leg::Solvent, -1.8, 0.2, None, true)),
        ]
    }

    fn gather_binding(results: Vec<ProtocolUnitResult>) -> ProtocolResult {
        ProtocolResult::from_unit_results(ThermodynamicCycle::Binding, results).unwrap()
    }

    #[test]
    fn binding_estimate_combines_the_cycle_legs() {
        let result = gather_binding(binding_results());
        let estimate = result.get_estimate().unwrap();
        assert!((estimate.value() - 9.0).abs() < 1e-12, "got {}", estimate.value());
    }

    #[test]
    fn binding_uncertainty_is_the_root_sum_square_of_leg_spreads() {
        let result = gather_binding(binding_results());
        let uncertainty = result.get_uncertainty().unwrap();
        let expected = (0.5f64.powi(2) + 0.2f64.powi(2) + 0.1f64.powi(2)).sqrt();
        assert!((uncertainty.value() - expected).abs() < 1e-12);
        assert!((uncertainty.value() - 0.5477).abs() < 1e-3);
    }

    #[test]
    fn solvation_estimate_subtracts_the_solvent_leg() {
        let results = vec![
            ProtocolUnitResult::Complete(output(Leg::Vacuum, 3.0, 0.1, None, true)),
            ProtocolUnitResult::Complete(output(Leg::Solvent, 1.0, 0.1, None, true)),
        ];
        let result =
            ProtocolResult::from_unit_results(ThermodynamicCycle::Solvation, results).unwrap();
        assert!((result.get_estimate().unwrap().value() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn single_repeat_legs_fall_back_to_the_estimator_error() {
        let results = vec![
            ProtocolUnitResult::Complete(output(Leg::Vacuum, 3.0, 0.3, None, true)),
            ProtocolUnitResult::Complete(output(Leg::Solvent, 1.0, 0.4, None, true)),
        ];
        let result =
            ProtocolResult::from_unit_results(ThermodynamicCycle::Solvation, results).unwrap();
        let uncertainty = result.get_uncertainty().unwrap();
        assert!((uncertainty.value() - (0.09f64 + 0.16).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn unit_conversion_happens_before_combination() {
        let mut kj_output = output(Leg::Solvent, 0.0, 0.1, None, true);
        kj_output.unit_estimate = Energy::kj_per_mol(4.184);
        let results = vec![
            ProtocolUnitResult::Complete(output(Leg::Vacuum, 3.0, 0.1, None, true)),
            ProtocolUnitResult::Complete(kj_output),
        ];
        let result =
            ProtocolResult::from_unit_results(ThermodynamicCycle::Solvation, results).unwrap();
        assert!((result.get_estimate().unwrap().value() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn gather_is_idempotent() {
        let first = gather_binding(binding_results());
        let second = gather_binding(binding_results());
        // Fresh repeat ids differ between the two streams, so compare the
        // reduced values instead of the raw structure.
        assert_eq!(
            first.get_estimate().unwrap(),
            second.get_estimate().unwrap()
        );

        let results = binding_results();
        let once =
            ProtocolResult::from_unit_results(ThermodynamicCycle::Binding, results.clone())
                .unwrap();
        let twice =
            ProtocolResult::from_unit_results(ThermodynamicCycle::Binding, results).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn failed_units_are_skipped_but_kept_inspectable() {
        let mut results = binding_results();
        results.push(ProtocolUnitResult::Failed(FailedUnit {
            repeat_id: Uuid::new_v4(),
            generation: 0,
            simtype: Leg::Complex,
            error: "Non-finite energy during propagation".to_string(),
        }));

        let result = gather_binding(results);
        let summaries = result.leg_summaries();
        let complex = summaries.iter().find(|s| s.leg == Leg::Complex).unwrap();
        assert_eq!(complex.completed, 2);
        assert_eq!(complex.failed, 1);
        assert!(result.leg(Leg::Complex).failures[0]
            .error
            .contains("Non-finite"));

        // The failure does not disturb the statistics.
        assert!((result.get_estimate().unwrap().value() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn more_than_two_generations_per_repeat_is_not_implemented() {
        let repeat_id = Uuid::new_v4();
        let results: Vec<ProtocolUnitResult> = (0..3)
            .map(|generation| {
                let mut o = output(Leg::Solvent, -2.0, 0.2, None, true);
                o.repeat_id = repeat_id;
                o.generation = generation;
                ProtocolUnitResult::Complete(o)
            })
            .collect();

        let result = ProtocolResult::from_unit_results(ThermodynamicCycle::Solvation, results);
        assert!(matches!(result, Err(EngineError::NotImplemented { .. })));
    }

    #[test]
    fn transition_statistics_error_when_repex_did_not_run() {
        let mut independent = output(Leg::Solvent, -2.0, 0.2, None, true);
        independent.replica_exchange_statistics = None;
        let results = vec![
            ProtocolUnitResult::Complete(output(Leg::Vacuum, 3.0, 0.1, None, true)),
            ProtocolUnitResult::Complete(independent),
        ];
        let result =
            ProtocolResult::from_unit_results(ThermodynamicCycle::Solvation, results).unwrap();
        assert!(matches!(
            result.get_replica_transition_statistics(),
            Err(EngineError::Analysis {
                source: AnalysisError::ReplicaStatisticsUnavailable
            })
        ));
    }

    struct WarnCounter {
        warnings: Arc<AtomicUsize>,
    }

    impl tracing::Subscriber for WarnCounter {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }
        fn new_span(&self, _span: &span::Attributes<'_>) -> span::Id {
            span::Id::from_u64(1)
        }
        fn record(&self, _span: &span::Id, _values: &span::Record<'_>) {}
        fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}
        fn event(&self, event: &Event<'_>) {
            if *event.metadata().level() == Level::WARN {
                self.warnings.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn enter(&self, _span: &span::Id) {}
        fn exit(&self, _span: &span::Id) {}
    }

    #[test]
    fn missing_forward_reverse_entries_are_preserved_with_one_warning_per_leg() {
        let results = vec![
            ProtocolUnitResult::Complete(output(Leg::Complex, -10.5, 0.3, Some(1.0), false)),
            ProtocolUnitResult::Complete(output(Leg::Complex, -9.5, 0.3, Some(1.0), false)),
            ProtocolUnitResult::Complete(output(Leg::Solvent, -2.0, 0.2, None, true)),
            ProtocolUnitResult::Complete(output(Leg::Solvent, -1.8, 0.2, None, true)),
        ];
        let result = gather_binding(results);

        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = WarnCounter {
            warnings: warnings.clone(),
        };
        let analysis = tracing::subscriber::with_default(subscriber, || {
            result.get_forward_and_reverse_energy_analysis()
        });

        // Both complex entries are explicit gaps; the solvent leg is
        // complete.
        assert_eq!(analysis[&Leg::Complex], vec![None, None]);
        assert!(analysis[&Leg::Solvent].iter().all(Option::is_some));
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlap_and_iteration_metrics_cover_all_active_legs() {
        let result = gather_binding(binding_results());

        let overlaps = result.get_overlap_matrices();
        assert_eq!(overlaps[&Leg::Complex].len(), 2);
        assert_eq!(overlaps[&Leg::Solvent].len(), 2);

        let equil = result.equilibration_iterations();
        assert_eq!(equil[&Leg::Complex], vec![100, 100]);
        let prod = result.production_iterations();
        assert_eq!(prod[&Leg::Solvent], vec![900, 900]);
    }
}
