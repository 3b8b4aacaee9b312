//! Multi-state statistical estimators.
//!
//! Free energies are estimated from the stored reduced-potential matrices
//! with the Bennett acceptance ratio applied over adjacent lambda windows,
//! with uncertainties from the asymptotic variance of each pair. The module
//! also provides the pairwise state overlap matrix, forward/reverse
//! convergence analysis, automatic equilibration detection, and replica
//! state-transition statistics.

use super::reporter::IterationRecord;
use crate::core::units::{Energy, Temperature};
use itertools::Itertools;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum samples per state before an estimator is attempted.
const MIN_SAMPLES_PER_STATE: usize = 5;

const BAR_BRACKET: f64 = 500.0;
const BAR_ITERATIONS: usize = 200;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("No samples available for analysis")]
    NoSamples,

    #[error(
        "Insufficient samples for state {state}: {actual} collected, at least {required} required"
    )]
    InsufficientSamples {
        state: usize,
        required: usize,
        actual: usize,
    },

    #[error("Timeseries is empty, cannot detect equilibration")]
    EmptyTimeseries,

    #[error("Replica exchange statistics were not found, did you run a repex calculation?")]
    ReplicaStatisticsUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapMatrix {
    /// Estimated probability of observing a sample from state i in state j.
    pub matrix: Vec<Vec<f64>>,
    /// Eigenvalues of the overlap matrix, sorted descending.
    pub eigenvalues: Vec<f64>,
    /// One minus the largest nontrivial eigenvalue.
    pub scalar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardReverseAnalysis {
    pub fractions: Vec<f64>,
    pub forward_dgs: Vec<Energy>,
    pub forward_ddgs: Vec<Energy>,
    pub reverse_dgs: Vec<Energy>,
    pub reverse_ddgs: Vec<Energy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionStatistics {
    /// Row-stochastic estimate of a replica moving from state i to state j.
    pub matrix: Vec<Vec<f64>>,
    /// Eigenvalues of the transition matrix, sorted descending.
    pub eigenvalues: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquilibrationResult {
    /// Iterations to discard as equilibration.
    pub n_equilibration: usize,
    /// Statistical inefficiency of the equilibrated region.
    pub statistical_inefficiency: f64,
    /// Number of effectively uncorrelated samples.
    pub n_effective: usize,
}

/// Estimator over the reduced potentials accumulated by a multi-state run.
#[derive(Debug, Clone)]
pub struct MultiStateAnalyzer {
    n_states: usize,
    temperature: Temperature,
    /// Samples grouped by origin state; each sample is the reduced
    /// potential of one configuration evaluated in every state.
    samples: Vec<Vec<Vec<f64>>>,
    /// Total reduced potential per iteration, for equilibration detection.
    potential_timeseries: Vec<f64>,
}

impl MultiStateAnalyzer {
    pub fn from_records(
        records: &[IterationRecord],
        n_states: usize,
        temperature: Temperature,
    ) -> Self {
        let mut samples = vec![Vec::new(); n_states];
        let mut potential_timeseries = Vec::with_capacity(records.len());

        for record in records {
            let mut total = 0.0;
            for (replica, &state) in record.replica_states.iter().enumerate() {
                let row = &record.reduced_potentials[replica];
                total += row[state];
                samples[state].push(row.clone());
            }
            potential_timeseries.push(total);
        }

        Self {
            n_states,
            temperature,
            samples,
            potential_timeseries,
        }
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_samples(&self, state: usize) -> usize {
        self.samples[state].len()
    }

    /// End-to-end decoupling free energy and its uncertainty.
    pub fn free_energy(&self) -> Result<(Energy, Energy), AnalysisError> {
        let (delta_f, variance) = self.free_energy_reduced()?;
        let kt = self.temperature.kt();
        Ok((
            Energy::kcal_per_mol(delta_f * kt.value()),
            Energy::kcal_per_mol(variance.sqrt() * kt.value()),
        ))
    }

    /// Free energy over the window chain in reduced units, with its total
    /// variance.
    fn free_energy_reduced(&self) -> Result<(f64, f64), AnalysisError> {
        let mut total = 0.0;
        let mut variance = 0.0;
        for pair in self.pairwise_free_energies()? {
            total += pair.0;
            variance += pair.1;
        }
        Ok((total, variance))
    }

    /// Per-adjacent-pair (delta f, variance) in reduced units.
    fn pairwise_free_energies(&self) -> Result<Vec<(f64, f64)>, AnalysisError> {
        if self.n_states < 2 {
            return Err(AnalysisError::NoSamples);
        }
        for (state, samples) in self.samples.iter().enumerate() {
            if samples.len() < MIN_SAMPLES_PER_STATE {
                return Err(AnalysisError::InsufficientSamples {
                    state,
                    required: MIN_SAMPLES_PER_STATE,
                    actual: samples.len(),
                });
            }
        }

        (0..self.n_states - 1)
            .map(|k| {
                let forward: Vec<f64> = self.samples[k]
                    .iter()
                    .map(|row| row[k + 1] - row[k])
                    .collect();
                let reverse: Vec<f64> = self.samples[k + 1]
                    .iter()
                    .map(|row| row[k] - row[k + 1])
                    .collect();
                bennett_acceptance_ratio(&forward, &reverse)
            })
            .collect()
    }

    /// Cumulative reduced free energies per state, anchored at zero.
    fn state_free_energies(&self) -> Result<Vec<f64>, AnalysisError> {
        let mut f = vec![0.0; self.n_states];
        for (k, pair) in self.pairwise_free_energies()?.iter().enumerate() {
            f[k + 1] = f[k] + pair.0;
        }
        Ok(f)
    }

    /// MBAR-style pairwise state overlap.
    pub fn overlap_matrix(&self) -> Result<OverlapMatrix, AnalysisError> {
        let f = self.state_free_energies()?;
        let counts: Vec<f64> = self.samples.iter().map(|s| s.len() as f64).collect();

        let mut matrix = vec![vec![0.0; self.n_states]; self.n_states];
        for samples in &self.samples {
            for row in samples {
                // log of the mixture-normalized weight denominator.
                let terms: Vec<f64> = (0..self.n_states)
                    .map(|l| counts[l].ln() + f[l] - row[l])
                    .collect();
                let log_denominator = log_sum_exp(&terms);

                let weights: Vec<f64> = (0..self.n_states)
                    .map(|l| (f[l] - row[l] - log_denominator).exp())
                    .collect();
                for i in 0..self.n_states {
                    for j in 0..self.n_states {
                        matrix[i][j] += counts[j] * weights[i] * weights[j];
                    }
                }
            }
        }

        let eigenvalues = sorted_real_eigenvalues(&matrix);
        let scalar = if eigenvalues.len() > 1 {
            1.0 - eigenvalues[1]
        } else {
            1.0
        };

        Ok(OverlapMatrix {
            matrix,
            eigenvalues,
            scalar,
        })
    }

    /// Free-energy estimates over increasing data fractions from both
    /// trajectory ends.
    pub fn forward_reverse(
        &self,
        records: &[IterationRecord],
    ) -> Result<ForwardReverseAnalysis, AnalysisError> {
        let n = records.len();
        if n == 0 {
            return Err(AnalysisError::NoSamples);
        }

        let fractions: Vec<f64> = (1..=10).map(|i| i as f64 / 10.0).collect();
        let mut forward_dgs = Vec::new();
        let mut forward_ddgs = Vec::new();
        let mut reverse_dgs = Vec::new();
        let mut reverse_ddgs = Vec::new();

        for &fraction in &fractions {
            let take = ((n as f64 * fraction).ceil() as usize).max(1);

            let forward =
                Self::from_records(&records[..take], self.n_states, self.temperature)
                    .free_energy()?;
            forward_dgs.push(forward.0);
            forward_ddgs.push(forward.1);

            let reverse =
                Self::from_records(&records[n - take..], self.n_states, self.temperature)
                    .free_energy()?;
            reverse_dgs.push(reverse.0);
            reverse_ddgs.push(reverse.1);
        }

        Ok(ForwardReverseAnalysis {
            fractions,
            forward_dgs,
            forward_ddgs,
            reverse_dgs,
            reverse_ddgs,
        })
    }

    /// Detects the equilibrated region of the potential timeseries.
    pub fn equilibration(&self) -> Result<EquilibrationResult, AnalysisError> {
        detect_equilibration(&self.potential_timeseries)
    }
}

/// Bennett acceptance ratio for one window pair, in reduced units.
///
/// Solved by bisection; the objective is monotone in the free-energy
/// difference. Returns (delta f, asymptotic variance).
fn bennett_acceptance_ratio(
    forward_work: &[f64],
    reverse_work: &[f64],
) -> Result<(f64, f64), AnalysisError> {
    if forward_work.is_empty() || reverse_work.is_empty() {
        return Err(AnalysisError::NoSamples);
    }

    let n_f = forward_work.len() as f64;
    let n_r = reverse_work.len() as f64;
    let m = (n_f / n_r).ln();

    let fermi = |x: f64| 1.0 / (1.0 + x.exp());
    let objective = |delta_f: f64| {
        let forward: f64 = forward_work.iter().map(|&w| fermi(m + w - delta_f)).sum();
        let reverse: f64 = reverse_work.iter().map(|&w| fermi(-m + w + delta_f)).sum();
        forward - reverse
    };

    let mut low = -BAR_BRACKET;
    let mut high = BAR_BRACKET;
    for _ in 0..BAR_ITERATIONS {
        let mid = 0.5 * (low + high);
        // The objective is monotone increasing in delta_f.
        if objective(mid) < 0.0 {
            low = mid;
        } else {
            high = mid;
        }
    }
    let delta_f = 0.5 * (low + high);

    // Fermi terms evaluated at the solution: sign +1 selects the forward
    // form f(M + w - dF), sign -1 the reverse form f(-M + w + dF).
    let relative_variance = |work: &[f64], sign: f64| {
        let values: Vec<f64> = work
            .iter()
            .map(|&w| fermi(sign * (m - delta_f) + w))
            .collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let mean_sq = values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64;
        if mean <= 0.0 {
            return f64::INFINITY;
        }
        (mean_sq / (mean * mean) - 1.0) / values.len() as f64
    };

    let variance = relative_variance(forward_work, 1.0) + relative_variance(reverse_work, -1.0);
    Ok((delta_f, variance.max(0.0)))
}

/// Statistical inefficiency of a timeseries from its integrated
/// autocorrelation.
pub fn statistical_inefficiency(timeseries: &[f64]) -> f64 {
    let n = timeseries.len();
    if n < 3 {
        return 1.0;
    }
    let mean = timeseries.iter().sum::<f64>() / n as f64;
    let variance = timeseries.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if variance <= f64::EPSILON {
        return 1.0;
    }

    let mut g = 1.0;
    for t in 1..n - 1 {
        let c: f64 = (0..n - t)
            .map(|i| (timeseries[i] - mean) * (timeseries[i + t] - mean))
            .sum::<f64>()
            / ((n - t) as f64 * variance);
        if c <= 0.0 {
            break;
        }
        g += 2.0 * c * (1.0 - t as f64 / n as f64);
    }
    g.max(1.0)
}

/// Scans candidate equilibration cut points and keeps the one maximizing
/// the effective sample count of the remainder. At most the first half of
/// the series can be discarded.
pub fn detect_equilibration(timeseries: &[f64]) -> Result<EquilibrationResult, AnalysisError> {
    let n = timeseries.len();
    if n == 0 {
        return Err(AnalysisError::EmptyTimeseries);
    }
    if n < 4 {
        return Ok(EquilibrationResult {
            n_equilibration: 0,
            statistical_inefficiency: 1.0,
            n_effective: n,
        });
    }

    let step = (n / 10).max(1);
    let mut best = EquilibrationResult {
        n_equilibration: 0,
        statistical_inefficiency: statistical_inefficiency(timeseries),
        n_effective: 0,
    };
    let mut best_effective = 0.0;

    let mut t0 = 0;
    while t0 <= n / 2 {
        let g = statistical_inefficiency(&timeseries[t0..]);
        let effective = (n - t0) as f64 / g;
        if effective > best_effective {
            best_effective = effective;
            best = EquilibrationResult {
                n_equilibration: t0,
                statistical_inefficiency: g,
                n_effective: effective.floor() as usize,
            };
        }
        t0 += step;
    }
    Ok(best)
}

/// Replica state-transition statistics from the recorded state timeseries.
pub fn replica_transition_statistics(
    replica_states: &[Vec<usize>],
    n_states: usize,
) -> Result<TransitionStatistics, AnalysisError> {
    if replica_states.len() < 2 {
        return Err(AnalysisError::NoSamples);
    }

    let mut counts = vec![vec![0.0; n_states]; n_states];
    for (previous, current) in replica_states.iter().tuple_windows() {
        for (&from, &to) in previous.iter().zip(current) {
            counts[from][to] += 1.0;
        }
    }

    let matrix: Vec<Vec<f64>> = counts
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            let total: f64 = row.iter().sum();
            if total > 0.0 {
                row.into_iter().map(|c| c / total).collect()
            } else {
                // A state never visited keeps a self-transition row.
                (0..n_states)
                    .map(|j| if j == i { 1.0 } else { 0.0 })
                    .collect()
            }
        })
        .collect();

    let eigenvalues = sorted_real_eigenvalues(&matrix);
    Ok(TransitionStatistics {
        matrix,
        eigenvalues,
    })
}

fn sorted_real_eigenvalues(matrix: &[Vec<f64>]) -> Vec<f64> {
    let n = matrix.len();
    let flat: Vec<f64> = matrix.iter().flatten().copied().collect();
    let m = DMatrix::from_row_slice(n, n, &flat);
    let mut eigenvalues: Vec<f64> = m.complex_eigenvalues().iter().map(|c| c.re).collect();
    eigenvalues.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    eigenvalues
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Records for a two-state system with a known reduced free-energy
    /// difference: u_1 - u_0 = delta_f exactly, so BAR must recover it.
    fn constant_gap_records(n: usize, delta_f: f64) -> Vec<IterationRecord> {
        (0..n)
            .map(|iteration| IterationRecord {
                iteration,
                replica_states: vec![0, 1],
                reduced_potentials: vec![vec![0.0, delta_f], vec![0.0, delta_f]],
            })
            .collect()
    }

    fn noisy_records(n: usize, n_states: usize, seed: u64) -> Vec<IterationRecord> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|iteration| IterationRecord {
                iteration,
                replica_states: (0..n_states).collect(),
                reduced_potentials: (0..n_states)
                    .map(|_| {
                        (0..n_states)
                            .map(|s| s as f64 * 0.5 + rng.r#gen::<f64>() * 0.1)
                            .collect()
                    })
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn bar_recovers_an_exact_free_energy_difference() {
        let records = constant_gap_records(20, 1.7);
        let analyzer =
            MultiStateAnalyzer::from_records(&records, 2, Temperature::kelvin(298.15));
        let (dg, ddg) = analyzer.free_energy().unwrap();

        let kt = Temperature::kelvin(298.15).kt().value();
        assert!((dg.value() - 1.7 * kt).abs() < 1e-6);
        assert!(ddg.value() >= 0.0);
    }

    #[test]
    fn free_energy_requires_minimum_samples_per_state() {
        let records = constant_gap_records(2, 1.0);
        let analyzer =
            MultiStateAnalyzer::from_records(&records, 2, Temperature::kelvin(298.15));
        assert!(matches!(
            analyzer.free_energy(),
            Err(AnalysisError::InsufficientSamples { state: 0, .. })
        ));
    }

    #[test]
    fn overlap_matrix_rows_are_normalized_and_scalar_in_range() {
        let records = noisy_records(100, 3, 11);
        let analyzer =
            MultiStateAnalyzer::from_records(&records, 3, Temperature::kelvin(298.15));
        let overlap = analyzer.overlap_matrix().unwrap();

        for row in &overlap.matrix {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 0.1, "row sum was {sum}");
        }
        assert_eq!(overlap.eigenvalues.len(), 3);
        assert!(overlap.eigenvalues[0] <= 1.0 + 1e-6);
        assert!((0.0..=1.0 + 1e-6).contains(&overlap.scalar));
    }

    #[test]
    fn forward_and_reverse_estimates_agree_for_stationary_data() {
        let records = noisy_records(100, 2, 3);
        let analyzer =
            MultiStateAnalyzer::from_records(&records, 2, Temperature::kelvin(298.15));
        let analysis = analyzer.forward_reverse(&records).unwrap();

        assert_eq!(analysis.fractions.len(), 10);
        assert_eq!(analysis.forward_dgs.len(), 10);
        let last_forward = analysis.forward_dgs.last().unwrap().value();
        let last_reverse = analysis.reverse_dgs.last().unwrap().value();
        assert!((last_forward - last_reverse).abs() < 1e-9);
    }

    #[test]
    fn forward_reverse_fails_on_insufficient_slice_samples() {
        // 10% of three iterations is a single sample, below the estimator
        // minimum.
        let records = constant_gap_records(3, 1.0);
        let analyzer =
            MultiStateAnalyzer::from_records(&records, 2, Temperature::kelvin(298.15));
        assert!(analyzer.forward_reverse(&records).is_err());
    }

    #[test]
    fn statistical_inefficiency_is_one_for_white_noise() {
        let mut rng = StdRng::seed_from_u64(5);
        let series: Vec<f64> = (0..2000).map(|_| rng.r#gen::<f64>()).collect();
        let g = statistical_inefficiency(&series);
        assert!(g < 1.5, "g was {g}");
    }

    #[test]
    fn statistical_inefficiency_grows_for_correlated_data() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut series = vec![0.0f64];
        for _ in 1..2000 {
            let prev = *series.last().unwrap();
            series.push(0.95 * prev + 0.05 * (rng.r#gen::<f64>() - 0.5));
        }
        let g = statistical_inefficiency(&series);
        assert!(g > 5.0, "g was {g}");
    }

    #[test]
    fn equilibration_detection_discards_a_transient() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut series: Vec<f64> = (0..50).map(|i| 100.0 - 2.0 * i as f64).collect();
        series.extend((0..500).map(|_| rng.r#gen::<f64>()));

        let result = detect_equilibration(&series).unwrap();
        assert!(result.n_equilibration >= 40, "cut at {}", result.n_equilibration);
        assert!(result.n_effective > 100);
    }

    #[test]
    fn transition_statistics_are_row_stochastic() {
        let states = vec![vec![0, 1], vec![1, 0], vec![1, 0], vec![0, 1]];
        let stats = replica_transition_statistics(&states, 2).unwrap();

        for row in &stats.matrix {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert_eq!(stats.eigenvalues.len(), 2);
        assert!((stats.eigenvalues[0] - 1.0).abs() < 1e-9);
    }
}
