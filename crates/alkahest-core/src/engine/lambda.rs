//! Lambda schedule construction and validation.
//!
//! A schedule is three equal-length sequences of decoupling-progress values
//! in [0, 1], one entry per replica: electrostatics, sterics, and restraint
//! scale. It is built once per leg, validated before any simulation work
//! begins, and immutable thereafter.

use super::config::{ConfigError, LambdaSettings};
use serde::{Deserialize, Serialize};

/// The lambda values of a single interpolation state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaState {
    /// Charge decoupling progress: 0 fully coupled, 1 fully decoupled.
    pub electrostatics: f64,
    /// Steric decoupling progress.
    pub sterics: f64,
    /// Restraint engagement: 0 off, 1 fully engaged.
    pub restraints: f64,
}

impl LambdaState {
    /// The fully interacting end state.
    pub fn coupled() -> Self {
        Self {
            electrostatics: 0.0,
            sterics: 0.0,
            restraints: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaSchedule {
    elec: Vec<f64>,
    vdw: Vec<f64>,
    restraints: Vec<f64>,
}

impl LambdaSchedule {
    /// Builds a schedule from explicit per-component window arrays.
    pub fn from_settings(
        settings: &LambdaSettings,
        n_replicas: usize,
    ) -> Result<Self, ConfigError> {
        let schedule = Self {
            elec: settings.lambda_elec.clone(),
            vdw: settings.lambda_vdw.clone(),
            restraints: settings.lambda_restraints.clone(),
        };
        schedule.validate(n_replicas)?;
        Ok(schedule)
    }

    /// Builds the analytic two-phase solvation schedule.
    ///
    /// Charge decoupling ramps 0 to 1 across `n_elec` windows and then holds;
    /// steric decoupling holds at 0 across those windows and then ramps 0 to 1
    /// across `n_vdw` further windows. Electrostatics are fully off before any
    /// steric decoupling starts, so no naked-charge state can occur.
    pub fn windowed(n_elec: usize, n_vdw: usize, n_replicas: usize) -> Result<Self, ConfigError> {
        if n_elec == 0 || n_vdw == 0 {
            return Err(ConfigError::EmptyLambdaPhase { n_elec, n_vdw });
        }

        let mut elec: Vec<f64> = linspace(0.0, 1.0, n_elec);
        elec.extend(std::iter::repeat(1.0).take(n_vdw));

        let mut vdw: Vec<f64> = vec![0.0; n_elec];
        // The steric ramp shares its first point with the last charge window.
        vdw.extend(linspace(0.0, 1.0, n_vdw + 1).into_iter().skip(1));

        let restraints = vec![0.0; n_elec + n_vdw];

        let schedule = Self {
            elec,
            vdw,
            restraints,
        };
        schedule.validate(n_replicas)?;
        Ok(schedule)
    }

    fn validate(&self, n_replicas: usize) -> Result<(), ConfigError> {
        if self.elec.len() != self.vdw.len() || self.vdw.len() != self.restraints.len() {
            return Err(ConfigError::LambdaComponentMismatch {
                elec: self.elec.len(),
                vdw: self.vdw.len(),
                restraints: self.restraints.len(),
            });
        }

        if n_replicas != self.vdw.len() {
            return Err(ConfigError::ReplicaWindowMismatch {
                n_replicas,
                n_windows: self.vdw.len(),
            });
        }

        for (component, values) in [
            ("elec", &self.elec),
            ("vdw", &self.vdw),
            ("restraints", &self.restraints),
        ] {
            if let Some((index, &value)) = values
                .iter()
                .enumerate()
                .find(|(_, v)| !(0.0..=1.0).contains(*v))
            {
                return Err(ConfigError::LambdaOutOfRange {
                    component,
                    index,
                    value,
                });
            }
        }

        // A state with residual charges but fully decoupled sterics exposes
        // a point-charge singularity.
        for (index, (&elec, &vdw)) in self.elec.iter().zip(&self.vdw).enumerate() {
            if elec < 1.0 && vdw == 1.0 {
                return Err(ConfigError::NakedCharge { index, elec, vdw });
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.elec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elec.is_empty()
    }

    /// The lambda values at window `index`.
    pub fn state(&self, index: usize) -> LambdaState {
        LambdaState {
            electrostatics: self.elec[index],
            sterics: self.vdw[index],
            restraints: self.restraints[index],
        }
    }

    pub fn states(&self) -> impl Iterator<Item = LambdaState> + '_ {
        (0..self.len()).map(|i| self.state(i))
    }

    pub fn elec(&self) -> &[f64] {
        &self.elec
    }

    pub fn vdw(&self) -> &[f64] {
        &self.vdw
    }

    pub fn restraints(&self) -> &[f64] {
        &self.restraints
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(elec: Vec<f64>, vdw: Vec<f64>, restraints: Vec<f64>) -> LambdaSettings {
        LambdaSettings {
            lambda_elec: elec,
            lambda_vdw: vdw,
            lambda_restraints: restraints,
        }
    }

    #[test]
    fn valid_schedule_has_equal_component_lengths() {
        let schedule = LambdaSchedule::from_settings(
            &settings(
                vec![0.0, 0.5, 1.0, 1.0],
                vec![0.0, 0.0, 0.5, 1.0],
                vec![0.0; 4],
            ),
            4,
        )
        .unwrap();
        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule.state(1).electrostatics, 0.5);
    }

    #[test]
    fn mismatched_component_lengths_are_rejected_with_actual_lengths() {
        let result = LambdaSchedule::from_settings(
            &settings(vec![0.0, 1.0], vec![0.0, 0.5, 1.0], vec![0.0; 3]),
            3,
        );
        assert_eq!(
            result,
            Err(ConfigError::LambdaComponentMismatch {
                elec: 2,
                vdw: 3,
                restraints: 3
            })
        );
    }

    #[test]
    fn replica_count_must_match_window_count() {
        let result = LambdaSchedule::from_settings(
            &settings(vec![1.0; 14], vec![1.0; 14], vec![0.0; 14]),
            10,
        );
        assert_eq!(
            result,
            Err(ConfigError::ReplicaWindowMismatch {
                n_replicas: 10,
                n_windows: 14
            })
        );
    }

    #[test]
    fn naked_charge_state_is_rejected_with_offending_index() {
        // Window 1 still carries charges while sterics are fully decoupled.
        let result = LambdaSchedule::from_settings(
            &settings(vec![0.0, 0.5, 1.0], vec![0.0, 1.0, 1.0], vec![0.0; 3]),
            3,
        );
        assert_eq!(
            result,
            Err(ConfigError::NakedCharge {
                index: 1,
                elec: 0.5,
                vdw: 1.0
            })
        );
    }

    #[test]
    fn out_of_range_lambda_is_rejected() {
        let result = LambdaSchedule::from_settings(
            &settings(vec![0.0, 1.2], vec![0.0, 1.0], vec![0.0; 2]),
            2,
        );
        assert!(matches!(
            result,
            Err(ConfigError::LambdaOutOfRange {
                component: "elec",
                index: 1,
                ..
            })
        ));
    }

    #[test]
    fn windowed_schedule_has_expected_length_and_phases() {
        let schedule = LambdaSchedule::windowed(12, 18, 30).unwrap();
        assert_eq!(schedule.len(), 30);

        // Charges fully decoupled before sterics begin.
        assert_eq!(schedule.state(11).electrostatics, 1.0);
        assert_eq!(schedule.state(11).sterics, 0.0);
        // Final state is fully decoupled.
        assert_eq!(schedule.state(29).electrostatics, 1.0);
        assert_eq!(schedule.state(29).sterics, 1.0);
        // No restraint dimension for solvation.
        assert!(schedule.restraints().iter().all(|&r| r == 0.0));
    }

    #[test]
    fn windowed_schedule_is_monotone_per_component() {
        let schedule = LambdaSchedule::windowed(5, 7, 12).unwrap();
        for values in [schedule.elec(), schedule.vdw()] {
            assert!(values.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn windowed_schedule_rejects_replica_mismatch() {
        assert!(matches!(
            LambdaSchedule::windowed(12, 18, 11),
            Err(ConfigError::ReplicaWindowMismatch {
                n_replicas: 11,
                n_windows: 30
            })
        ));
    }

    #[test]
    fn windowed_schedule_rejects_empty_phases() {
        assert!(matches!(
            LambdaSchedule::windowed(0, 18, 18),
            Err(ConfigError::EmptyLambdaPhase { .. })
        ));
    }
}
