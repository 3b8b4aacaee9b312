//! Physical quantities used throughout the library.
//!
//! Free energies move between estimator output (reduced units), storage
//! (kJ/mol) and user-facing results (kcal/mol), so [`Energy`] carries its
//! unit explicitly and every statistical reducer converts to a common unit
//! before combining values. The remaining quantities are stored in a single
//! canonical unit each (kelvin, bar, femtoseconds) with named constructors.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Neg, Sub};

/// Boltzmann constant in kcal/(mol·K).
pub const BOLTZMANN_KCAL_PER_MOL_K: f64 = 1.987204259e-3;

const KCAL_PER_KJ: f64 = 1.0 / 4.184;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyUnit {
    KilocaloriePerMole,
    KilojoulePerMole,
}

/// A molar energy tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Energy {
    value: f64,
    unit: EnergyUnit,
}

impl Energy {
    pub fn kcal_per_mol(value: f64) -> Self {
        Self {
            value,
            unit: EnergyUnit::KilocaloriePerMole,
        }
    }

    pub fn kj_per_mol(value: f64) -> Self {
        Self {
            value,
            unit: EnergyUnit::KilojoulePerMole,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> EnergyUnit {
        self.unit
    }

    /// Converts to the requested unit.
    pub fn to(&self, unit: EnergyUnit) -> Energy {
        Energy {
            value: self.value_in(unit),
            unit,
        }
    }

    /// The numerical value this energy takes in the requested unit.
    pub fn value_in(&self, unit: EnergyUnit) -> f64 {
        match (self.unit, unit) {
            (EnergyUnit::KilocaloriePerMole, EnergyUnit::KilocaloriePerMole)
            | (EnergyUnit::KilojoulePerMole, EnergyUnit::KilojoulePerMole) => self.value,
            (EnergyUnit::KilojoulePerMole, EnergyUnit::KilocaloriePerMole) => {
                self.value * KCAL_PER_KJ
            }
            (EnergyUnit::KilocaloriePerMole, EnergyUnit::KilojoulePerMole) => {
                self.value / KCAL_PER_KJ
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

impl Add for Energy {
    type Output = Energy;

    fn add(self, rhs: Self) -> Self::Output {
        Energy {
            value: self.value + rhs.value_in(self.unit),
            unit: self.unit,
        }
    }
}

impl Sub for Energy {
    type Output = Energy;

    fn sub(self, rhs: Self) -> Self::Output {
        Energy {
            value: self.value - rhs.value_in(self.unit),
            unit: self.unit,
        }
    }
}

impl Neg for Energy {
    type Output = Energy;

    fn neg(self) -> Self::Output {
        Energy {
            value: -self.value,
            unit: self.unit,
        }
    }
}

/// A physical time length, stored in femtoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    femtoseconds: f64,
}

impl TimeSpan {
    pub fn femtoseconds(fs: f64) -> Self {
        Self { femtoseconds: fs }
    }

    pub fn picoseconds(ps: f64) -> Self {
        Self {
            femtoseconds: ps * 1e3,
        }
    }

    pub fn nanoseconds(ns: f64) -> Self {
        Self {
            femtoseconds: ns * 1e6,
        }
    }

    pub fn as_femtoseconds(&self) -> f64 {
        self.femtoseconds
    }

    pub fn as_picoseconds(&self) -> f64 {
        self.femtoseconds * 1e-3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    kelvin: f64,
}

impl Temperature {
    pub fn kelvin(k: f64) -> Self {
        Self { kelvin: k }
    }

    pub fn as_kelvin(&self) -> f64 {
        self.kelvin
    }

    /// Thermal energy kT at this temperature.
    pub fn kt(&self) -> Energy {
        Energy::kcal_per_mol(BOLTZMANN_KCAL_PER_MOL_K * self.kelvin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pressure {
    bar: f64,
}

impl Pressure {
    pub fn bar(bar: f64) -> Self {
        Self { bar }
    }

    pub fn as_bar(&self) -> f64 {
        self.bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_converts_between_kcal_and_kj() {
        let e = Energy::kcal_per_mol(1.0);
        assert!((e.value_in(EnergyUnit::KilojoulePerMole) - 4.184).abs() < 1e-12);

        let e = Energy::kj_per_mol(4.184);
        assert!((e.value_in(EnergyUnit::KilocaloriePerMole) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn energy_arithmetic_converts_rhs_to_lhs_unit() {
        let sum = Energy::kcal_per_mol(1.0) + Energy::kj_per_mol(4.184);
        assert_eq!(sum.unit(), EnergyUnit::KilocaloriePerMole);
        assert!((sum.value() - 2.0).abs() < 1e-12);

        let diff = Energy::kcal_per_mol(1.0) - Energy::kj_per_mol(4.184);
        assert!(diff.value().abs() < 1e-12);
    }

    #[test]
    fn energy_negation_keeps_unit() {
        let e = -Energy::kcal_per_mol(2.5);
        assert_eq!(e.value(), -2.5);
        assert_eq!(e.unit(), EnergyUnit::KilocaloriePerMole);
    }

    #[test]
    fn timespan_constructors_agree_on_femtoseconds() {
        assert_eq!(TimeSpan::picoseconds(1.0).as_femtoseconds(), 1000.0);
        assert_eq!(TimeSpan::nanoseconds(1.0).as_femtoseconds(), 1e6);
        assert_eq!(TimeSpan::femtoseconds(4.0).as_picoseconds(), 0.004);
    }

    #[test]
    fn kt_at_room_temperature_is_close_to_reference_value() {
        let kt = Temperature::kelvin(298.15).kt();
        assert!((kt.value() - 0.5925).abs() < 1e-3);
    }
}
