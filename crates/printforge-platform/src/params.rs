//! Heater and Z-probe parameter records
//!
//! These records live inside the non-volatile configuration and are edited
//! by host commands (M301/M304/M305, G31). The thermistor model follows the
//! beta parameter equation: R = Rinf * exp(beta / T), with Rinf kept
//! consistent with the R25/beta pair at all times.

use serde::{Deserialize, Serialize};

/// Absolute zero in degrees Celsius.
pub const ABS_ZERO: f64 = -273.15;

/// 25 °C in kelvin, the reference temperature of the R25 figure.
const T25_KELVIN: f64 = 25.0 - ABS_ZERO;

/// Temperature above which a thermistor reading trips the overheat cutoff.
pub const BAD_HIGH_TEMPERATURE: f64 = 285.0;

/// PID gains and thermistor model for one heater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidParameters {
    /// Proportional gain.
    #[serde(rename = "kP")]
    pub k_p: f64,
    /// Integral gain.
    #[serde(rename = "kI")]
    pub k_i: f64,
    /// Derivative gain.
    #[serde(rename = "kD")]
    pub k_d: f64,
    /// Feed-forward term.
    #[serde(rename = "kT")]
    pub k_t: f64,
    /// Output scale.
    #[serde(rename = "kS")]
    pub k_s: f64,
    /// Error band outside which the controller saturates.
    #[serde(rename = "band")]
    pub full_band: f64,
    /// Minimum controller output.
    #[serde(rename = "min")]
    pub pid_min: f64,
    /// Maximum controller output.
    #[serde(rename = "max")]
    pub pid_max: f64,
    /// Series resistor value in ohms.
    #[serde(rename = "rSeries")]
    pub thermistor_series_r: f64,
    /// Thermistor beta value in kelvin.
    #[serde(rename = "beta")]
    pub thermistor_beta: f64,
    /// R at infinite temperature; kept consistent with R25 and beta.
    #[serde(rename = "rInf")]
    thermistor_r_inf: f64,
    /// ADC reading offset at the low end.
    #[serde(rename = "adcLow")]
    pub adc_low_offset: f64,
    /// ADC reading offset at the high end.
    #[serde(rename = "adcHigh")]
    pub adc_high_offset: f64,
}

impl PidParameters {
    /// Default parameters for a heater. Heater 0 is the bed (low-beta 10 k
    /// thermistor, full-range output); the rest are hot ends.
    pub fn defaults_for(heater: usize) -> Self {
        let mut pp = if heater == 0 {
            PidParameters {
                k_p: 10.0,
                k_i: 3.0,
                k_d: 35.0,
                k_t: 0.6,
                k_s: 1.0,
                full_band: 150.0,
                pid_min: 0.0,
                pid_max: 255.0,
                thermistor_series_r: 4700.0,
                thermistor_beta: 0.0,
                thermistor_r_inf: 0.0,
                adc_low_offset: 0.0,
                adc_high_offset: 0.0,
            }
        } else {
            PidParameters {
                k_p: 12.0,
                k_i: 2.0,
                k_d: 40.0,
                k_t: 0.4,
                k_s: 1.0,
                full_band: 150.0,
                pid_min: 0.0,
                pid_max: 125.0,
                thermistor_series_r: 4700.0,
                thermistor_beta: 0.0,
                thermistor_r_inf: 0.0,
                adc_low_offset: 0.0,
                adc_high_offset: 0.0,
            }
        };
        if heater == 0 {
            pp.set_thermistor_r25_and_beta(10000.0, 3988.0);
        } else {
            pp.set_thermistor_r25_and_beta(100000.0, 4138.0);
        }
        pp
    }

    /// Set the R25/beta pair, recomputing Rinf so the three stay
    /// consistent.
    pub fn set_thermistor_r25_and_beta(&mut self, r25: f64, beta: f64) {
        self.thermistor_r_inf = r25 * (-beta / T25_KELVIN).exp();
        self.thermistor_beta = beta;
    }

    /// Thermistor resistance at 25 °C, derived from Rinf and beta.
    pub fn thermistor_r25(&self) -> f64 {
        self.thermistor_r_inf * (self.thermistor_beta / T25_KELVIN).exp()
    }

    /// Beta value.
    pub fn beta(&self) -> f64 {
        self.thermistor_beta
    }

    /// R at infinite temperature.
    pub fn r_inf(&self) -> f64 {
        self.thermistor_r_inf
    }
}

/// Parameters for one kind of Z probe.
///
/// Three independent sets coexist in the non-volatile record (switch,
/// IR family, alternate); the probe type selects the active one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZProbeParameters {
    /// Filtered probe reading at which the probe counts as triggered.
    #[serde(rename = "adc")]
    pub adc_value: i32,
    /// Nozzle height when the probe triggers, at the calibration
    /// temperature.
    pub height: f64,
    /// Z height from which probing moves start.
    pub dive: f64,
    /// Bed temperature at which `height` was calibrated.
    #[serde(rename = "calTemp")]
    pub calib_temperature: f64,
    /// Height drift per degree of bed temperature.
    #[serde(rename = "tempCoeff")]
    pub temperature_coefficient: f64,
}

/// Default dive height in mm.
pub const DEFAULT_Z_DIVE: f64 = 5.0;

/// Default trigger height for IR probes in mm.
pub const DEFAULT_PROBE_STOP_HEIGHT: f64 = 0.7;

impl ZProbeParameters {
    /// Fresh parameter set with the given trigger height.
    pub fn init(height: f64) -> Self {
        ZProbeParameters {
            adc_value: 500,
            height,
            dive: DEFAULT_Z_DIVE,
            calib_temperature: 20.0,
            temperature_coefficient: 0.0,
        }
    }

    /// Trigger height corrected for the current bed temperature.
    pub fn stop_height(&self, temperature: f64) -> f64 {
        self.height + self.temperature_coefficient * (temperature - self.calib_temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn r25_and_beta_round_trip_within_a_ppm() {
        let mut pp = PidParameters::defaults_for(1);
        pp.set_thermistor_r25_and_beta(98700.0, 4267.0);
        assert!(approx_eq!(f64, pp.thermistor_r25(), 98700.0, epsilon = 0.0987));
        assert!(approx_eq!(f64, pp.beta(), 4267.0, epsilon = 0.004));
    }

    #[test]
    fn rinf_follows_the_beta_equation() {
        let mut pp = PidParameters::defaults_for(0);
        pp.set_thermistor_r25_and_beta(10000.0, 3988.0);
        let expected = 10000.0 * (-3988.0 / 298.15_f64).exp();
        assert!(approx_eq!(f64, pp.r_inf(), expected, ulps = 4));
    }

    #[test]
    fn stop_height_applies_temperature_coefficient() {
        let mut p = ZProbeParameters::init(0.7);
        p.calib_temperature = 20.0;
        p.temperature_coefficient = 0.01;
        assert!(approx_eq!(f64, p.stop_height(20.0), 0.7, ulps = 2));
        assert!(approx_eq!(f64, p.stop_height(60.0), 1.1, ulps = 2));
    }
}
