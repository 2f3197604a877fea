//! 1 kHz tick sampler and over-temperature supervisor
//!
//! Runs on every system tick, independently of the main loop. Sequences
//! ADC conversions across the heater thermistors and the Z probe (with the
//! IR emitter modulated on and off), feeds the averaging filters and
//! enforces the over-temperature cutoff. The main loop can stall for long
//! periods (for example blocked on USB output); heater safety must not
//! depend on it.
//!
//! No floating-point arithmetic happens here except the single
//! `set_heater_pwm(0.0)` call on the fault path, which runs at most once
//! per fault. All comparisons use the integer filter-sum domain against
//! thresholds precomputed at boot.

use crate::board::{AdcChannel, Board, AD_DISCONNECTED, AD_RANGE};
use crate::config::ZProbeType;
use crate::filter::{
    ThermistorFilter, ZProbeFilter, THERMISTOR_AVERAGE_READINGS, Z_PROBE_AVERAGE_READINGS,
};
use crate::params::{PidParameters, ABS_ZERO, BAD_HIGH_TEMPERATURE};
use printforge_core::HEATERS;

/// Per-heater filter sum at or above which the thermistor counts as
/// disconnected.
const DISCONNECTED_SUM: u32 = AD_DISCONNECTED * THERMISTOR_AVERAGE_READINGS as u32;

/// Compute the filter-sum threshold below which a heater counts as
/// overheated, from its thermistor model. Done once at boot and whenever
/// the thermistor parameters change, never on the tick path.
pub fn overheat_sum(pid: &PidParameters) -> u32 {
    let overheat_resistance =
        pid.r_inf() * (-pid.beta() / (BAD_HIGH_TEMPERATURE - ABS_ZERO)).exp();
    let overheat_adc = (AD_RANGE + 1) as f64 * overheat_resistance
        / (overheat_resistance + pid.thermistor_series_r);
    (overheat_adc + 0.9) as u32 * THERMISTOR_AVERAGE_READINGS as u32
}

/// The sampler state machine.
///
/// States:
/// - 0: boot/wrap state; start a thermistor conversion, assert the probe
///   modulation output for the IR family
/// - 1, 3: collect the thermistor reading, check overheat, start a probe
///   conversion
/// - 2: collect the probe "on" reading, drop modulation for the modulated
///   sensor, start a thermistor conversion
/// - 4: collect the probe "off" reading and fall through to 0
pub struct TickSampler {
    tick_state: u8,
    current_heater: usize,
    current_probe_type: ZProbeType,
    heater_channels: [AdcChannel; HEATERS],
    probe_channel: AdcChannel,
    thermistor_filters: [ThermistorFilter; HEATERS],
    probe_on_filter: ZProbeFilter,
    probe_off_filter: ZProbeFilter,
    overheat_sums: [u32; HEATERS],
}

impl TickSampler {
    /// Build the sampler, preloading the thermistor filters from an
    /// initial conversion on each channel.
    pub fn new(
        board: &mut dyn Board,
        heater_channels: [AdcChannel; HEATERS],
        probe_channel: AdcChannel,
        pid: &[PidParameters; HEATERS],
    ) -> Self {
        let thermistor_filters = std::array::from_fn(|h| {
            board.start_adc_conversion(heater_channels[h]);
            ThermistorFilter::new(board.read_adc(heater_channels[h]))
        });
        TickSampler {
            tick_state: 0,
            current_heater: 0,
            current_probe_type: ZProbeType::Switch,
            heater_channels,
            probe_channel,
            thermistor_filters,
            probe_on_filter: ZProbeFilter::new(0),
            probe_off_filter: ZProbeFilter::new(0),
            overheat_sums: std::array::from_fn(|h| overheat_sum(&pid[h])),
        }
    }

    /// Recompute the overheat threshold for one heater after its
    /// thermistor parameters changed. Called from the main loop only.
    pub fn update_overheat_sum(&mut self, heater: usize, pid: &PidParameters) {
        self.overheat_sums[heater] = overheat_sum(pid);
    }

    /// Reset the probe filters, as when the probe type changes.
    pub fn reset_probe_filters(&mut self) {
        self.probe_on_filter.init(0);
        self.probe_off_filter.init(0);
    }

    /// One 1 ms tick. Returns the heater that tripped the overheat cutoff
    /// this tick, if any; the caller latches the fault.
    pub fn tick(&mut self, board: &mut dyn Board, probe_type: ZProbeType) -> Option<usize> {
        board.kick_watchdog();
        let mut fault = None;

        match self.tick_state {
            1 | 3 => {
                // Last conversion started was a thermistor.
                let reading = board.read_adc(self.heater_channels[self.current_heater]);
                let filter = &mut self.thermistor_filters[self.current_heater];
                filter.process_reading(reading);
                board.start_adc_conversion(self.probe_channel);
                if filter.is_valid() {
                    let sum = filter.sum();
                    if sum < self.overheat_sums[self.current_heater] || sum >= DISCONNECTED_SUM {
                        // Over-temperature or bad reading: turn the heater
                        // off right here. The float call is allowed on
                        // this exceptional path.
                        board.set_heater_pwm(self.current_heater, 0.0);
                        fault = Some(self.current_heater);
                    }
                }
                self.current_heater += 1;
                if self.current_heater == HEATERS {
                    self.current_heater = 0;
                }
                self.tick_state += 1;
            }

            2 => {
                // Last conversion was the Z probe with the emitter on.
                self.probe_on_filter
                    .process_reading(board.read_adc(self.probe_channel));
                board.start_adc_conversion(self.heater_channels[self.current_heater]);
                if self.current_probe_type == ZProbeType::ModulatedIr {
                    board.set_probe_modulation(false);
                }
                self.tick_state = 3;
            }

            state => {
                // State 4: collect the "off" reading first.
                if state == 4 {
                    self.probe_off_filter
                        .process_reading(board.read_adc(self.probe_channel));
                }
                // State 0 (and wrap): start a thermistor conversion and
                // re-assert modulation for the IR family.
                board.start_adc_conversion(self.heater_channels[self.current_heater]);
                self.current_probe_type = probe_type;
                if self.current_probe_type.code() <= ZProbeType::ModulatedIr.code() {
                    board.set_probe_modulation(true);
                }
                self.tick_state = 1;
            }
        }

        fault
    }

    /// Thermistor filter sum for a heater, for temperature conversion.
    pub fn thermistor_sum(&self, heater: usize) -> u32 {
        self.thermistor_filters[heater].sum()
    }

    /// Whether the thermistor filter for a heater holds a full window.
    pub fn thermistor_valid(&self, heater: usize) -> bool {
        self.thermistor_filters[heater].is_valid()
    }

    /// The filtered Z-probe reading for the given probe type, scaled to a
    /// 10-bit range for compatibility with the trigger thresholds.
    ///
    /// Modulated sensors subtract the emitter-off background, which can
    /// legitimately go negative on dark-current noise. Unmodulated sensors
    /// use both phases as plain samples.
    pub fn z_probe_value(&self, probe_type: ZProbeType) -> i32 {
        if !(self.probe_on_filter.is_valid() && self.probe_off_filter.is_valid()) {
            return 0;
        }
        match probe_type {
            ZProbeType::Ir | ZProbeType::Alternate => ((self.probe_on_filter.sum()
                + self.probe_off_filter.sum())
                / (8 * Z_PROBE_AVERAGE_READINGS as u32)) as i32,
            ZProbeType::ModulatedIr => (self.probe_on_filter.sum() as i32
                - self.probe_off_filter.sum() as i32)
                / (4 * Z_PROBE_AVERAGE_READINGS as i32),
            ZProbeType::Switch => 0,
        }
    }

    /// Secondary probe value: for the modulated sensor, the emitter-on
    /// reading alone. Returns None for other probe types.
    pub fn z_probe_secondary_value(&self, probe_type: ZProbeType) -> Option<i32> {
        if probe_type == ZProbeType::ModulatedIr
            && self.probe_on_filter.is_valid()
            && self.probe_off_filter.is_valid()
        {
            Some((self.probe_on_filter.sum() / (4 * Z_PROBE_AVERAGE_READINGS as u32)) as i32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::SimBoard;
    use printforge_core::DRIVES;

    fn pid_defaults() -> [PidParameters; HEATERS] {
        std::array::from_fn(PidParameters::defaults_for)
    }

    fn sampler_with_board() -> (TickSampler, SimBoard) {
        let mut board = SimBoard::new(HEATERS + 1, HEATERS, DRIVES);
        let channels: [AdcChannel; HEATERS] = std::array::from_fn(|h| h);
        let sampler = TickSampler::new(&mut board, channels, HEATERS, &pid_defaults());
        (sampler, board)
    }

    #[test]
    fn state_machine_cycles_through_all_phases() {
        let (mut sampler, mut board) = sampler_with_board();
        let states: Vec<u8> = (0..10)
            .map(|_| {
                sampler.tick(&mut board, ZProbeType::Ir);
                sampler.tick_state
            })
            .collect();
        assert_eq!(states, vec![1, 2, 3, 4, 1, 2, 3, 4, 1, 2]);
        assert_eq!(board.state().watchdog_kicks, 10);
    }

    #[test]
    fn modulation_toggles_for_modulated_ir() {
        let (mut sampler, mut board) = sampler_with_board();
        sampler.tick(&mut board, ZProbeType::ModulatedIr); // state 0 -> on
        assert!(board.state().probe_modulation);
        sampler.tick(&mut board, ZProbeType::ModulatedIr); // state 1
        sampler.tick(&mut board, ZProbeType::ModulatedIr); // state 2 -> off
        assert!(!board.state().probe_modulation);
        sampler.tick(&mut board, ZProbeType::ModulatedIr); // state 3
        sampler.tick(&mut board, ZProbeType::ModulatedIr); // state 4 + wrap -> on
        assert!(board.state().probe_modulation);
    }

    #[test]
    fn plain_ir_keeps_modulation_asserted() {
        let (mut sampler, mut board) = sampler_with_board();
        for _ in 0..8 {
            sampler.tick(&mut board, ZProbeType::Ir);
            if sampler.tick_state != 0 {
                assert!(board.state().probe_modulation);
            }
        }
    }

    #[test]
    fn overheat_sum_trips_the_cutoff() {
        let (mut sampler, mut board) = sampler_with_board();
        // A very low ADC reading means low resistance: dangerously hot.
        for channel in 0..HEATERS {
            board.set_adc_value(channel, 5);
        }
        board.state().heater_pwms[1] = 0.7;

        let mut faulted = Vec::new();
        // Enough ticks to fill every thermistor window and check it.
        for _ in 0..THERMISTOR_AVERAGE_READINGS * HEATERS * 4 {
            if let Some(h) = sampler.tick(&mut board, ZProbeType::Switch) {
                faulted.push(h);
            }
        }
        assert!(faulted.contains(&1));
        assert_eq!(board.state().heater_pwms[1], 0.0);
    }

    #[test]
    fn disconnected_sentinel_counts_as_fault() {
        let (mut sampler, mut board) = sampler_with_board();
        for channel in 0..HEATERS {
            board.set_adc_value(channel, AD_RANGE as u16); // floating input
        }
        let mut any_fault = false;
        for _ in 0..THERMISTOR_AVERAGE_READINGS * HEATERS * 4 {
            any_fault |= sampler.tick(&mut board, ZProbeType::Switch).is_some();
        }
        assert!(any_fault);
    }

    #[test]
    fn no_fault_before_filter_is_valid() {
        let (mut sampler, mut board) = sampler_with_board();
        for channel in 0..HEATERS {
            board.set_adc_value(channel, 5);
        }
        // Fewer ticks than it takes to fill any window.
        for _ in 0..8 {
            assert_eq!(sampler.tick(&mut board, ZProbeType::Switch), None);
        }
    }

    #[test]
    fn modulated_reading_can_go_negative() {
        let (mut sampler, mut board) = sampler_with_board();
        // Background brighter than the emitter: off phase reads higher.
        // The sampler reads the same channel for both phases; alternate
        // the value between on (states 1->2 read) and off (3->4 read).
        for _ in 0..Z_PROBE_AVERAGE_READINGS * 10 {
            match sampler.tick_state {
                2 => board.set_adc_value(HEATERS, 100), // about to be read as "on"
                4 => board.set_adc_value(HEATERS, 300), // about to be read as "off"
                _ => {}
            }
            sampler.tick(&mut board, ZProbeType::ModulatedIr);
        }
        assert!(sampler.z_probe_value(ZProbeType::ModulatedIr) < 0);
    }

    #[test]
    fn single_ended_reading_averages_both_phases() {
        let (mut sampler, mut board) = sampler_with_board();
        board.set_adc_value(HEATERS, 400);
        for _ in 0..Z_PROBE_AVERAGE_READINGS * 10 {
            sampler.tick(&mut board, ZProbeType::Ir);
        }
        // (on_sum + off_sum) / (8 * N) with every sample at 400.
        assert_eq!(sampler.z_probe_value(ZProbeType::Ir), 100);
    }
}
