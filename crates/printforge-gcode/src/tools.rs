//! Tool definitions
//!
//! A tool maps a tool number to the extruder drives and heaters it uses,
//! and carries the active/standby temperatures set by G10. Tools are
//! defined by M563 and selected by T codes; at most one tool is selected
//! at a time.

/// One defined tool.
#[derive(Debug, Clone)]
pub struct Tool {
    number: i32,
    drives: Vec<usize>,
    heaters: Vec<usize>,
    active_temperatures: Vec<f64>,
    standby_temperatures: Vec<f64>,
}

impl Tool {
    /// Define a tool over the given extruder drives and heaters.
    pub fn new(number: i32, drives: Vec<usize>, heaters: Vec<usize>) -> Self {
        let heater_count = heaters.len();
        Tool {
            number,
            drives,
            heaters,
            active_temperatures: vec![0.0; heater_count],
            standby_temperatures: vec![0.0; heater_count],
        }
    }

    /// The tool number used by T and G10 codes.
    pub fn number(&self) -> i32 {
        self.number
    }

    /// How many extruder drives this tool feeds.
    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    /// The extruder drive index behind the tool's `i`th drive.
    pub fn drive(&self, i: usize) -> usize {
        self.drives[i]
    }

    /// How many heaters this tool uses.
    pub fn heater_count(&self) -> usize {
        self.heaters.len()
    }

    /// The heater index behind the tool's `i`th heater.
    pub fn heater(&self, i: usize) -> usize {
        self.heaters[i]
    }

    /// Store the standby and active temperatures (G10 R/S).
    pub fn set_variables(&mut self, standby: &[f64], active: &[f64]) {
        for (i, &t) in standby.iter().take(self.heaters.len()).enumerate() {
            self.standby_temperatures[i] = t;
        }
        for (i, &t) in active.iter().take(self.heaters.len()).enumerate() {
            self.active_temperatures[i] = t;
        }
    }

    /// The stored standby and active temperatures.
    pub fn variables(&self) -> (&[f64], &[f64]) {
        (&self.standby_temperatures, &self.active_temperatures)
    }

    /// Set the active temperature for every heater of the tool.
    pub fn set_all_active(&mut self, temperature: f64) {
        for t in &mut self.active_temperatures {
            *t = temperature;
        }
    }
}
