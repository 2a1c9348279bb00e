// Data types shared by the codec, the motor state and the registry

use serde::{Deserialize, Serialize};

/// Last telemetry sample reported by a board for one motor
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq)]
pub struct Telemetry {
    pub rpm: f32,
    pub error: f32,
    pub pid_output: f32,
    pub proportional: f32,
    pub integral: f32,
    pub derivative: f32,
}

impl Telemetry {
    pub fn from_array(values: [f32; 6]) -> Self {
        let [rpm, error, pid_output, proportional, integral, derivative] = values;
        Self {
            rpm,
            error,
            pid_output,
            proportional,
            integral,
            derivative,
        }
    }

    /// Returns the sample in wire order [rpm, error, pid, p, i, d]
    pub fn as_array(&self) -> [f32; 6] {
        [
            self.rpm,
            self.error,
            self.pid_output,
            self.proportional,
            self.integral,
            self.derivative,
        ]
    }
}

/// Control parameters for one motor (what gets pushed to the board)
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq)]
pub struct MotorParams {
    pub setpoint: f64,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

/// Partial parameter update: only the present fields are applied.
///
/// Doubles as the per-motor object of the configuration file, hence the
/// `SetPoint` spelling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct ParamsUpdate {
    #[serde(rename = "SetPoint", default, skip_serializing_if = "Option::is_none")]
    pub setpoint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kp: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ki: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kd: Option<f32>,
}

impl ParamsUpdate {
    pub fn setpoint(setpoint: f64) -> Self {
        Self {
            setpoint: Some(setpoint),
            ..Self::default()
        }
    }

    pub fn gains(kp: f32, ki: f32, kd: f32) -> Self {
        Self {
            kp: Some(kp),
            ki: Some(ki),
            kd: Some(kd),
            ..Self::default()
        }
    }

    pub fn with_kp(mut self, kp: f32) -> Self {
        self.kp = Some(kp);
        self
    }

    pub fn with_ki(mut self, ki: f32) -> Self {
        self.ki = Some(ki);
        self
    }

    pub fn with_kd(mut self, kd: f32) -> Self {
        self.kd = Some(kd);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.setpoint.is_none() && self.kp.is_none() && self.ki.is_none() && self.kd.is_none()
    }

    /// Overwrite the fields of `params` that this update carries
    pub fn apply_to(&self, params: &mut MotorParams) {
        if let Some(setpoint) = self.setpoint {
            params.setpoint = setpoint;
        }
        if let Some(kp) = self.kp {
            params.kp = kp;
        }
        if let Some(ki) = self.ki {
            params.ki = ki;
        }
        if let Some(kd) = self.kd {
            params.kd = kd;
        }
    }
}
