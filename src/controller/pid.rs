/// PID (Proportional-Integral-Derivative) Controller
///
/// Computes how many Watts may be diverted so that the measured grid power
/// converges to the setpoint. The controller runs once per control cycle, so
/// gains are expressed per cycle and there is no `dt` term.
///
/// # Terms
/// - **P**: on error (`Kp * error`), on measurement (accumulated
///   `Kp * (previous - input)`), or half of each
/// - **I**: `Ki * error` accumulated, with selectable anti-windup
/// - **D**: on error delta or on measurement delta
///
/// Output = clamp(P + I + D, out_min, out_max)
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProportionalMode {
    Error,
    #[default]
    Input,
    Both,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DerivativeMode {
    Error,
    #[default]
    Input,
}

/// Integral anti-windup strategy
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IntegralCorrection {
    /// Integral term is never clamped
    Off,
    /// Integral term is clamped to the output limits
    #[default]
    Clamp,
    /// Integration freezes while the output is saturated and the error keeps
    /// pushing it further out, then the term is clamped
    Advanced,
}

/// One gain and bound set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Usually negative: allows a small import before diversion starts
    pub out_min: f64,
    /// Caps the total power diverted across all loads
    pub out_max: f64,
}

/// Which gain set a [`GainSchedule`] picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GainSet {
    High,
    Low,
}

/// HIGH/LOW gain switching, selected by how far the grid is from the setpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GainSchedule {
    pub high: Tuning,
    pub low: Option<Tuning>,
    pub switch_threshold: Option<f64>,
}

impl GainSchedule {
    pub fn fixed(tuning: Tuning) -> Self {
        Self {
            high: tuning,
            low: None,
            switch_threshold: None,
        }
    }

    pub fn select(&self, input: f64, setpoint: f64) -> (GainSet, Tuning) {
        match (self.low, self.switch_threshold) {
            (Some(low), Some(threshold)) if (input - setpoint).abs() < threshold => {
                (GainSet::Low, low)
            }
            _ => (GainSet::High, self.high),
        }
    }
}

/// Internal term values, exposed for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PidTerms {
    /// `None` until the first sample
    pub previous_input: Option<f64>,
    pub previous_error: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub output: f64,
}

#[derive(Debug, Clone)]
pub struct PidController {
    setpoint: f64,
    tuning: Tuning,
    proportional_mode: ProportionalMode,
    derivative_mode: DerivativeMode,
    integral_correction: IntegralCorrection,
    /// Reverse acting: output grows when the input rises above the setpoint
    reverse: bool,

    /// Accumulated proportional-on-measurement part
    p_input: f64,
    terms: PidTerms,
}

impl PidController {
    /// Create a controller with the default modes (P on input, D on input, clamped I)
    pub fn new(setpoint: f64, tuning: Tuning) -> Self {
        Self {
            setpoint,
            tuning,
            proportional_mode: ProportionalMode::default(),
            derivative_mode: DerivativeMode::default(),
            integral_correction: IntegralCorrection::default(),
            reverse: false,
            p_input: 0.0,
            terms: PidTerms::default(),
        }
    }

    pub fn with_modes(
        mut self,
        proportional: ProportionalMode,
        derivative: DerivativeMode,
        integral: IntegralCorrection,
    ) -> Self {
        self.proportional_mode = proportional;
        self.derivative_mode = derivative;
        self.integral_correction = integral;
        self
    }

    pub fn reversed(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Swap gains and bounds between cycles (gain scheduling, live overrides)
    pub fn set_tuning(&mut self, tuning: Tuning) {
        self.tuning = tuning;
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    pub fn terms(&self) -> PidTerms {
        self.terms
    }

    pub fn output(&self) -> f64 {
        self.terms.output
    }

    /// Back to the first-sample state
    pub fn reset(&mut self) {
        self.p_input = 0.0;
        self.terms = PidTerms::default();
    }

    /// Compute the correction for one measured grid power sample.
    pub fn update(&mut self, input: f64) -> f64 {
        let Tuning {
            kp,
            ki,
            kd,
            out_min,
            out_max,
        } = self.tuning;

        let (error, measure_delta) = {
            let first = self.terms.previous_input.is_none();
            let previous = self.terms.previous_input.unwrap_or(input);
            let (error, delta) = if self.reverse {
                (input - self.setpoint, input - previous)
            } else {
                (self.setpoint - input, previous - input)
            };
            if first {
                // no derivative kick on the first sample
                self.terms.previous_error = error;
            }
            (error, delta)
        };

        let p_error = match self.proportional_mode {
            ProportionalMode::Error => kp * error,
            ProportionalMode::Input => {
                self.p_input += kp * measure_delta;
                0.0
            }
            ProportionalMode::Both => {
                self.p_input += 0.5 * kp * measure_delta;
                0.5 * kp * error
            }
        };
        let proportional = p_error + self.p_input;

        let derivative = match self.derivative_mode {
            DerivativeMode::Error => kd * (error - self.terms.previous_error),
            DerivativeMode::Input => kd * measure_delta,
        };

        let candidate = self.terms.integral + ki * error;
        let integral = match self.integral_correction {
            IntegralCorrection::Off => candidate,
            IntegralCorrection::Clamp => constrain(candidate, out_min, out_max),
            IntegralCorrection::Advanced => {
                let unclamped = proportional + candidate + derivative;
                let winding_up = (unclamped > out_max && error > 0.0)
                    || (unclamped < out_min && error < 0.0);
                let next = if winding_up {
                    self.terms.integral
                } else {
                    candidate
                };
                constrain(next, out_min, out_max)
            }
        };

        let output = constrain(proportional + integral + derivative, out_min, out_max);

        self.terms = PidTerms {
            previous_input: Some(input),
            previous_error: error,
            proportional,
            integral,
            derivative,
            output,
        };

        output
    }
}

/// Clamp that never panics on inverted or NaN bounds
pub(crate) fn constrain(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}
