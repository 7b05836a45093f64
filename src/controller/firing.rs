//! Duty cycle to firing delay conversion for phase-cut dimmers.
//!
//! Delivered RMS power is not linear in the conduction angle, so a duty cycle
//! is mapped through an empirically calibrated table of normalized delays
//! (`0xffff` = a full half cycle) and the interpolated value is rescaled to
//! the configured half period.

const DIMMER_RESOLUTION: u32 = 12;
const DIMMER_MAX: f64 = ((1 << DIMMER_RESOLUTION) - 1) as f64;
const TABLE_PHASE_LEN: usize = 80;
const TABLE_PHASE_SCALE: u32 = (TABLE_PHASE_LEN as u32 - 1) * (1 << (16 - DIMMER_RESOLUTION));

#[rustfmt::skip]
const TABLE_PHASE_DELAY: [u32; TABLE_PHASE_LEN] = [
    0xefea, 0xdfd4, 0xd735, 0xd10d, 0xcc12, 0xc7cc, 0xc403, 0xc094, 0xbd6a, 0xba78,
    0xb7b2, 0xb512, 0xb291, 0xb02b, 0xaddc, 0xaba2, 0xa97a, 0xa762, 0xa557, 0xa35a,
    0xa167, 0x9f7f, 0x9da0, 0x9bc9, 0x99fa, 0x9831, 0x966e, 0x94b1, 0x92f9, 0x9145,
    0x8f95, 0x8de8, 0x8c3e, 0x8a97, 0x88f2, 0x8750, 0x85ae, 0x840e, 0x826e, 0x80cf,
    0x7f31, 0x7d92, 0x7bf2, 0x7a52, 0x78b0, 0x770e, 0x7569, 0x73c2, 0x7218, 0x706b,
    0x6ebb, 0x6d07, 0x6b4f, 0x6992, 0x67cf, 0x6606, 0x6437, 0x6260, 0x6081, 0x5e99,
    0x5ca6, 0x5aa9, 0x589e, 0x5686, 0x545e, 0x5224, 0x4fd5, 0x4d6f, 0x4aee, 0x484e,
    0x4588, 0x4296, 0x3f6c, 0x3bfd, 0x3834, 0x33ee, 0x2ef3, 0x28cb, 0x202c, 0x1016,
];

#[derive(Debug, Clone, Copy)]
pub struct FiringDelayTable {
    semi_period_us: u32,
}

impl FiringDelayTable {
    pub fn new(semi_period_us: u32) -> Self {
        Self { semi_period_us }
    }

    pub fn semi_period_us(&self) -> u32 {
        self.semi_period_us
    }

    /// Firing delay in microseconds after the zero crossing, in `[0, semi_period]`.
    ///
    /// Out of range or NaN duty cycles are clamped into `[0, 1]` first.
    pub fn lookup(&self, duty_cycle: f64) -> u32 {
        let duty_cycle = if duty_cycle.is_nan() {
            0.0
        } else {
            duty_cycle.clamp(0.0, 1.0)
        };
        if duty_cycle == 0.0 {
            return self.semi_period_us;
        }
        if duty_cycle == 1.0 {
            return 0;
        }

        let duty = duty_cycle * DIMMER_MAX;
        let slot = (duty * f64::from(TABLE_PHASE_SCALE)) as u32 + (TABLE_PHASE_SCALE >> 2);
        let index = (slot >> 16) as usize;
        let a = TABLE_PHASE_DELAY[index];
        let b = TABLE_PHASE_DELAY[index + 1];
        let delay = a - (((a - b) * (slot & 0xffff)) >> 16);

        ((u64::from(delay) * u64::from(self.semi_period_us)) >> 16) as u32
    }

    /// Fraction of the half cycle during which the dimmer conducts.
    pub fn conduction(&self, firing_delay_us: u32) -> f64 {
        if self.semi_period_us == 0 {
            return 0.0;
        }
        let delay = firing_delay_us.min(self.semi_period_us);
        f64::from(self.semi_period_us - delay) / f64::from(self.semi_period_us)
    }
}
