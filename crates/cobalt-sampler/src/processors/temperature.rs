//! Temperature scaling

use cobalt_types::{CobaltError, Result, TokenId};

use super::LogitsProcessor;

/// Divides every score by the temperature.
///
/// Values below 1.0 sharpen the distribution, values above flatten it.
#[derive(Debug, Clone)]
pub struct TemperatureProcessor {
    temperature: f32,
}

impl TemperatureProcessor {
    pub fn new(temperature: f32) -> Result<Self> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(CobaltError::config(format!(
                "temperature must be > 0, got {}",
                temperature
            )));
        }
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }
}

impl LogitsProcessor for TemperatureProcessor {
    fn process(&self, logits: &mut [f32], _history: &[TokenId]) -> Result<()> {
        if (self.temperature - 1.0).abs() < f32::EPSILON {
            return Ok(());
        }
        for logit in logits.iter_mut() {
            *logit /= self.temperature;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "temperature"
    }
}
