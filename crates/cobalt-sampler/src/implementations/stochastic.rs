//! Temperature, top-k and top-p sampling

use cobalt_types::{Result, SamplingConfig, TokenId};
use rand::RngCore;

use crate::distribution::{draw_categorical, softmax};
use crate::processors::{LogitsProcessor, TemperatureProcessor, TopKProcessor, TopPProcessor};

/// Filter applied after temperature scaling
#[derive(Debug, Clone, Copy)]
pub(crate) enum Filter {
    None,
    TopK,
    TopP,
}

/// Scale, filter, normalise and draw.
///
/// `scores` is rewritten in place to the filtered score vector. Returns the
/// drawn token, its log-probability and the distribution it was drawn from.
pub(crate) fn select(
    scores: &mut [f32],
    config: &SamplingConfig,
    filter: Filter,
    rng: &mut dyn RngCore,
) -> Result<(TokenId, f32, Vec<f32>)> {
    TemperatureProcessor::new(config.temperature)?.process(scores, &[])?;
    match filter {
        Filter::None => {}
        Filter::TopK => TopKProcessor::new(config.top_k).process(scores, &[])?,
        Filter::TopP => TopPProcessor::new(config.top_p).process(scores, &[])?,
    }
    let probs = softmax(scores)?;
    let index = draw_categorical(&probs, rng)?;
    Ok((TokenId::from(index), probs[index].ln(), probs))
}
