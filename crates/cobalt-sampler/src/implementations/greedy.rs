//! Arg-max selection

use cobalt_types::{CobaltError, Result, TokenId};

use crate::distribution::{argmax, softmax};

/// Highest score wins; ties go to the lowest index.
///
/// Returns the token, its raw score and the distribution over `scores`.
pub(crate) fn select(scores: &[f32]) -> Result<(TokenId, f32, Vec<f32>)> {
    let index = argmax(scores).ok_or_else(|| {
        CobaltError::invalid_parameter("every score is masked, nothing to sample")
    })?;
    Ok((TokenId::from(index), scores[index], softmax(scores)?))
}
