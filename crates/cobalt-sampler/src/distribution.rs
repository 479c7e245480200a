//! Numeric helpers over score vectors

use cobalt_types::{CobaltError, Result};
use rand::{Rng, RngCore};

/// Softmax with max subtraction; −∞ and NaN scores get probability 0.
///
/// Scores of `+∞` share the whole mass evenly. Fails when every score is masked.
pub fn softmax(scores: &[f32]) -> Result<Vec<f32>> {
    let unbounded = scores.iter().filter(|&&s| s == f32::INFINITY).count();
    if unbounded > 0 {
        let share = 1.0 / unbounded as f32;
        return Ok(scores
            .iter()
            .map(|&s| if s == f32::INFINITY { share } else { 0.0 })
            .collect());
    }

    let max = scores
        .iter()
        .filter(|s| s.is_finite())
        .fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        return Err(CobaltError::invalid_parameter(
            "every score is masked, nothing to sample",
        ));
    }

    let mut probs: Vec<f32> = scores
        .iter()
        .map(|&s| if s.is_finite() { (s - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= sum);
    Ok(probs)
}

/// Log-probabilities; masked entries stay at −∞.
pub fn log_softmax(scores: &[f32]) -> Result<Vec<f32>> {
    Ok(softmax(scores)?
        .into_iter()
        .map(|p| if p > 0.0 { p.ln() } else { f32::NEG_INFINITY })
        .collect())
}

/// Index of the largest score, first occurrence on ties. Masked (−∞) and NaN
/// scores never win.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() || s == f32::NEG_INFINITY {
            continue;
        }
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

/// Indices ordered by descending score; equal scores keep their original order.
pub fn descending_order(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

/// Draw an index from `probs` with one uniform variate and a cumulative-sum search.
pub fn draw_categorical(probs: &[f32], rng: &mut dyn RngCore) -> Result<usize> {
    let r: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    let mut last_positive = None;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_positive = Some(i);
        if r < cumulative {
            return Ok(i);
        }
    }
    // r landed past the accumulated mass through rounding
    last_positive.ok_or_else(|| {
        CobaltError::invalid_parameter("distribution has no positive mass")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn softmax_ignores_masked_entries() {
        let probs = softmax(&[0.0, f32::NEG_INFINITY, 0.0]).unwrap();
        assert_eq!(probs, vec![0.5, 0.0, 0.5]);
        assert!(softmax(&[f32::NEG_INFINITY; 3]).is_err());
    }

    #[test]
    fn softmax_is_stable_for_large_scores() {
        let probs = softmax(&[1000.0, 1000.0]).unwrap();
        assert!((probs[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn unbounded_scores_take_all_the_mass() {
        let probs = softmax(&[1.0, f32::INFINITY, 0.5, f32::INFINITY]).unwrap();
        assert_eq!(probs, vec![0.0, 0.5, 0.0, 0.5]);
        assert_eq!(argmax(&[1.0, f32::INFINITY, f32::INFINITY]), Some(1));
    }

    #[test]
    fn descending_order_tolerates_nan() {
        let scores: Vec<f32> = (0..5000)
            .map(|i| if i % 3 == 0 { f32::NAN } else { i as f32 })
            .collect();
        let order = descending_order(&scores);
        assert_eq!(order.len(), scores.len());
        assert_eq!(order[0], 0);
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), Some(1));
        assert_eq!(argmax(&[f32::NEG_INFINITY]), None);
    }

    #[test]
    fn descending_order_is_stable() {
        assert_eq!(descending_order(&[2.0, 5.0, 2.0, 5.0]), vec![1, 3, 0, 2]);
    }

    #[test]
    fn draws_follow_the_distribution() {
        let mut rng = StdRng::seed_from_u64(42);
        let probs = [0.0, 0.8, 0.2];
        let mut counts = [0usize; 3];
        for _ in 0..2000 {
            counts[draw_categorical(&probs, &mut rng).unwrap()] += 1;
        }
        assert_eq!(counts[0], 0);
        assert!(counts[1] > counts[2] * 2);
    }
}
