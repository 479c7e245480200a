//! Beam search

use cobalt_types::{CobaltError, FinishReason, Result, SamplingConfig, TokenId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::factory::SamplerFactory;
use super::strategy::{finish_reason, prepare_scores};
use crate::distribution::{descending_order, log_softmax, softmax};
use crate::processors::ProcessorChain;

/// Rank the `width` best tokens of one score vector.
///
/// Returns the candidates best-first, the best log-probability and the
/// distribution over `scores`.
pub(crate) fn rank_candidates(scores: &[f32], width: usize) -> Result<(Vec<TokenId>, f32, Vec<f32>)> {
    let logprobs = log_softmax(scores)?;
    let candidates: Vec<TokenId> = descending_order(&logprobs)
        .into_iter()
        .filter(|&i| logprobs[i].is_finite())
        .take(width.max(1))
        .map(TokenId::from)
        .collect();
    let best = logprobs[candidates[0].index()];
    Ok((candidates, best, softmax(scores)?))
}

/// One candidate continuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    pub tokens: Vec<TokenId>,
    /// Cumulative log-probability
    pub score: f32,
    pub finish_reason: Option<FinishReason>,
}

impl Beam {
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn last_token(&self) -> Option<TokenId> {
        self.tokens.last().copied()
    }
}

/// Result of advancing every beam by one step
#[derive(Debug, Clone, PartialEq)]
pub struct BeamStep {
    /// `parents[i]` is the index, before this step, of the beam now at `i`
    pub parents: Vec<usize>,
    /// Token appended to each beam this step; `None` for beams already finished
    pub tokens: Vec<Option<TokenId>>,
    pub is_finished: bool,
}

/// Beam search state across generation steps.
///
/// Starts from a single empty beam. Each step extends every live beam with
/// its `beam_width` best tokens, ranks all candidates by cumulative
/// log-probability and keeps the best `beam_width`. Finished beams compete
/// with their frozen score.
#[derive(Debug)]
pub struct BeamSearch {
    config: SamplingConfig,
    chain: ProcessorChain,
    beams: Vec<Beam>,
    steps: usize,
}

struct Candidate {
    parent: usize,
    token: Option<TokenId>,
    score: f32,
}

impl BeamSearch {
    pub fn new(config: SamplingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            chain: SamplerFactory::processor_chain(&config),
            config,
            beams: vec![Beam {
                tokens: Vec::new(),
                score: 0.0,
                finish_reason: None,
            }],
            steps: 0,
        })
    }

    pub fn width(&self) -> usize {
        self.config.beam_width
    }

    /// Current beams, best first
    pub fn beams(&self) -> &[Beam] {
        &self.beams
    }

    pub fn best(&self) -> &Beam {
        &self.beams[0]
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Finished when every beam is, or when the best beam is: scores only
    /// decrease as beams grow, so a finished leader cannot be overtaken.
    pub fn is_finished(&self) -> bool {
        self.beams[0].is_finished() || self.beams.iter().all(Beam::is_finished)
    }

    /// Advance with one score vector per current beam (ignored for finished beams).
    pub fn step(&mut self, beam_scores: &[Vec<f32>], vocab_size: usize) -> Result<BeamStep> {
        if self.is_finished() {
            return Err(CobaltError::invalid_state("beam search already finished"));
        }
        if beam_scores.len() != self.beams.len() {
            return Err(CobaltError::invalid_parameter(format!(
                "expected scores for {} beams, got {}",
                self.beams.len(),
                beam_scores.len()
            )));
        }

        let width = self.config.beam_width;
        let mut candidates = Vec::new();
        for (parent, (beam, scores)) in self.beams.iter().zip(beam_scores).enumerate() {
            if beam.is_finished() {
                candidates.push(Candidate {
                    parent,
                    token: None,
                    score: beam.score,
                });
                continue;
            }
            let working = prepare_scores(&self.chain, scores, vocab_size, &beam.tokens)?;
            let logprobs = log_softmax(&working)?;
            for index in descending_order(&logprobs)
                .into_iter()
                .filter(|&i| logprobs[i].is_finite())
                .take(width)
            {
                candidates.push(Candidate {
                    parent,
                    token: Some(TokenId::from(index)),
                    score: beam.score + logprobs[index],
                });
            }
        }

        // stable: earlier parents win ties
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(width);

        let mut next = Vec::with_capacity(candidates.len());
        let mut parents = Vec::with_capacity(candidates.len());
        let mut tokens = Vec::with_capacity(candidates.len());
        for c in candidates {
            let parent = &self.beams[c.parent];
            let beam = match c.token {
                Some(token) => {
                    let mut seq = parent.tokens.clone();
                    seq.push(token);
                    let finish_reason = finish_reason(token, seq.len(), &self.config);
                    Beam {
                        tokens: seq,
                        score: c.score,
                        finish_reason,
                    }
                }
                None => parent.clone(),
            };
            parents.push(c.parent);
            tokens.push(c.token);
            next.push(beam);
        }

        self.beams = next;
        self.steps += 1;
        let is_finished = self.is_finished();
        if is_finished {
            debug!(
                "beam search finished after {} steps, best score {:.4}",
                self.steps, self.beams[0].score
            );
        }
        Ok(BeamStep {
            parents,
            tokens,
            is_finished,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(width: usize, max_tokens: usize) -> SamplingConfig {
        SamplingConfig {
            beam_width: width,
            max_tokens,
            stop_tokens: vec![TokenId(0)],
            ..Default::default()
        }
    }

    fn ln(p: &[f32]) -> Vec<f32> {
        p.iter().map(|v| v.ln()).collect()
    }

    #[test]
    fn first_step_splits_the_root_beam() {
        let mut search = BeamSearch::new(config(2, 5)).unwrap();
        let step = search.step(&[ln(&[0.1, 0.5, 0.4])], 3).unwrap();
        assert_eq!(step.parents, vec![0, 0]);
        assert_eq!(step.tokens, vec![Some(TokenId(1)), Some(TokenId(2))]);
        assert!(!step.is_finished);
        assert_eq!(search.beams().len(), 2);
    }

    #[test]
    fn beams_are_reranked_by_cumulative_score() {
        let mut search = BeamSearch::new(config(2, 5)).unwrap();
        search.step(&[ln(&[0.1, 0.5, 0.4])], 3).unwrap();
        // beam 0 (token 1) is unsure next, beam 1 (token 2) is certain
        let step = search
            .step(&[ln(&[0.1, 0.45, 0.45]), ln(&[0.02, 0.96, 0.02])], 3)
            .unwrap();
        assert_eq!(step.parents[0], 1);
        assert_eq!(search.best().tokens, vec![TokenId(2), TokenId(1)]);
    }

    #[test]
    fn stop_token_finishes_a_beam() {
        let mut search = BeamSearch::new(config(1, 5)).unwrap();
        let step = search.step(&[ln(&[0.9, 0.05, 0.05])], 3).unwrap();
        assert!(step.is_finished);
        assert_eq!(search.best().finish_reason, Some(FinishReason::Stop));
        assert!(search.step(&[ln(&[0.9, 0.05, 0.05])], 3).is_err());
    }

    #[test]
    fn max_length_finishes_every_beam() {
        let mut search = BeamSearch::new(config(2, 2)).unwrap();
        search.step(&[ln(&[0.1, 0.5, 0.4])], 3).unwrap();
        let step = search
            .step(&[ln(&[0.1, 0.5, 0.4]), ln(&[0.1, 0.5, 0.4])], 3)
            .unwrap();
        assert!(step.is_finished);
        assert!(search
            .beams()
            .iter()
            .all(|b| b.finish_reason == Some(FinishReason::Length) && b.tokens.len() == 2));
    }

    #[test]
    fn wrong_number_of_score_vectors_is_rejected() {
        let mut search = BeamSearch::new(config(2, 5)).unwrap();
        assert!(search.step(&[], 3).is_err());
    }
}
