//! Token-to-text rendering

use cobalt_types::TokenId;

/// Turns generated token ids into response text
pub trait Detokenizer: Send + Sync {
    fn decode(&self, tokens: &[TokenId]) -> String;
}

/// Renders ids as space-separated numbers; used when no tokenizer is attached
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenIdRenderer;

impl Detokenizer for TokenIdRenderer {
    fn decode(&self, tokens: &[TokenId]) -> String {
        tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
