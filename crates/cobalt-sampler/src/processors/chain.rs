//! Ordered composition of processors

use cobalt_types::{Result, TokenId};

use super::LogitsProcessor;

/// Applies processors in insertion order
#[derive(Debug, Default)]
pub struct ProcessorChain {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<P>(&mut self, processor: P) -> &mut Self
    where
        P: LogitsProcessor + 'static,
    {
        self.processors.push(Box::new(processor));
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Processor names in application order
    pub fn names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

impl LogitsProcessor for ProcessorChain {
    fn process(&self, logits: &mut [f32], history: &[TokenId]) -> Result<()> {
        for processor in &self.processors {
            processor.process(logits, history)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "chain"
    }
}
