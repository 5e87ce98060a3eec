use crate::{
    bias::{BiasTables, DEFAULT_REFUSAL_PHRASES},
    decoder::{new_decoder_pool, DecoderPool},
    engine::Tokenizer,
    pool::BufferPool,
    temperature::TemperatureBank,
    Token,
};
use anyhow::{bail, Result};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Scale vectors generated up front for every temperature bucket.
    pub noise_depth: usize,
    /// Phrases whose tokens are pushed down at the start of a response.
    pub refusal_phrases: Vec<String>,
    /// Seed for the temperature noise; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            noise_depth: 2,
            refusal_phrases: DEFAULT_REFUSAL_PHRASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            seed: None,
        }
    }
}

/// Everything about the loaded model that samplers and requests share.
/// Built once and handed around as `Arc<ModelContext>`.
pub struct ModelContext {
    vocab_size: usize,
    eot_token: Token,
    tokenizer: Arc<dyn Tokenizer>,
    buffers: BufferPool,
    decoders: DecoderPool,
    bias: BiasTables,
    noise: TemperatureBank,
}

impl ModelContext {
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        eot_token: Token,
        options: ContextOptions,
    ) -> Result<Arc<Self>> {
        let vocab_size = tokenizer.vocab_size();
        if vocab_size == 0 {
            bail!("empty vocabulary");
        }
        if eot_token as usize >= vocab_size {
            bail!(
                "end-of-turn token {} outside of vocabulary of {}",
                eot_token,
                vocab_size
            );
        }

        let bias = BiasTables::build(tokenizer.as_ref(), eot_token, &options.refusal_phrases);
        let noise = TemperatureBank::new(vocab_size, eot_token, options.noise_depth, options.seed)?;

        log::info!("model context: vocab {}, eot {}", vocab_size, eot_token);

        Ok(Arc::new(ModelContext {
            vocab_size,
            eot_token,
            tokenizer,
            buffers: BufferPool::new(vocab_size),
            decoders: new_decoder_pool(),
            bias,
            noise,
        }))
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn eot_token(&self) -> Token {
        self.eot_token
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn decoders(&self) -> &DecoderPool {
        &self.decoders
    }

    pub fn bias(&self) -> &BiasTables {
        &self.bias
    }

    pub fn noise(&self) -> &TemperatureBank {
        &self.noise
    }
}
