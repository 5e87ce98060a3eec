use crate::{engine::Tokenizer, sampler::add_in_place, Token};

/// Bias used to take a token out of the running.
pub const BAN_BIAS: f32 = -100.0;

/// Openers of canned refusals; only pushed down for the first few tokens
/// of a response.
pub const DEFAULT_REFUSAL_PHRASES: &[&str] = &[
    "I", " I", " cannot", "cannot", "Cannot", " can't", "can't", "'t", "*I", "*i", "As",
    "*ahem*", "ahem", "shut down", "clears", " refuse", "Note", "refuses", "[", " [", "\n\n",
    "\n", "However",
];

/// Punctuation that the refusal phrases tokenize into but which is fine to
/// start a response with.
const ALLOWED_OPENERS: &[&str] = &["*", " *", "\"", " \"", ".", "-"];

/// Read-only bias vectors shared by every request of a model.
pub struct BiasTables {
    refusals: Vec<f32>,
    newlines: Vec<f32>,
    caps: Vec<f32>,
}

impl BiasTables {
    pub fn build(tokenizer: &dyn Tokenizer, eot_token: Token, refusal_phrases: &[String]) -> Self {
        let n_vocab = tokenizer.vocab_size();
        let mut refusals = vec![0.0f32; n_vocab];
        let mut newlines = vec![0.0f32; n_vocab];
        let mut caps = vec![0.0f32; n_vocab];

        for tok in 0..n_vocab {
            let text = tokenizer.token_text(tok as Token);
            if text.contains('\n') {
                newlines[tok] = BAN_BIAS;
            }
            if text.chars().any(|c| c.is_ascii_uppercase()) {
                caps[tok] = BAN_BIAS;
            }
        }

        let mut num_banned = 0;
        for phrase in refusal_phrases {
            for tok in tokenizer.encode(phrase) {
                if let Some(slot) = refusals.get_mut(tok as usize) {
                    *slot = BAN_BIAS;
                    num_banned += 1;
                }
            }
        }
        if let Some(slot) = refusals.get_mut(eot_token as usize) {
            *slot = BAN_BIAS;
        }
        for sym in ALLOWED_OPENERS {
            if let Some(&tok) = tokenizer.encode(sym).first() {
                if let Some(slot) = refusals.get_mut(tok as usize) {
                    *slot = 0.0;
                }
            }
        }

        log::debug!(
            "bias tables: {} refusal tokens from {} phrases; vocab {}",
            num_banned,
            refusal_phrases.len(),
            n_vocab
        );

        BiasTables {
            refusals,
            newlines,
            caps,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.refusals.len()
    }

    pub fn refusals(&self) -> &[f32] {
        &self.refusals
    }

    pub fn prevent_refusals(&self, logits: &mut [f32]) {
        add_in_place(logits, &self.refusals);
    }

    pub fn prevent_newlines(&self, logits: &mut [f32]) {
        add_in_place(logits, &self.newlines);
    }

    pub fn prevent_caps(&self, logits: &mut [f32]) {
        add_in_place(logits, &self.caps);
    }
}
