use std::path::Path;

use rand::rngs::StdRng;
use rand::Rng;
use tokenizers::Tokenizer;

/// Sentence-start marker. Never a masking candidate.
pub const CLS_TOKEN: &str = "[CLS]";
/// Segment separator. Never a masking candidate.
pub const SEP_TOKEN: &str = "[SEP]";
/// Corruption marker substituted for masked answer tokens.
pub const MASK_TOKEN: &str = "[MASK]";
/// Padding token. Must map to id 0 so zero-padded id tensors read as padding.
pub const PAD_TOKEN: &str = "[PAD]";
/// Unknown-word token, also used as the visual-slot placeholder.
pub const UNK_TOKEN: &str = "[UNK]";

/// Id the padding token is required to map to.
pub const PAD_ID: u32 = 0;

const MARKERS: [&str; 5] = [PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN, MASK_TOKEN];

/// Wrapper around a `tokenizers` vocabulary exposing the two operations the
/// encoder needs: sub-word segmentation into string tokens and token→id
/// indexing over a closed vocabulary with reserved markers.
pub struct TokenizerWrapper {
    inner: Tokenizer,
    unk_id: u32,
    /// Non-marker vocabulary words sorted by id, for uniform random draws.
    vocab_words: Vec<String>,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Self::from_tokenizer(inner)
    }

    fn from_tokenizer(inner: Tokenizer) -> anyhow::Result<Self> {
        for marker in MARKERS {
            if inner.token_to_id(marker).is_none() {
                anyhow::bail!("vocabulary is missing the reserved marker {marker}");
            }
        }
        if let Some(id) = inner.token_to_id(PAD_TOKEN) {
            if id != PAD_ID {
                anyhow::bail!("{PAD_TOKEN} maps to id {id}, expected {PAD_ID}");
            }
        }
        let unk_id = inner.token_to_id(UNK_TOKEN).expect("marker checked above");

        let mut words: Vec<(u32, String)> = inner
            .get_vocab(true)
            .into_iter()
            .filter(|(word, _)| !MARKERS.contains(&word.as_str()))
            .map(|(word, id)| (id, word))
            .collect();
        words.sort();
        let vocab_words: Vec<String> = words.into_iter().map(|(_, word)| word).collect();
        if vocab_words.is_empty() {
            anyhow::bail!("vocabulary contains no words beyond the reserved markers");
        }

        Ok(Self {
            inner,
            unk_id,
            vocab_words,
        })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let mut vocab = std::collections::HashMap::new();
        for (id, marker) in MARKERS.iter().enumerate() {
            vocab.insert(marker.to_string(), id as u32);
        }
        for i in 0..vocab_size {
            vocab.insert(format!("w{i}"), (MARKERS.len() + i) as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token(UNK_TOKEN.into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        Self::from_tokenizer(tokenizer).expect("test tokenizer satisfies the marker contract")
    }

    /// Segment raw text into string tokens.
    pub fn tokenize(&self, text: &str) -> anyhow::Result<Vec<String>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        Ok(encoding.get_tokens().to_vec())
    }

    /// Map string tokens to integer ids; unknown tokens map to the [UNK] id.
    pub fn index(&self, tokens: &[String]) -> Vec<u32> {
        tokens
            .iter()
            .map(|t| self.inner.token_to_id(t).unwrap_or(self.unk_id))
            .collect()
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Uniform draw of a non-marker vocabulary word, for mask corruption.
    pub fn random_word(&self, rng: &mut StdRng) -> String {
        self.vocab_words[rng.gen_range(0..self.vocab_words.len())].clone()
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn pad_maps_to_zero() {
        let tok = TokenizerWrapper::for_testing(16);
        assert_eq!(tok.token_id(PAD_TOKEN), Some(PAD_ID));
    }

    #[test]
    fn markers_are_indexable() {
        let tok = TokenizerWrapper::for_testing(16);
        for marker in MARKERS {
            assert!(tok.token_id(marker).is_some(), "missing {marker}");
        }
    }

    #[test]
    fn tokenize_then_index_roundtrips_known_words() {
        let tok = TokenizerWrapper::for_testing(16);
        let tokens = tok.tokenize("w0 w3 w15").expect("tokenize");
        assert_eq!(tokens, vec!["w0", "w3", "w15"]);
        let ids = tok.index(&tokens);
        assert_eq!(ids, vec![5, 8, 20]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tok = TokenizerWrapper::for_testing(4);
        let ids = tok.index(&["quux".to_string()]);
        assert_eq!(ids, vec![tok.token_id(UNK_TOKEN).unwrap()]);
    }

    #[test]
    fn random_word_never_yields_a_marker() {
        let tok = TokenizerWrapper::for_testing(8);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let word = tok.random_word(&mut rng);
            assert!(!MARKERS.contains(&word.as_str()), "drew marker {word}");
        }
    }
}
