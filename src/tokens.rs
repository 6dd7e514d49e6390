//! Token id to display-bytes decoding for the lookup service

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;

/// Renders a single token id as raw bytes
pub trait TokenDecoder: Send + Sync {
    fn decode_token(&self, id: u32) -> Result<Vec<u8>>;

    fn decode_tokens(&self, ids: &[u32]) -> Result<Vec<Vec<u8>>> {
        ids.iter().map(|&id| self.decode_token(id)).collect()
    }
}

/// GPT-2 style byte-to-unicode table.
///
/// Printable bytes map to themselves; the remaining 68 bytes are shifted to
/// code points from U+0100 upward so every byte has a visible character.
fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut printable: Vec<u8> = (b'!'..=b'~').collect();
    printable.extend(0xA1u8..=0xAC);
    printable.extend(0xAEu8..=0xFF);

    let mut table: Vec<(u8, char)> = printable.iter().map(|&b| (b, char::from(b))).collect();
    let mut shifted = 0u32;
    for b in 0..=255u8 {
        if !printable.contains(&b) {
            // 256 + n is always a valid scalar value
            let c = char::from_u32(256 + shifted).unwrap_or(char::REPLACEMENT_CHARACTER);
            table.push((b, c));
            shifted += 1;
        }
    }
    table
}

/// Decoder for byte-level BPE vocabularies (GPT-2 and relatives)
pub struct ByteLevelDecoder {
    tokenizer: Tokenizer,
    byte_decoder: HashMap<char, u8>,
}

impl ByteLevelDecoder {
    pub fn new(tokenizer: Tokenizer) -> Self {
        let byte_decoder = bytes_to_unicode().into_iter().map(|(b, c)| (c, b)).collect();
        Self {
            tokenizer,
            byte_decoder,
        }
    }

    /// Load `tokenizer.json` from a local file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        Ok(Self::new(tokenizer))
    }

    /// Download `tokenizer.json` for a model from HuggingFace
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        Self::from_file(tokenizer_path)
    }

    /// Map a byte-level token string back to its raw bytes
    fn token_bytes(&self, token: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(token.len());
        for c in token.chars() {
            match self.byte_decoder.get(&c) {
                Some(&b) => bytes.push(b),
                None => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        bytes
    }
}

impl TokenDecoder for ByteLevelDecoder {
    fn decode_token(&self, id: u32) -> Result<Vec<u8>> {
        let token = self
            .tokenizer
            .id_to_token(id)
            .ok_or_else(|| anyhow::anyhow!("Token id {id} not in vocabulary"))?;
        Ok(self.token_bytes(&token))
    }
}

/// Renders ids as their decimal text; for result sets without a tokenizer
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDecoder;

impl TokenDecoder for IdentityDecoder {
    fn decode_token(&self, id: u32) -> Result<Vec<u8>> {
        Ok(id.to_string().into_bytes())
    }
}
