//! # llama-tokenizer
//!
//! Tokenization and streaming detokenization for llama.rs sessions.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends
//! - A reference byte-level tokenizer for the CPU reference engine and tests
//! - [`Utf8Assembler`], which turns per-token byte pieces into complete characters

pub mod utf8;

pub use utf8::{is_complete_utf8, Utf8Assembler};

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(i32),
    #[error("Encoding error: {0}")]
    EncodingError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token IDs.
    ///
    /// `add_special` prepends the beginning-of-sequence token. `parse_special`
    /// lets special-token markup in `text` map to the special IDs instead of
    /// being tokenized as plain text.
    fn encode(&self, text: &str, add_special: bool, parse_special: bool)
        -> TokenizerResult<Vec<i32>>;

    /// Raw bytes of one token. May be a fragment of a multi-byte character.
    fn token_to_piece(&self, token: i32) -> TokenizerResult<Vec<u8>>;

    /// Whether `token` ends generation.
    fn is_eog(&self, token: i32) -> bool;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Decode a complete sequence of tokens into text.
    fn decode(&self, tokens: &[i32]) -> TokenizerResult<String> {
        let mut bytes = Vec::new();
        for &token in tokens {
            bytes.extend(self.token_to_piece(token)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Reference tokenizer: one token per byte, plus BOS and EOS.
///
/// - IDs `0..=255` are the raw bytes
/// - [`ByteTokenizer::BOS`] and [`ByteTokenizer::EOS`] render as nothing
/// - With `parse_special`, the literal markers `<s>` and `</s>` map to BOS/EOS
///
/// Deterministic and lossless, which makes prefix reuse easy to reason about
/// in tests: re-tokenizing a previous prompt plus its response yields exactly
/// the prompt tokens followed by the generated tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const BOS: i32 = 256;
    pub const EOS: i32 = 257;
    pub const VOCAB_SIZE: usize = 258;

    const BOS_MARKER: &'static str = "<s>";
    const EOS_MARKER: &'static str = "</s>";

    pub fn new() -> Self {
        Self
    }

    fn push_bytes(ids: &mut Vec<i32>, text: &str) {
        ids.extend(text.bytes().map(i32::from));
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> TokenizerResult<Vec<i32>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special {
            ids.push(Self::BOS);
        }
        if !parse_special {
            Self::push_bytes(&mut ids, text);
            return Ok(ids);
        }

        let mut rest = text;
        while !rest.is_empty() {
            let next = [
                (rest.find(Self::EOS_MARKER), Self::EOS_MARKER, Self::EOS),
                (rest.find(Self::BOS_MARKER), Self::BOS_MARKER, Self::BOS),
            ]
            .into_iter()
            .filter_map(|(at, marker, id)| at.map(|at| (at, marker, id)))
            .min_by_key(|(at, _, _)| *at);

            match next {
                Some((at, marker, id)) => {
                    Self::push_bytes(&mut ids, &rest[..at]);
                    ids.push(id);
                    rest = &rest[at + marker.len()..];
                }
                None => {
                    Self::push_bytes(&mut ids, rest);
                    break;
                }
            }
        }
        Ok(ids)
    }

    fn token_to_piece(&self, token: i32) -> TokenizerResult<Vec<u8>> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            Self::BOS | Self::EOS => Ok(Vec::new()),
            _ => Err(TokenizerError::InvalidToken(token)),
        }
    }

    fn is_eog(&self, token: i32) -> bool {
        token == Self::EOS
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_adds_bos() {
        let tok = ByteTokenizer::new();
        assert_eq!(
            tok.encode("hi", true, false).unwrap(),
            vec![ByteTokenizer::BOS, 104, 105]
        );
    }

    #[test]
    fn encode_empty_string() {
        let tok = ByteTokenizer::new();
        assert!(tok.encode("", false, false).unwrap().is_empty());
        assert_eq!(tok.encode("", true, true).unwrap(), vec![ByteTokenizer::BOS]);
    }

    #[test]
    fn encode_parses_special_markers() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("a</s><s>b", false, true).unwrap();
        assert_eq!(ids, vec![97, ByteTokenizer::EOS, ByteTokenizer::BOS, 98]);
    }

    #[test]
    fn encode_without_parse_special_keeps_markup_as_text() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("</s>", false, false).unwrap();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains(&ByteTokenizer::EOS));
    }

    #[test]
    fn decode_roundtrip_multibyte() {
        let tok = ByteTokenizer::new();
        let original = "naïve café 🦀";
        let ids = tok.encode(original, true, false).unwrap();
        assert_eq!(tok.decode(&ids).unwrap(), original);
    }

    #[test]
    fn specials_render_empty() {
        let tok = ByteTokenizer::new();
        assert!(tok.token_to_piece(ByteTokenizer::EOS).unwrap().is_empty());
        assert!(tok.is_eog(ByteTokenizer::EOS));
        assert!(!tok.is_eog(ByteTokenizer::BOS));
    }

    #[test]
    fn invalid_token_errors() {
        let tok = ByteTokenizer::new();
        assert_eq!(
            tok.token_to_piece(999).unwrap_err(),
            TokenizerError::InvalidToken(999)
        );
        assert_eq!(tok.token_to_piece(-1).unwrap_err(), TokenizerError::InvalidToken(-1));
    }
}
