//! Generated tokens and streaming text decoding

use encoding_rs::{CoderResult, Decoder, UTF_8};

/// Identifier of a vocabulary entry
pub type TokenId = i32;

/// Token for a throwaway evaluation: BOS, else EOS, else the first entry
#[cfg_attr(not(feature = "llama"), allow(dead_code))]
pub(crate) fn warmup_token(bos: TokenId, eos: TokenId) -> TokenId {
    // llama.cpp reports a missing special token as -1
    const TOKEN_NULL: TokenId = -1;
    [bos, eos]
        .into_iter()
        .find(|&token| token != TOKEN_NULL)
        .unwrap_or(0)
}

/// One step of generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Text produced by this step
    ///
    /// May be empty while a multi-byte character is split across tokens, and
    /// on the final step unless buffered bytes were flushed.
    pub text: String,
    /// Whether generation has ended
    pub is_end: bool,
    /// Zero-based index of this step within the current turn
    pub index: usize,
}

impl Token {
    pub(crate) fn end(text: String, index: usize) -> Self {
        Self {
            text,
            is_end: true,
            index,
        }
    }
}

/// Turns token pieces into text without splitting UTF-8 sequences
///
/// Tokenizers routinely cut a multi-byte character across two pieces, so
/// bytes are buffered until a complete character is available.
pub(crate) struct PieceDecoder {
    decoder: Decoder,
}

impl PieceDecoder {
    pub(crate) fn new() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
        }
    }

    /// Append a piece and return whatever text it completes
    pub(crate) fn push(&mut self, piece: &[u8]) -> String {
        self.decode(piece, false)
    }

    /// Flush buffered bytes; an incomplete sequence becomes U+FFFD
    pub(crate) fn finish(&mut self) -> String {
        let tail = self.decode(&[], true);
        self.reset();
        tail
    }

    pub(crate) fn reset(&mut self) {
        self.decoder = UTF_8.new_decoder_without_bom_handling();
    }

    fn decode(&mut self, mut bytes: &[u8], last: bool) -> String {
        let mut out = String::new();
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(bytes.len())
                .unwrap_or(bytes.len() * 3 + 4);
            out.reserve(needed);
            let (result, read, _) = self.decoder.decode_to_string(bytes, &mut out, last);
            bytes = &bytes[read..];
            if matches!(result, CoderResult::InputEmpty) {
                return out;
            }
        }
    }
}

impl std::fmt::Debug for PieceDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceDecoder").finish_non_exhaustive()
    }
}
