//! Approximate token counting.
//!
//! Uses a process-cached cl100k encoder. Counts are approximations of the
//! provider's own tokenizer, good enough for bundle validation and for
//! fallback accounting when a stream terminates without usable usage.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base};

fn encoder() -> &'static CoreBPE {
    static ENCODER: OnceLock<CoreBPE> = OnceLock::new();
    ENCODER.get_or_init(|| cl100k_base().expect("embedded cl100k vocabulary always loads"))
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    encoder().encode_ordinary(text).len()
}
