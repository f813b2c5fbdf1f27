//! Token stream layout.
//!
//! Every sequence the model sees has the shape
//!
//! ```text
//! <INPUT> command tokens <OUTPUT> script tokens <END> <PAD>...
//! ```
//!
//! The byte-level BPE vocabulary itself lives outside this crate behind
//! [`TextCodec`].

use crate::error::Result;

/// Start of the natural-language command.
pub const INPUT: u32 = 0;
/// Start of the generated script.
pub const OUTPUT: u32 = 1;
/// End of the generated script.
pub const END: u32 = 2;
/// Batch padding.
pub const PAD: u32 = 3;

/// Literal output signalling that a request should go to a larger model.
pub const PASS_TO_CLOUD: &str = "PASS_TO_CLOUD";

/// Text ⇄ token conversion provided by an external tokenizer.
pub trait TextCodec {
    /// Encode text into content token ids (no special tokens added).
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back into text.
    fn decode(&self, tokens: &[u32]) -> Result<String>;
}

/// Whether a token is one of the four reserved ids.
pub fn is_special(token: u32) -> bool {
    token <= PAD
}

/// Build the generation prompt `<INPUT> command <OUTPUT>`.
pub fn prompt(command: &[u32]) -> Vec<u32> {
    let mut tokens = Vec::with_capacity(command.len() + 2);
    tokens.push(INPUT);
    tokens.extend_from_slice(command);
    tokens.push(OUTPUT);
    tokens
}

/// Build a full training sequence `<INPUT> command <OUTPUT> output <END>`.
pub fn training_sequence(command: &[u32], output: &[u32]) -> Vec<u32> {
    let mut tokens = prompt(command);
    tokens.reserve(output.len() + 1);
    tokens.extend_from_slice(output);
    tokens.push(END);
    tokens
}

/// Positions that contribute to the training loss.
///
/// True strictly after the first OUTPUT token, through and including the
/// first END after it. Everything else (prompt, trailing PAD) is false. A
/// sequence without OUTPUT has no supervised positions; one without END is
/// supervised to its last non-PAD token.
pub fn loss_mask(sequence: &[u32]) -> Vec<bool> {
    let mut mask = vec![false; sequence.len()];
    let Some(output_at) = sequence.iter().position(|&t| t == OUTPUT) else {
        return mask;
    };

    for (i, &token) in sequence.iter().enumerate().skip(output_at + 1) {
        if token == PAD {
            break;
        }
        mask[i] = true;
        if token == END {
            break;
        }
    }
    mask
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Invariant: the mask is exactly the script span plus END.
        #[test]
        fn invariant_mask_matches_layout(
            command in prop::collection::vec(4u32..100, 0..20),
            output in prop::collection::vec(4u32..100, 0..20),
            padding in 0usize..8,
        ) {
            let mut seq = training_sequence(&command, &output);
            seq.extend(std::iter::repeat(PAD).take(padding));
            let mask = loss_mask(&seq);

            prop_assert_eq!(mask.len(), seq.len());
            prop_assert_eq!(mask.iter().filter(|&&m| m).count(), output.len() + 1);

            let first = command.len() + 2;
            for (i, &m) in mask.iter().enumerate() {
                prop_assert_eq!(m, i >= first && i <= first + output.len());
            }
        }
    }
}
