//! Contrastive dataset construction for control-vector training
//!
//! Turns a pool of neutral factual statements into (positive, negative)
//! prompt pairs for each emotion axis. Every statement is truncated at
//! every useful token prefix so the trainer sees a spectrum of
//! partial-sentence contexts, not just complete sentences; the pair differs
//! only in the persona instruction's emotion label, which is what isolates
//! the emotional direction in activation space.

use anyhow::Result;
use tracing::info;

/// Instruction-turn open marker (Mistral-Instruct convention).
pub const USER_TAG: &str = "[INST]";
/// Instruction-turn close marker.
pub const ASST_TAG: &str = "[/INST]";

/// Trailing tokens of each statement that are never exposed. Keeps the
/// contrastive signal about framing rather than letting near-complete
/// statements leak the full fact.
const TAIL_HOLDOUT: usize = 5;

/// Encode/decode seam between the dataset builder and the tokenizer.
///
/// Implemented by `EmoModel`; tests substitute a whitespace codec so the
/// builder is exercised without a model download.
pub trait TokenCodec {
    /// Text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Token ids back to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// One emotion axis: an ordered pair of opposite poles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmotionAxis {
    /// Label intensified by positive weights (e.g. "happy").
    pub positive: String,
    /// Label intensified by negative weights (e.g. "sad").
    pub negative: String,
}

impl EmotionAxis {
    /// Create an axis from its two pole labels.
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }

    /// Bundle key for this axis, e.g. "happy_sad".
    pub fn name(&self) -> String {
        format!("{}_{}", self.positive, self.negative)
    }
}

/// The three axes the service steers along.
pub fn default_axes() -> Vec<EmotionAxis> {
    vec![
        EmotionAxis::new("happy", "sad"),
        EmotionAxis::new("angry", "calm"),
        EmotionAxis::new("disgusted", "interested"),
    ]
}

/// A matched pair of prompts differing only in emotion framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContrastiveExample {
    /// Prompt framed with the axis's positive pole.
    pub positive: String,
    /// Prompt framed with the axis's negative pole.
    pub negative: String,
}

/// Wrap a truncated statement in the persona instruction for `emotion`.
pub fn instruction_template(emotion: &str, suffix: &str) -> String {
    format!(
        "{USER_TAG} Pretend you're a person who is {emotion} while making statements \
         about the world. {ASST_TAG} {suffix}"
    )
}

/// Build the flat contrastive dataset over all statements and axes.
///
/// For each statement, one example per axis at every truncation length
/// `1 ..= len-6`. Statements of six tokens or fewer produce no examples;
/// that is intentional, not an error.
pub fn build_dataset<C: TokenCodec>(
    codec: &C,
    statements: &[String],
    axes: &[EmotionAxis],
) -> Result<Vec<ContrastiveExample>> {
    let mut dataset = Vec::new();
    for statement in statements {
        let tokens = codec.encode(statement)?;
        if tokens.len() <= TAIL_HOLDOUT + 1 {
            continue;
        }
        for i in 1..tokens.len() - TAIL_HOLDOUT {
            let truncated = codec.decode(&tokens[..i])?;
            for axis in axes {
                dataset.push(ContrastiveExample {
                    positive: instruction_template(&axis.positive, &truncated),
                    negative: instruction_template(&axis.negative, &truncated),
                });
            }
        }
    }
    info!(
        "Built {} contrastive examples from {} statements over {} axes",
        dataset.len(),
        statements.len(),
        axes.len()
    );
    Ok(dataset)
}

/// Select the examples belonging to one axis from the flat dataset.
///
/// An example belongs to the axis when its pole labels appear in the
/// expected sides of the pair (or swapped, which the directional training
/// normalizes away by construction of the template).
pub fn partition_axis<'a>(
    dataset: &'a [ContrastiveExample],
    axis: &EmotionAxis,
) -> Vec<&'a ContrastiveExample> {
    dataset
        .iter()
        .filter(|entry| {
            (entry.positive.contains(&axis.positive) && entry.negative.contains(&axis.negative))
                || (entry.positive.contains(&axis.negative)
                    && entry.negative.contains(&axis.positive))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Whitespace word codec: one token per word, ids index a vocab built
    /// on the fly. Mirrors what a real tokenizer does closely enough for
    /// boundary tests.
    pub struct WordCodec;

    impl TokenCodec for WordCodec {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text
                .split_whitespace()
                .enumerate()
                .map(|(i, _)| i as u32)
                .collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            // ids were assigned positionally, so decoding needs the source
            // text; the builder only decodes prefixes of what it encoded.
            // Tests pair this codec with a fixed statement instead.
            Ok(ids.iter().map(|id| format!("w{id}")).collect::<Vec<_>>().join(" "))
        }
    }

    fn statement(n_tokens: usize) -> String {
        (0..n_tokens)
            .map(|i| format!("w{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_six_token_statement_yields_nothing() {
        let axes = default_axes();
        let dataset = build_dataset(&WordCodec, &[statement(6)], &axes).unwrap();
        assert!(dataset.is_empty());
    }

    #[test]
    fn test_seven_token_statement_yields_one_truncation_per_axis() {
        let axes = default_axes();
        let dataset = build_dataset(&WordCodec, &[statement(7)], &axes).unwrap();
        // One truncation length (i = 1), one example per axis.
        assert_eq!(dataset.len(), axes.len());
        for example in &dataset {
            assert!(example.positive.ends_with(&format!("{ASST_TAG} w0")));
        }
    }

    #[test]
    fn test_ten_token_statement_truncation_count() {
        let axes = default_axes();
        let dataset = build_dataset(&WordCodec, &[statement(10)], &axes).unwrap();
        // Truncation lengths 1..=4, three axes each.
        assert_eq!(dataset.len(), 4 * axes.len());
    }

    #[test]
    fn test_pair_differs_only_in_emotion_label() {
        let dataset = build_dataset(
            &WordCodec,
            &[statement(8)],
            &[EmotionAxis::new("happy", "sad")],
        )
        .unwrap();
        for example in &dataset {
            assert_eq!(
                example.positive.replace("happy", "sad"),
                example.negative
            );
        }
    }

    #[test]
    fn test_partition_by_axis_labels() {
        let axes = default_axes();
        let dataset = build_dataset(&WordCodec, &[statement(9)], &axes).unwrap();

        let happy = partition_axis(&dataset, &axes[0]);
        let angry = partition_axis(&dataset, &axes[1]);

        assert_eq!(happy.len() + angry.len() + partition_axis(&dataset, &axes[2]).len(),
                   dataset.len());
        for entry in happy {
            assert!(entry.positive.contains("happy"));
            assert!(entry.negative.contains("sad"));
        }
        for entry in angry {
            assert!(entry.positive.contains("angry"));
        }
    }

    #[test]
    fn test_axis_name() {
        assert_eq!(EmotionAxis::new("happy", "sad").name(), "happy_sad");
    }
}
