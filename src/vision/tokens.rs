//! Recognizer token filtering and grouping into text lines

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::vision::ocr::Token;

/// How a line's bounding envelope grows as tokens are merged in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopePolicy {
    /// True bounding box of the member tokens
    #[default]
    Geometric,
    /// Reproduces the first-generation grouping rule: `top` keeps the largest
    /// top, `right` the largest left edge, and `bottom` ends up as the latest
    /// token's top. Anchors computed this way sit near the start of the last word.
    Legacy,
}

/// Tokens of one layout block merged into a single span
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextLine {
    /// Member token texts joined by single spaces
    pub text: String,
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    /// Mean confidence of the member tokens
    pub confidence: Option<f32>,
    pub block_id: u32,
    /// Number of member tokens
    pub token_count: usize,
}

impl TextLine {
    fn start(token: &Token, block_id: u32, policy: EnvelopePolicy) -> Self {
        let (right, bottom) = match policy {
            EnvelopePolicy::Geometric => (token.right(), token.bottom()),
            EnvelopePolicy::Legacy => (token.left, token.top),
        };
        Self {
            text: token.text.clone(),
            left: token.left,
            top: token.top,
            right,
            bottom,
            confidence: None,
            block_id,
            token_count: 1,
        }
    }

    fn extend(&mut self, token: &Token, delimiter: &str, policy: EnvelopePolicy) {
        self.text.push_str(delimiter);
        self.text.push_str(&token.text);
        self.token_count += 1;
        self.left = self.left.min(token.left);

        match policy {
            EnvelopePolicy::Geometric => {
                self.top = self.top.min(token.top);
                self.right = self.right.max(token.right());
                self.bottom = self.bottom.max(token.bottom());
            }
            EnvelopePolicy::Legacy => {
                self.top = self.top.max(token.top);
                self.right = self.right.max(token.left);
                self.bottom = self.top.min(token.top);
            }
        }
    }
}

/// Drops tokens below a confidence threshold
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenFilter {
    /// Minimum confidence (0 - 100), inclusive
    pub min_confidence: f32,
}

impl TokenFilter {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    /// Keep tokens with a confidence at or above the threshold
    ///
    /// Tokens without a confidence are dropped.
    pub fn filter(&self, tokens: Vec<Token>) -> Vec<Token> {
        let before = tokens.len();
        let kept: Vec<Token> = tokens
            .into_iter()
            .filter(|t| matches!(t.confidence, Some(c) if c >= self.min_confidence))
            .collect();
        debug!(
            "Confidence filter kept {} of {} tokens (min {})",
            kept.len(),
            before,
            self.min_confidence
        );
        kept
    }
}

/// Merges tokens sharing a block id into ordered lines
#[derive(Debug, Clone)]
pub struct TokenGrouper {
    pub policy: EnvelopePolicy,
    pub delimiter: String,
}

impl Default for TokenGrouper {
    fn default() -> Self {
        Self::new(EnvelopePolicy::default())
    }
}

impl TokenGrouper {
    pub fn new(policy: EnvelopePolicy) -> Self {
        Self {
            policy,
            delimiter: " ".to_string(),
        }
    }

    /// Group tokens by block id, in order of each block's first token
    ///
    /// Blank tokens and tokens without a block id are skipped.
    pub fn group(&self, tokens: &[Token]) -> Vec<TextLine> {
        let mut lines: Vec<TextLine> = Vec::new();
        let mut confidence_sums: Vec<(f32, usize)> = Vec::new();
        let mut index_by_block: HashMap<u32, usize> = HashMap::new();

        for token in tokens.iter().filter(|t| !t.is_blank()) {
            let Some(block_id) = token.block_id else {
                continue;
            };

            let index = match index_by_block.get(&block_id) {
                Some(&index) => {
                    lines[index].extend(token, &self.delimiter, self.policy);
                    index
                }
                None => {
                    lines.push(TextLine::start(token, block_id, self.policy));
                    confidence_sums.push((0.0, 0));
                    index_by_block.insert(block_id, lines.len() - 1);
                    lines.len() - 1
                }
            };

            if let Some(c) = token.confidence {
                confidence_sums[index].0 += c;
                confidence_sums[index].1 += 1;
            }
        }

        for (line, (sum, count)) in lines.iter_mut().zip(confidence_sums) {
            line.confidence = (count > 0).then(|| sum / count as f32);
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, conf: Option<f32>, left: u32, top: u32, block: Option<u32>) -> Token {
        Token {
            text: text.to_string(),
            confidence: conf,
            left,
            top,
            width: 30,
            height: 10,
            block_id: block,
        }
    }

    #[test]
    fn test_filter_threshold_is_inclusive() {
        let tokens = vec![
            token("a", Some(59.9), 0, 0, Some(1)),
            token("b", Some(60.0), 0, 0, Some(1)),
            token("c", Some(95.0), 0, 0, Some(1)),
            token("d", None, 0, 0, Some(1)),
        ];

        let kept = TokenFilter::new(60.0).filter(tokens);
        let texts: Vec<&str> = kept.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn test_group_by_block_in_encounter_order() {
        let tokens = vec![
            token("Date", Some(90.0), 10, 100, Some(2)),
            token("First", Some(80.0), 10, 20, Some(1)),
            token("of", Some(70.0), 50, 100, Some(2)),
            token("Name", Some(60.0), 50, 20, Some(1)),
            token("birth", Some(50.0), 80, 100, Some(2)),
        ];

        let lines = TokenGrouper::default().group(&tokens);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Date of birth");
        assert_eq!(lines[0].block_id, 2);
        assert_eq!(lines[1].text, "First Name");
        assert_eq!(lines[1].token_count, 2);
        assert!((lines[1].confidence.unwrap() - 70.0).abs() < 1e-4);
    }

    #[test]
    fn test_group_text_length_and_left_bound() {
        let tokens = vec![
            token("Surname", Some(90.0), 40, 12, Some(3)),
            token("or", Some(90.0), 5, 14, Some(3)),
            token("family", Some(90.0), 120, 10, Some(3)),
        ];

        for policy in [EnvelopePolicy::Geometric, EnvelopePolicy::Legacy] {
            let lines = TokenGrouper::new(policy).group(&tokens);
            let line = &lines[0];

            let expected: usize =
                tokens.iter().map(|t| t.text.len()).sum::<usize>() + tokens.len() - 1;
            assert_eq!(line.text.len(), expected);
            assert!(tokens.iter().all(|t| line.left <= t.left));
        }
    }

    #[test]
    fn test_geometric_envelope() {
        let tokens = vec![
            token("Home", Some(90.0), 40, 12, Some(1)),
            token("address", Some(90.0), 80, 10, Some(1)),
        ];

        let line = &TokenGrouper::new(EnvelopePolicy::Geometric).group(&tokens)[0];
        assert_eq!((line.left, line.top, line.right, line.bottom), (40, 10, 110, 22));
    }

    #[test]
    fn test_geometric_envelope_saturates() {
        let tokens = vec![
            token("Wide", Some(90.0), 10, 10, Some(1)),
            Token {
                width: 20,
                ..token("Edge", Some(90.0), u32::MAX - 5, 12, Some(1))
            },
        ];

        let line = &TokenGrouper::new(EnvelopePolicy::Geometric).group(&tokens)[0];
        assert_eq!(line.left, 10);
        assert_eq!(line.right, u32::MAX);
        assert_eq!(line.bottom, 22);

        let alone = TokenGrouper::default().group(&tokens[1..]);
        assert_eq!(alone[0].right, u32::MAX);
    }

    #[test]
    fn test_legacy_envelope() {
        let tokens = vec![
            token("Home", Some(90.0), 40, 12, Some(1)),
            token("address", Some(90.0), 80, 10, Some(1)),
            token("line", Some(90.0), 20, 15, Some(1)),
        ];

        let line = &TokenGrouper::new(EnvelopePolicy::Legacy).group(&tokens)[0];
        assert_eq!(line.left, 20);
        assert_eq!(line.top, 15);
        assert_eq!(line.right, 80);
        // min(max(top), latest top)
        assert_eq!(line.bottom, 15);
    }

    #[test]
    fn test_blank_and_unblocked_tokens_skipped() {
        let tokens = vec![
            token("   ", Some(90.0), 0, 0, Some(1)),
            token("", Some(90.0), 0, 0, Some(1)),
            token("Orphan", Some(90.0), 0, 0, None),
            token("Kept", Some(90.0), 0, 0, Some(1)),
        ];

        let lines = TokenGrouper::default().group(&tokens);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "Kept");
    }
}
