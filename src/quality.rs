//! Text metrics and composite quality score for processed documents.
//!
//! Used when the processing step hands over cleaned text without its own
//! scores. The score is a sum of banded contributions (length, sentence
//! shape, readability, vocabulary) capped at 1.0.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct TextMetrics {
    pub word_count: i64,
    pub sentence_count: i64,
    pub avg_sentence_length: f64,
    /// Flesch reading ease.
    pub readability: f64,
    /// Unique alphabetic words over total words.
    pub vocabulary_diversity: f64,
}

pub fn analyze(text: &str) -> TextMetrics {
    let words: Vec<&str> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();
    let word_count = words.len() as i64;
    let sentence_count = count_sentences(text, word_count);

    let avg_sentence_length = word_count as f64 / sentence_count.max(1) as f64;

    let readability = if word_count == 0 {
        0.0
    } else {
        let syllables: usize = words.iter().map(|w| count_syllables(w)).sum();
        206.835 - 1.015 * avg_sentence_length - 84.6 * (syllables as f64 / word_count as f64)
    };

    let unique: HashSet<String> = words
        .iter()
        .filter(|w| w.chars().all(char::is_alphabetic))
        .map(|w| w.to_lowercase())
        .collect();
    let vocabulary_diversity = unique.len() as f64 / word_count.max(1) as f64;

    TextMetrics {
        word_count,
        sentence_count,
        avg_sentence_length,
        readability,
        vocabulary_diversity,
    }
}

/// Blend length, sentence length, readability and vocabulary bands into a
/// score. The bands sum to at most 0.80, so a `quality_threshold` above
/// that is never reached by computed scores; only caller-supplied scores
/// can clear it.
pub fn quality_score(m: &TextMetrics) -> f64 {
    let mut score = 0.0;

    score += match m.word_count {
        100..=2000 => 0.25,
        50..=99 | 2001..=3000 => 0.15,
        0..=49 => 0.05,
        _ => 0.1,
    };

    let asl = m.avg_sentence_length;
    if (10.0..=25.0).contains(&asl) {
        score += 0.2;
    } else if (5.0..10.0).contains(&asl) || (asl > 25.0 && asl <= 35.0) {
        score += 0.1;
    }

    let flesch = m.readability;
    if (30.0..=70.0).contains(&flesch) {
        score += 0.2;
    } else if flesch > 70.0 && flesch <= 90.0 {
        score += 0.15;
    } else if flesch > 90.0 {
        score += 0.1;
    }

    if m.vocabulary_diversity > 0.6 {
        score += 0.15;
    } else if m.vocabulary_diversity > 0.4 {
        score += 0.1;
    }

    f64::min(score, 1.0)
}

fn count_sentences(text: &str, word_count: i64) -> i64 {
    if word_count == 0 {
        return 0;
    }
    let mut count = 0;
    let mut in_terminator = false;
    for c in text.chars() {
        if matches!(c, '.' | '!' | '?') {
            if !in_terminator {
                count += 1;
            }
            in_terminator = true;
        } else if !c.is_whitespace() {
            in_terminator = false;
        }
    }
    // Trailing text without a terminator still forms a sentence.
    let ends_open = text
        .trim_end()
        .chars()
        .last()
        .map(|c| !matches!(c, '.' | '!' | '?'))
        .unwrap_or(false);
    if ends_open {
        count += 1;
    }
    count.max(1)
}

/// Vowel-group syllable estimate, ignoring a silent trailing `e`.
fn count_syllables(word: &str) -> usize {
    let lower = word.to_lowercase();
    let chars: Vec<char> = lower.chars().filter(|c| c.is_alphabetic()).collect();
    if chars.is_empty() {
        return 1;
    }
    let is_vowel = |c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');

    let mut groups = 0;
    let mut prev_vowel = false;
    for &c in &chars {
        let v = is_vowel(c);
        if v && !prev_vowel {
            groups += 1;
        }
        prev_vowel = v;
    }
    if chars.len() > 2 && chars[chars.len() - 1] == 'e' && !is_vowel(chars[chars.len() - 2]) {
        groups -= 1;
    }
    groups.max(1)
}
