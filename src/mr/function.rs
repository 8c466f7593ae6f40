//! The map/reduce functions run by the workers

/// Word Count application over WET conversion records
pub mod wc {
    use std::{collections::HashMap, sync::LazyLock};

    use regex::Regex;

    use crate::{mr::worker::KeyValue, warc::Record};

    /// Per-document or per-shard token frequencies
    pub type PartialCount = HashMap<String, u64>;

    /// Everything but ASCII letters, digits and spaces
    static NON_WORD: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9 ]").expect("valid non-word pattern"));
    static WHITESPACE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

    /// Split raw page text into tokens
    ///
    /// Every character that is not an ASCII letter, digit or space becomes a
    /// space, whitespace runs collapse to one space and the result is split on
    /// spaces. Case is left untouched.
    pub fn normalize(text: &str) -> Vec<String> {
        let text = NON_WORD.replace_all(text, " ");
        let text = WHITESPACE.replace_all(&text, " ");
        text.split(' ')
            .filter(|x| !x.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Lowercase every token, only used when case folding is switched on
    pub fn fold_case(tokens: Vec<String>) -> Vec<String> {
        tokens.into_iter().map(|x| x.to_ascii_lowercase()).collect()
    }

    /// Count the occurrences of every distinct token in one pass
    pub fn count<I>(tokens: I) -> PartialCount
    where
        I: IntoIterator<Item = String>,
    {
        let mut counts = PartialCount::new();
        for token in tokens {
            *counts.entry(token).or_insert(0) += 1;
        }
        counts
    }

    /// Map one record to its `(token, count)` pairs
    ///
    /// Anything but a conversion record maps to nothing.
    pub fn map(record: &Record, case_fold: bool) -> Vec<KeyValue> {
        let Record::Conversion { body, .. } = record else {
            return Vec::new();
        };
        let mut tokens = normalize(body);
        if case_fold {
            tokens = fold_case(tokens);
        }
        count(tokens)
            .into_iter()
            .map(|(key, value)| KeyValue::new(key, value))
            .collect()
    }

}
