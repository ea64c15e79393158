//! Caption post-processing
//!
//! Turns raw model output into the caption that is written to disk.

use regex::Regex;
use std::sync::LazyLock;

use common::error::{Error, Result};
use model_manager::PromptFamily;

static LEADING_ROLE: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^\s*(?:(?:assistant|model)\s*\n|(?i:assistant)\s*:)\s*"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"\s+"));
static SPACE_BEFORE_PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"\s+([,.;:!?])"));
static REPEATED_COMMA: LazyLock<Regex> = LazyLock::new(|| compile_regex(r",(?:\s*,)+"));

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Static patterns; covered by `test_static_patterns_compile`
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}

/// Cleans raw generations for one job
#[derive(Debug, Clone)]
pub struct CaptionCleaner {
    /// Case-insensitive whole-word matcher for blacklisted words
    blacklist: Option<Regex>,

    /// Prefix for every caption
    trigger: Option<String>,
}

impl CaptionCleaner {
    pub fn new(blacklist: &[String], trigger: Option<&str>) -> Result<Self> {
        let words: Vec<String> = blacklist
            .iter()
            .map(|word| word.trim())
            .filter(|word| !word.is_empty())
            .map(whole_word)
            .collect();

        let blacklist = if words.is_empty() {
            None
        } else {
            let pattern = format!(r"(?i)(?:{})", words.join("|"));
            Some(
                Regex::new(&pattern)
                    .map_err(|e| Error::Validation(format!("invalid blacklist: {}", e)))?,
            )
        };

        let trigger = trigger
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        Ok(Self { blacklist, trigger })
    }

    /// Applies every cleanup step; returns an empty string if nothing is left
    pub fn clean(&self, raw: &str) -> String {
        let mut text = strip_control_tokens(raw);
        text = LEADING_ROLE.replace(&text, "").into_owned();

        if let Some(blacklist) = &self.blacklist {
            text = blacklist.replace_all(&text, "").into_owned();
        }

        text = WHITESPACE.replace_all(&text, " ").into_owned();
        text = SPACE_BEFORE_PUNCTUATION.replace_all(&text, "$1").into_owned();
        text = REPEATED_COMMA.replace_all(&text, ",").into_owned();

        let text = trim_quotes(text.trim().trim_start_matches([',', ';', ':']).trim());

        match &self.trigger {
            Some(trigger) if !text.is_empty() => format!("{}, {}", trigger, text),
            _ => text.to_string(),
        }
    }
}

/// Escapes `word`, anchoring only the ends that are word characters
fn whole_word(word: &str) -> String {
    let is_word = |c: Option<char>| c.map(|c| c.is_alphanumeric() || c == '_').unwrap_or(false);
    format!(
        "{}{}{}",
        if is_word(word.chars().next()) { r"\b" } else { "" },
        regex::escape(word),
        if is_word(word.chars().last()) { r"\b" } else { "" }
    )
}

fn strip_control_tokens(raw: &str) -> String {
    PromptFamily::ALL
        .iter()
        .flat_map(|family| family.control_tokens())
        .fold(raw.to_string(), |text, token| text.replace(token, " "))
}

fn trim_quotes(text: &str) -> &str {
    for quote in ['"', '\'', '\u{201c}'] {
        let close = if quote == '\u{201c}' { '\u{201d}' } else { quote };
        if text.len() > 1 && text.starts_with(quote) && text.ends_with(close) {
            return text[quote.len_utf8()..text.len() - close.len_utf8()].trim();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner(blacklist: &[&str], trigger: Option<&str>) -> CaptionCleaner {
        let blacklist: Vec<String> = blacklist.iter().map(|w| w.to_string()).collect();
        CaptionCleaner::new(&blacklist, trigger).unwrap()
    }

    #[test]
    fn test_static_patterns_compile() {
        LazyLock::force(&LEADING_ROLE);
        LazyLock::force(&WHITESPACE);
        LazyLock::force(&SPACE_BEFORE_PUNCTUATION);
        LazyLock::force(&REPEATED_COMMA);
    }

    #[test]
    fn test_control_tokens_blacklist_and_trigger() {
        let caption = cleaner(&["red"], Some("photo")).clean("<|im_start|>A red car driving fast<|im_end|>");
        assert_eq!(caption, "photo, A car driving fast");
    }

    #[test]
    fn test_blacklist_is_whole_word_and_case_insensitive() {
        let caption = cleaner(&["cat"], None).clean("A Cat sits near a catalog with a CAT toy.");
        assert_eq!(caption, "A sits near a catalog with a toy.");
    }

    #[test]
    fn test_blacklist_entries_with_symbols() {
        let caption = cleaner(&["c++", "4k!", "cat"], None).clean("A C++ book, a 4k! screen and a cat cat");
        assert_eq!(caption, "A book, a screen and a");
        assert_eq!(cleaner(&["c++"], None).clean("Notes on C"), "Notes on C");
    }

    #[test]
    fn test_role_labels_removed() {
        assert_eq!(cleaner(&[], None).clean("ASSISTANT: A tree."), "A tree.");
        assert_eq!(
            cleaner(&[], None).clean("<|im_start|>assistant\nA tree at dusk"),
            "A tree at dusk"
        );
        assert_eq!(
            cleaner(&[], None).clean("<start_of_turn>model\nA quiet lake<end_of_turn>"),
            "A quiet lake"
        );
    }

    #[test]
    fn test_whitespace_punctuation_and_quotes() {
        let caption = cleaner(&["blurry"], None).clean("  \"A  blurry ,  dog \n running .\"  ");
        assert_eq!(caption, "A, dog running.");
    }

    #[test]
    fn test_empty_result_has_no_trigger() {
        assert_eq!(cleaner(&["red"], Some("photo")).clean("<s> red </s>"), "");
    }

    #[test]
    fn test_blank_trigger_and_words_ignored() {
        let caption = cleaner(&["", "  "], Some("  ")).clean("[INST] A house [/INST]");
        assert_eq!(caption, "A house");
    }
}
