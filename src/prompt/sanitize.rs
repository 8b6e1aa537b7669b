//! Phrase-level filtering of free text that ends up in a render prompt.
//!
//! Fragments that ask for structural changes to the person are rewritten
//! into their identity-preserving equivalent. Sentences carrying a blocked
//! phrase are dropped outright.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static ALTERATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:reshape|reshaping|reconstruct|reconstructing|transform|transforming|alter|altering|morph|morphing|modify|modifying|slimming|enlarge|enlarging|reduce|reducing|beautify|beautifying|idealize|idealise)\s+(?:(?:the|her|his|their|its|person'?s|subject'?s|model'?s)\s+)?(face|facial\s+(?:features|structure)|jaw(?:line)?|nose|eyes|lips|cheekbones|body|body\s+shape|figure|physique|anatomy|proportions|waist|hips|legs|head)\b",
    )
    .expect("valid alteration regex")
});

static ALTERATION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bmake\s+(?:her|him|them|the\s+person|the\s+subject|the\s+model)\s+(?:look\s+)?(?:thinner|slimmer|taller|shorter|younger|older|prettier|more\s+attractive|more\s+muscular|curvier)\b",
    )
    .expect("valid make-look regex")
});

const BLOCKED_PHRASES: &[&str] = &[
    "face swap",
    "swap the face",
    "replace the face",
    "new face",
    "different face",
    "different person",
    "another person",
    "change identity",
    "change the identity",
    "change ethnicity",
    "change skin color",
    "change skin colour",
    "de-age",
    "age the person",
    "nsfw",
    "nudity",
    "undress",
];

/// A terminator only ends a sentence when whitespace or the end follows it,
/// so decimals like `f/1.8` stay whole.
static SENTENCE_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.;!?]+(?:\s+|$)|\n+").expect("valid sentence boundary regex"));

fn sentences(fragment: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for boundary in SENTENCE_END_RE.find_iter(fragment) {
        parts.push(&fragment[start..boundary.end()]);
        start = boundary.end();
    }
    parts.push(&fragment[start..]);
    parts
}

/// Result of passing one fragment through the sanitizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    pub rewrites: usize,
    pub dropped_sentences: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PhraseSanitizer {
    extra_blocked: Vec<String>,
}

fn preserving_equivalent(target: &str) -> String {
    format!("keep the original {}", target.to_lowercase())
}

impl PhraseSanitizer {
    /// `extra_blocked` adds deployment-specific phrases (case-insensitive).
    pub fn new(extra_blocked: &[String]) -> Self {
        PhraseSanitizer {
            extra_blocked: extra_blocked
                .iter()
                .map(|phrase| phrase.trim().to_lowercase())
                .filter(|phrase| !phrase.is_empty())
                .collect(),
        }
    }

    fn blocked_phrase_in(&self, lowered: &str) -> Option<String> {
        BLOCKED_PHRASES
            .iter()
            .map(|phrase| phrase.to_string())
            .chain(self.extra_blocked.iter().cloned())
            .find(|phrase| lowered.contains(phrase.as_str()))
    }

    /// True when `text` carries a phrase that cannot be rewritten.
    pub fn is_blocked(&self, text: &str) -> bool {
        self.blocked_phrase_in(&text.to_lowercase()).is_some()
    }

    /// True when `text` still contains anything this sanitizer would touch.
    pub fn contains_forbidden(&self, text: &str) -> bool {
        ALTERATION_RE.is_match(text) || ALTERATION_SUFFIX_RE.is_match(text) || self.is_blocked(text)
    }

    fn rewrite(&self, sentence: &str, rewrites: &mut usize) -> String {
        let rewritten = ALTERATION_RE.replace_all(sentence, |caps: &regex::Captures| {
            *rewrites += 1;
            preserving_equivalent(&caps[1])
        });
        let rewritten = ALTERATION_SUFFIX_RE.replace_all(&rewritten, |_: &regex::Captures| {
            *rewrites += 1;
            "keep the person exactly as they are".to_string()
        });
        rewritten.into_owned()
    }

    pub fn sanitize(&self, fragment: &str) -> Sanitized {
        let mut rewrites = 0usize;
        let mut dropped_sentences = 0usize;
        let mut kept = Vec::new();

        for sentence in sentences(fragment) {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let rewritten = self.rewrite(sentence, &mut rewrites);
            if let Some(phrase) = self.blocked_phrase_in(&rewritten.to_lowercase()) {
                debug!(phrase = %phrase, "Dropping prompt sentence with blocked phrase");
                dropped_sentences += 1;
                continue;
            }
            kept.push(rewritten);
        }

        // Untouched fragments keep their original spacing.
        let text = if rewrites == 0 && dropped_sentences == 0 {
            fragment.trim().to_string()
        } else {
            kept.join(" ")
        };

        Sanitized {
            text,
            rewrites,
            dropped_sentences,
        }
    }

    /// Final pass over assembled text; removes any line that still carries a
    /// forbidden phrase after fragment-level cleaning.
    pub fn verify(&self, text: &str) -> (String, usize) {
        let mut removed = 0usize;
        let lines = text
            .lines()
            .filter_map(|line| {
                if !self.contains_forbidden(line) {
                    return Some(line.to_string());
                }
                let cleaned = self.sanitize(line).text;
                if cleaned.is_empty() || self.contains_forbidden(&cleaned) {
                    removed += 1;
                    None
                } else {
                    Some(cleaned)
                }
            })
            .collect::<Vec<_>>();
        (lines.join("\n"), removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_verbs_are_rewritten() {
        let sanitizer = PhraseSanitizer::default();
        let result = sanitizer.sanitize("Reshape the face to fit the light. Transform her body into a runway pose.");
        assert_eq!(result.rewrites, 2);
        assert!(result.text.contains("keep the original face"));
        assert!(result.text.contains("keep the original body"));
        assert!(!sanitizer.contains_forbidden(&result.text));
    }

    #[test]
    fn make_look_phrases_are_neutralized() {
        let sanitizer = PhraseSanitizer::default();
        let result = sanitizer.sanitize("Make her look thinner and add a scarf.");
        assert!(result.text.contains("keep the person exactly as they are"));
        assert!(result.text.contains("add a scarf"));
    }

    #[test]
    fn blocked_sentences_are_dropped() {
        let sanitizer = PhraseSanitizer::default();
        let result = sanitizer.sanitize("Warm sunset light. Use a different person for the shot; soft bokeh.");
        assert_eq!(result.dropped_sentences, 1);
        assert_eq!(result.text, "Warm sunset light. soft bokeh.");
    }

    #[test]
    fn configured_phrases_are_blocked() {
        let sanitizer = PhraseSanitizer::new(&[" Neon Signs ".to_string(), "".to_string()]);
        assert!(sanitizer.is_blocked("bright NEON SIGNS everywhere"));
        assert_eq!(sanitizer.sanitize("Neon signs behind. Wet asphalt.").text, "Wet asphalt.");
    }

    #[test]
    fn clean_text_passes_through() {
        let sanitizer = PhraseSanitizer::default();
        let result = sanitizer.sanitize("Soft window light from the left.");
        assert_eq!(result.text, "Soft window light from the left.");
        assert_eq!(result.rewrites, 0);
    }

    #[test]
    fn decimals_are_not_split_into_sentences() {
        let sanitizer = PhraseSanitizer::default();
        let untouched = sanitizer.sanitize("Shot at f/1.8 from 1.5 m away");
        assert_eq!(untouched.text, "Shot at f/1.8 from 1.5 m away");

        let rewritten = sanitizer.sanitize("Size 10.5 coat at 2.5x zoom. Reshape the face now.");
        assert_eq!(rewritten.rewrites, 1);
        assert_eq!(
            rewritten.text,
            "Size 10.5 coat at 2.5x zoom. keep the original face now."
        );

        let dropped = sanitizer.sanitize("Lens 1.4 wide open. Face swap with 0.5 blend!");
        assert_eq!(dropped.dropped_sentences, 1);
        assert_eq!(dropped.text, "Lens 1.4 wide open.");
    }

    #[test]
    fn verify_strips_remaining_lines() {
        let sanitizer = PhraseSanitizer::default();
        let (text, removed) = sanitizer.verify("GARMENT: red coat\nSCENE: face swap with a celebrity");
        assert_eq!(text, "GARMENT: red coat");
        assert_eq!(removed, 1);
    }
}
