// src/normalization/string_utils.rs
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use strsim::levenshtein;

/// Whole-word phrase folds, applied strictly in this order. Several entries
/// exist only to feed the entries below them ("aor received" is folded to
/// "aor" so the following rule can expand every "aor" exactly once).
const PHRASE_REPLACEMENTS: [(&str, &str); 16] = [
    ("acknowledgement of receipt", "aor"),
    ("acknowledgment of receipt", "aor"),
    ("aor received", "aor"),
    ("aor", "aor received"),
    ("biometrics instruction letter", "biometrics letter"),
    ("biometric instruction letter", "biometrics letter"),
    ("bil", "biometrics letter"),
    ("medical examination", "medical exam"),
    ("ime", "medical exam"),
    ("passport request letter", "passport request"),
    ("ppr", "passport request"),
    ("confirmation of permanent residence", "copr"),
    ("invitation to apply", "ita"),
    ("bgc", "background check"),
    ("work permit", "wp"),
    ("study permit", "sp"),
];

static REPLACEMENT_TABLE: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    PHRASE_REPLACEMENTS
        .iter()
        .filter_map(|(phrase, replacement)| {
            let pattern = format!(r"\b{}\b", regex::escape(phrase));
            match Regex::new(&pattern) {
                Ok(re) => Some((re, *replacement)),
                Err(e) => {
                    warn!("Invalid replacement pattern '{}': {}", pattern, e);
                    None
                }
            }
        })
        .collect()
});

/// Removes everything between matching parentheses, nesting included.
/// An unclosed `(` swallows the rest of the string; a stray `)` is left as
/// punctuation for later passes.
pub(crate) fn strip_parentheticals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => {
                depth -= 1;
                // keep the words on either side apart
                out.push(' ');
            }
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Replaces every non-word character with a space and collapses whitespace.
pub(crate) fn collapse_non_word(text: &str) -> String {
    let spaced: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical comparison key for milestone and application-type names.
pub fn normalize(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let mut normalized = collapse_non_word(&strip_parentheticals(&lowered));

    for (re, replacement) in REPLACEMENT_TABLE.iter() {
        normalized = re.replace_all(&normalized, *replacement).into_owned();
    }

    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Levenshtein similarity of the normalized forms, in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let norm_a = normalize(a);
    let norm_b = normalize(b);
    if norm_a.is_empty() || norm_b.is_empty() {
        return 0.0;
    }
    if norm_a == norm_b {
        return 1.0;
    }

    let max_len = norm_a.chars().count().max(norm_b.chars().count());
    let distance = levenshtein(&norm_a, &norm_b);
    (1.0 - distance as f64 / max_len as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_normalization() {
        assert_eq!(normalize("  Biometrics Completed!  "), "biometrics completed");
        assert_eq!(normalize("Medical -- Exam"), "medical exam");
        assert_eq!(normalize("Passport (PPR) received"), "passport received");
    }

    #[test]
    fn test_phrase_table_is_applied_in_order() {
        assert_eq!(normalize("Acknowledgment of Receipt"), "aor received");
        assert_eq!(normalize("AOR"), "aor received");
        assert_eq!(normalize("AOR received"), "aor received");
        assert_eq!(
            normalize("Biometrics Instruction Letter"),
            "biometrics letter"
        );
        assert_eq!(normalize("BIL issued"), "biometrics letter issued");
        assert_eq!(normalize("Medical Examination done"), "medical exam done");
    }

    #[test]
    fn test_replacements_respect_word_boundaries() {
        assert_eq!(normalize("labor market"), "labor market");
        assert_eq!(normalize("Bill payment"), "bill payment");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "Acknowledgement of receipt (AOR)",
            "aor-received",
            "Biometrics-Instruction letter",
            "Work Permit Approved!!",
            "Confirmation of Permanent Residence (COPR) issued",
            "ITA / Invitation to Apply",
            "  (nothing but parens)  ",
            "Médical exam – passé",
            "bgc_done",
            "",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_strip_parentheticals() {
        assert_eq!(strip_parentheticals("a (b (c)) d").split_whitespace().collect::<Vec<_>>(), vec!["a", "d"]);
        assert_eq!(strip_parentheticals("open (never closed"), "open ");
        assert_eq!(strip_parentheticals("stray ) paren"), "stray ) paren");
    }

    #[test]
    fn test_similarity_identity_and_bounds() {
        assert_eq!(similarity("Biometrics completed", "Biometrics completed"), 1.0);
        assert_eq!(similarity("AOR", "Acknowledgment of Receipt"), 1.0);

        let pairs = [
            ("Biometrics completed", "Biometrics complete"),
            ("Medical exam", "Background check"),
            ("a", "zzzzzzzzzz"),
        ];
        for (a, b) in pairs {
            let s = similarity(a, b);
            assert!((0.0..=1.0).contains(&s), "{} out of range for {:?}", s, (a, b));
        }
        assert!(similarity("Biometrics completed", "Biometrics complete") > 0.9);
        assert!(similarity("Medical exam", "Background check") < 0.5);
    }

    #[test]
    fn test_similarity_empty_inputs() {
        assert_eq!(similarity("", "anything"), 0.0);
        assert_eq!(similarity("(only parens)", "(only parens)"), 0.0);
        assert_eq!(similarity("!!!", ""), 0.0);
    }
}
