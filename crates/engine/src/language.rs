/// ISO 639-1 code, ISO 639-2/B code, display name
const LANGUAGES: &[(&str, &str, &str)] = &[
    ("ar", "ara", "Arabic"),
    ("cs", "cze", "Czech"),
    ("da", "dan", "Danish"),
    ("de", "ger", "German"),
    ("el", "gre", "Greek"),
    ("en", "eng", "English"),
    ("es", "spa", "Spanish"),
    ("fi", "fin", "Finnish"),
    ("fr", "fre", "French"),
    ("he", "heb", "Hebrew"),
    ("hi", "hin", "Hindi"),
    ("hu", "hun", "Hungarian"),
    ("it", "ita", "Italian"),
    ("ja", "jpn", "Japanese"),
    ("ko", "kor", "Korean"),
    ("nl", "dut", "Dutch"),
    ("no", "nor", "Norwegian"),
    ("pl", "pol", "Polish"),
    ("pt", "por", "Portuguese"),
    ("ro", "rum", "Romanian"),
    ("ru", "rus", "Russian"),
    ("sv", "swe", "Swedish"),
    ("th", "tha", "Thai"),
    ("tr", "tur", "Turkish"),
    ("uk", "ukr", "Ukrainian"),
    ("zh", "chi", "Chinese"),
];

/// ISO 639-2/T codes that differ from the bibliographic ones used above
const TERMINOLOGY_ALIASES: &[(&str, &str)] = &[
    ("ces", "cze"),
    ("deu", "ger"),
    ("ell", "gre"),
    ("fra", "fre"),
    ("nld", "dut"),
    ("ron", "rum"),
    ("zho", "chi"),
];

/// Code used for tracks whose language is unknown
pub const UNDETERMINED: &str = "und";

/// Normalize a language tag to a three-letter ISO 639-2/B code.
///
/// Unknown three-letter codes pass through lowercased; anything else is
/// undetermined.
pub fn normalize_language(code: &str) -> String {
    let code = code.trim().to_lowercase();
    let primary = code.split(['-', '_']).next().unwrap_or("");

    if let Some((_, bib, _)) = LANGUAGES.iter().find(|(iso1, bib, _)| *iso1 == primary || *bib == primary) {
        return bib.to_string();
    }
    if let Some((_, bib)) = TERMINOLOGY_ALIASES.iter().find(|(term, _)| *term == primary) {
        return bib.to_string();
    }
    if primary.len() == 3 && primary.chars().all(|c| c.is_ascii_lowercase()) {
        return primary.to_string();
    }
    UNDETERMINED.to_string()
}

/// Human-readable name for a language code (`eng` -> `English`)
pub fn display_name(code: &str) -> String {
    let normalized = normalize_language(code);
    LANGUAGES
        .iter()
        .find(|(_, bib, _)| *bib == normalized)
        .map(|(_, _, name)| name.to_string())
        .unwrap_or_else(|| {
            if normalized == UNDETERMINED {
                "Unknown".to_string()
            } else {
                normalized.to_uppercase()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_language() {
        assert_eq!(normalize_language("en"), "eng");
        assert_eq!(normalize_language("EN"), "eng");
        assert_eq!(normalize_language("fra"), "fre");
        assert_eq!(normalize_language("fre"), "fre");
        assert_eq!(normalize_language("pt-BR"), "por");
        assert_eq!(normalize_language("tlh"), "tlh");
        assert_eq!(normalize_language(""), "und");
        assert_eq!(normalize_language("english"), "und");
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("eng"), "English");
        assert_eq!(display_name("de"), "German");
        assert_eq!(display_name("tlh"), "TLH");
        assert_eq!(display_name("und"), "Unknown");
    }
}
