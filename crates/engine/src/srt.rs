//! SubRip parsing and the duplicate-cue merge used by subtitle cleaning.

use std::fmt;
use crate::error::SrtError;

/// Cue boundary in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Parse `HH:MM:SS,mmm` (a `.` separator is accepted too)
    pub fn parse(text: &str) -> Option<Self> {
        let (clock, millis) = text.trim().split_once([',', '.'])?;
        let mut parts = clock.split(':');
        let hours: u64 = parts.next()?.parse().ok()?;
        let minutes: u64 = parts.next()?.parse().ok()?;
        let seconds: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || minutes >= 60 || seconds >= 60 || millis.len() != 3 {
            return None;
        }
        let millis: u64 = millis.parse().ok()?;
        let total = hours
            .checked_mul(3600)?
            .checked_add(minutes * 60 + seconds)?
            .checked_mul(1000)?
            .checked_add(millis)?;
        Some(Timestamp(total))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0;
        write!(
            f,
            "{:02}:{:02}:{:02},{:03}",
            ms / 3_600_000,
            ms / 60_000 % 60,
            ms / 1000 % 60,
            ms % 1000
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start: Timestamp,
    pub end: Timestamp,
    pub text: String,
}

/// Parse SubRip text. Cue numbers are ignored and regenerated on render.
pub fn parse(input: &str) -> Result<Vec<Cue>, SrtError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut cues = Vec::new();
    let mut lines = input.lines().map(|l| l.trim_end_matches('\r')).enumerate().peekable();

    loop {
        while lines.next_if(|(_, l)| l.trim().is_empty()).is_some() {}
        let Some((mut number, mut line)) = lines.next() else {
            break;
        };

        // The counter line is optional in the wild.
        if !line.contains("-->") {
            match lines.next() {
                Some((n, l)) => (number, line) = (n, l),
                None => break,
            }
        }

        let (start, end) = line.split_once("-->").ok_or_else(|| SrtError::Timing {
            line: number + 1,
            text: line.to_string(),
        })?;
        let timestamp = |text: &str| {
            // Positioning hints may follow the end time.
            let text = text.split_whitespace().next().unwrap_or("");
            Timestamp::parse(text).ok_or_else(|| SrtError::Timestamp {
                line: number + 1,
                text: text.to_string(),
            })
        };
        let start = timestamp(start)?;
        let end = timestamp(end)?;

        let mut text = Vec::new();
        while let Some((_, l)) = lines.next_if(|(_, l)| !l.trim().is_empty()) {
            text.push(l);
        }
        cues.push(Cue {
            start,
            end,
            text: text.join("\n"),
        });
    }
    Ok(cues)
}

/// Merge runs of consecutive cues sharing both start and end.
///
/// Texts are joined with a newline in original order. Identical timings that
/// are not adjacent stay separate.
pub fn merge_duplicates(cues: Vec<Cue>) -> Vec<Cue> {
    let mut merged: Vec<Cue> = Vec::with_capacity(cues.len());
    for cue in cues {
        match merged.last_mut() {
            Some(prev) if prev.start == cue.start && prev.end == cue.end => {
                if !cue.text.is_empty() {
                    if !prev.text.is_empty() {
                        prev.text.push('\n');
                    }
                    prev.text.push_str(&cue.text);
                }
            }
            _ => merged.push(cue),
        }
    }
    merged
}

/// Render cues as SubRip, numbered from 1
pub fn render(cues: &[Cue]) -> String {
    let mut out = String::new();
    for (i, cue) in cues.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{}\n{} --> {}\n", i + 1, cue.start, cue.end));
        if !cue.text.is_empty() {
            out.push_str(&cue.text);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DUPLICATED: &str = "\u{feff}1\r\n00:00:01,000 --> 00:00:02,500\r\n- Where are you?\r\n\r\n2\r\n00:00:01,000 --> 00:00:02,500\r\n- Here.\r\n\r\n3\r\n00:00:03,000 --> 00:00:04,000\r\nOkay.\r\n";

    fn cue(start: u64, end: u64, text: &str) -> Cue {
        Cue {
            start: Timestamp(start),
            end: Timestamp(end),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_timestamp() {
        assert_eq!(Timestamp::parse("01:02:03,004"), Some(Timestamp(3_723_004)));
        assert_eq!(Timestamp::parse("00:00:01.500"), Some(Timestamp(1500)));
        assert_eq!(Timestamp::parse("00:61:00,000"), None);
        assert_eq!(Timestamp::parse("00:00:01,5"), None);
        assert_eq!(Timestamp(3_723_004).to_string(), "01:02:03,004");
    }

    #[test]
    fn test_oversized_hours_are_rejected() {
        assert_eq!(Timestamp::parse("9999999999999999999:00:00,000"), None);
        let err = parse("1\n9999999999999999999:00:00,000 --> 00:00:02,000\nHi\n").unwrap_err();
        assert!(matches!(err, SrtError::Timestamp { .. }), "{:?}", err);
    }

    #[test]
    fn test_parse_handles_bom_and_crlf() {
        let cues = parse(DUPLICATED).unwrap();
        assert_eq!(
            cues,
            vec![
                cue(1000, 2500, "- Where are you?"),
                cue(1000, 2500, "- Here."),
                cue(3000, 4000, "Okay."),
            ]
        );
    }

    #[test]
    fn test_parse_without_counters_and_with_position() {
        let cues = parse("00:00:01,000 --> 00:00:02,000 X1:10 X2:20\nHi\n\n\n\n00:00:03,000 --> 00:00:04,000\n").unwrap();
        assert_eq!(cues, vec![cue(1000, 2000, "Hi"), cue(3000, 4000, "")]);
    }

    #[test]
    fn test_parse_rejects_missing_timing() {
        let err = parse("1\nhello\nworld\n").unwrap_err();
        assert!(matches!(err, SrtError::Timing { line: 2, .. }), "{:?}", err);
        assert!(matches!(parse("1\n00:00:01 --> 00:00:02,000\n"), Err(SrtError::Timestamp { .. })));
    }

    #[test]
    fn test_merge_and_render() {
        let merged = merge_duplicates(parse(DUPLICATED).unwrap());
        assert_eq!(
            render(&merged),
            "1\n00:00:01,000 --> 00:00:02,500\n- Where are you?\n- Here.\n\n2\n00:00:03,000 --> 00:00:04,000\nOkay.\n"
        );
    }

    #[test]
    fn test_non_adjacent_duplicates_stay_apart() {
        let cues = vec![cue(0, 1, "a"), cue(2, 3, "b"), cue(0, 1, "c")];
        assert_eq!(merge_duplicates(cues.clone()), cues);
    }

    fn cues_strategy() -> impl Strategy<Value = Vec<Cue>> {
        prop::collection::vec((0u64..4, 0u64..4, "[a-z]{1,8}"), 0..30).prop_map(|raw| {
            raw.into_iter()
                .map(|(start, len, text)| cue(start * 1000, (start + len) * 1000, &text))
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// No two neighbours share a timing after merging, and no text is lost
        #[test]
        fn test_merge_is_complete(cues in cues_strategy()) {
            let merged = merge_duplicates(cues.clone());
            for pair in merged.windows(2) {
                prop_assert!(pair[0].start != pair[1].start || pair[0].end != pair[1].end);
            }
            let before: Vec<&str> = cues.iter().map(|c| c.text.as_str()).collect();
            let after: Vec<String> = merged.iter().map(|c| c.text.clone()).collect();
            prop_assert_eq!(after.join("\n"), before.join("\n"));
        }

        /// Merging an already merged list changes nothing
        #[test]
        fn test_merge_is_idempotent(cues in cues_strategy()) {
            let once = merge_duplicates(cues);
            prop_assert_eq!(merge_duplicates(once.clone()), once);
        }
    }
}
