//! Language code normalization and merging.

use std::collections::BTreeSet;

use crate::scan::AudioTrack;

/// Maps ISO 639-2/B, 639-2/T, and 639-1 codes to ISO 639-1.
fn iso639_1(code: &str) -> Option<&'static str> {
    Some(match code {
        "eng" | "en" => "en",
        "spa" | "es" => "es",
        "fre" | "fra" | "fr" => "fr",
        "ger" | "deu" | "de" => "de",
        "ita" | "it" => "it",
        "por" | "pt" => "pt",
        "rus" | "ru" => "ru",
        "jpn" | "ja" => "ja",
        "kor" | "ko" => "ko",
        "chi" | "zho" | "zh" => "zh",
        "hin" | "hi" => "hi",
        "ara" | "ar" => "ar",
        "dut" | "nld" | "nl" => "nl",
        "pol" | "pl" => "pl",
        "tur" | "tr" => "tr",
        "swe" | "sv" => "sv",
        "nor" | "nob" | "nno" | "no" => "no",
        "dan" | "da" => "da",
        "fin" | "fi" => "fi",
        "cze" | "ces" | "cs" => "cs",
        "hun" | "hu" => "hu",
        "rum" | "ron" | "ro" => "ro",
        "gre" | "ell" | "el" => "el",
        "tha" | "th" => "th",
        "vie" | "vi" => "vi",
        "ind" | "id" => "id",
        "heb" | "he" => "he",
        "ukr" | "uk" => "uk",
        "cat" | "ca" => "ca",
        "bul" | "bg" => "bg",
        "hrv" | "hr" => "hr",
        "srp" | "sr" => "sr",
        "slv" | "sl" => "sl",
        "lit" | "lt" => "lt",
        "lav" | "lv" => "lv",
        "est" | "et" => "et",
        _ => return None,
    })
}

/// Normalizes a raw language tag to ISO 639-1.
///
/// Empty input becomes `und`; unmapped codes pass through lowercased.
pub fn normalize_lang(raw: &str) -> String {
    if raw.is_empty() {
        return "und".to_string();
    }
    let lower = raw.to_lowercase();
    match iso639_1(&lower) {
        Some(mapped) => mapped.to_string(),
        None => lower,
    }
}

/// Whether a language tag means "unknown".
pub fn is_unknown_lang(lang: &str) -> bool {
    matches!(
        lang.to_lowercase().as_str(),
        "und" | "" | "undefined" | "unknown"
    )
}

/// Merges an existing language list with the set derived from audio tracks.
///
/// When the existing list consists only of the ambiguity markers `multi` /
/// `dual` and the audio tracks contribute anything, the audio-derived set
/// wins outright. Otherwise the result is the sorted union of the existing
/// list (minus ambiguity markers) and the audio-derived set.
pub fn compute_languages(existing: &[String], audio: &[AudioTrack]) -> Vec<String> {
    let detected: BTreeSet<&str> = audio
        .iter()
        .map(|t| t.lang.as_str())
        .filter(|l| !l.is_empty() && *l != "und" && l.len() <= 3)
        .collect();

    let existing_set: BTreeSet<&str> = existing.iter().map(String::as_str).collect();
    let is_ambiguous = |l: &str| l == "multi" || l == "dual";
    let all_ambiguous = !existing_set.is_empty() && existing_set.iter().all(|l| is_ambiguous(l));

    let merged: BTreeSet<&str> = if all_ambiguous {
        if detected.is_empty() {
            existing_set
        } else {
            detected
        }
    } else {
        let kept: BTreeSet<&str> = existing_set
            .iter()
            .copied()
            .filter(|l| !is_ambiguous(l))
            .collect();
        let union: BTreeSet<&str> = kept.union(&detected).copied().collect();
        if union.is_empty() {
            existing_set
        } else {
            union
        }
    };

    merged.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(lang: &str) -> AudioTrack {
        AudioTrack {
            lang: lang.to_string(),
            codec: "aac".to_string(),
            channels: 2,
            title: String::new(),
            default: false,
        }
    }

    #[test]
    fn test_normalize_bibliographic_and_terminological() {
        assert_eq!(normalize_lang("fre"), "fr");
        assert_eq!(normalize_lang("fra"), "fr");
        assert_eq!(normalize_lang("ger"), "de");
        assert_eq!(normalize_lang("deu"), "de");
        assert_eq!(normalize_lang("chi"), "zh");
        assert_eq!(normalize_lang("nob"), "no");
    }

    #[test]
    fn test_normalize_already_639_1() {
        assert_eq!(normalize_lang("en"), "en");
        assert_eq!(normalize_lang("ES"), "es");
    }

    #[test]
    fn test_normalize_unknown_passthrough_lowercase() {
        assert_eq!(normalize_lang("KLINGON"), "klingon");
        assert_eq!(normalize_lang(""), "und");
    }

    #[test]
    fn test_normalize_idempotent() {
        for raw in ["eng", "fre", "EN", "xx", "", "und", "multi"] {
            let once = normalize_lang(raw);
            assert_eq!(normalize_lang(&once), once);
        }
    }

    #[test]
    fn test_compute_languages_from_audio() {
        let langs = compute_languages(&[], &[track("es"), track("en"), track("es")]);
        assert_eq!(langs, vec!["en", "es"]);
    }

    #[test]
    fn test_compute_languages_excludes_und_and_empty() {
        let langs = compute_languages(&[], &[track("und"), track(""), track("ja")]);
        assert_eq!(langs, vec!["ja"]);
    }

    #[test]
    fn test_compute_languages_empty_equals_missing() {
        let audio = [track("en")];
        assert_eq!(compute_languages(&[], &audio), vec!["en"]);
    }

    #[test]
    fn test_ambiguous_existing_replaced_by_detected() {
        let existing = vec!["multi".to_string()];
        let langs = compute_languages(&existing, &[track("en"), track("fr")]);
        assert_eq!(langs, vec!["en", "fr"]);

        let existing = vec!["dual".to_string(), "multi".to_string()];
        let langs = compute_languages(&existing, &[track("de")]);
        assert_eq!(langs, vec!["de"]);
    }

    #[test]
    fn test_ambiguous_existing_kept_when_nothing_detected() {
        let existing = vec!["multi".to_string()];
        let langs = compute_languages(&existing, &[track("und")]);
        assert_eq!(langs, vec!["multi"]);
    }

    #[test]
    fn test_union_with_known_existing() {
        let existing = vec!["it".to_string(), "multi".to_string()];
        let langs = compute_languages(&existing, &[track("en")]);
        assert_eq!(langs, vec!["en", "it"]);
    }

    #[test]
    fn test_is_unknown_lang() {
        assert!(is_unknown_lang("und"));
        assert!(is_unknown_lang(""));
        assert!(is_unknown_lang("Undefined"));
        assert!(is_unknown_lang("unknown"));
        assert!(!is_unknown_lang("en"));
    }
}
