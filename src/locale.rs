use std::collections::HashSet;
use std::sync::Mutex;

use tracing::warn;

use crate::models::{LocaleEncoding, LocaleKind};

const LANGUAGE_COUNTRIES: &[(&str, &[&str])] = &[
    ("bg", &["BG"]),
    ("ca", &["ES", "AD"]),
    ("cs", &["CZ"]),
    ("da", &["DK"]),
    ("de", &["DE", "AT", "CH", "LU", "LI", "BE"]),
    ("el", &["GR", "CY"]),
    ("en", &["GB", "IE", "MT"]),
    ("es", &["ES"]),
    ("et", &["EE"]),
    ("eu", &["ES"]),
    ("fi", &["FI"]),
    ("fr", &["FR", "BE", "LU", "CH", "MC"]),
    ("ga", &["IE"]),
    ("hr", &["HR"]),
    ("hu", &["HU"]),
    ("is", &["IS"]),
    ("it", &["IT", "CH", "SM"]),
    ("lb", &["LU"]),
    ("lt", &["LT"]),
    ("lv", &["LV"]),
    ("mt", &["MT"]),
    ("nl", &["NL", "BE"]),
    ("no", &["NO"]),
    ("nb", &["NO"]),
    ("nn", &["NO"]),
    ("pl", &["PL"]),
    ("pt", &["PT"]),
    ("ro", &["RO"]),
    ("sk", &["SK"]),
    ("sl", &["SI"]),
    ("sv", &["SE", "FI"]),
    ("tr", &["TR", "CY"]),
    ("uk", &["UA"]),
];

const COUNTRY_NAMES: &[(&str, &str)] = &[
    ("andorra", "AD"),
    ("austria", "AT"),
    ("belgium", "BE"),
    ("bulgaria", "BG"),
    ("croatia", "HR"),
    ("cyprus", "CY"),
    ("czechia", "CZ"),
    ("czech republic", "CZ"),
    ("denmark", "DK"),
    ("estonia", "EE"),
    ("finland", "FI"),
    ("france", "FR"),
    ("germany", "DE"),
    ("greece", "GR"),
    ("hungary", "HU"),
    ("iceland", "IS"),
    ("ireland", "IE"),
    ("republic of ireland", "IE"),
    ("italy", "IT"),
    ("latvia", "LV"),
    ("liechtenstein", "LI"),
    ("lithuania", "LT"),
    ("luxembourg", "LU"),
    ("malta", "MT"),
    ("monaco", "MC"),
    ("netherlands", "NL"),
    ("the netherlands", "NL"),
    ("norway", "NO"),
    ("poland", "PL"),
    ("portugal", "PT"),
    ("romania", "RO"),
    ("san marino", "SM"),
    ("slovakia", "SK"),
    ("slovak republic", "SK"),
    ("slovenia", "SI"),
    ("spain", "ES"),
    ("sweden", "SE"),
    ("switzerland", "CH"),
    ("turkey", "TR"),
    ("türkiye", "TR"),
    ("ukraine", "UA"),
    ("united kingdom", "GB"),
    ("uk", "GB"),
    ("great britain", "GB"),
];

const UNRESOLVABLE: &[&str] = &["", "unknown", "n/a", "na", "none", "null", "other", "europe"];

pub fn language_to_countries(code: &str) -> &'static [&'static str] {
    let code = code.trim();
    LANGUAGE_COUNTRIES
        .iter()
        .find(|(language, _)| language.eq_ignore_ascii_case(code))
        .map(|(_, countries)| *countries)
        .unwrap_or(&[])
}

pub fn country_name_to_iso2(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_lowercase();
    if UNRESOLVABLE.contains(&lowered.as_str()) {
        return None;
    }
    COUNTRY_NAMES
        .iter()
        .find(|(candidate, _)| *candidate == lowered)
        .map(|(_, iso2)| *iso2)
        .or_else(|| known_iso2(&lowered))
}

fn known_iso2(lowered: &str) -> Option<&'static str> {
    if lowered.len() != 2 {
        return None;
    }
    COUNTRY_NAMES
        .iter()
        .map(|(_, iso2)| *iso2)
        .chain(LANGUAGE_COUNTRIES.iter().flat_map(|(_, countries)| countries.iter().copied()))
        .find(|iso2| iso2.eq_ignore_ascii_case(lowered))
}

// An empty result drops the row.
pub fn resolve_locale(raw: &str, encoding: LocaleEncoding, kind: LocaleKind) -> Vec<String> {
    match (encoding, kind) {
        (LocaleEncoding::Language, LocaleKind::Country) => language_to_countries(raw)
            .iter()
            .map(|country| (*country).to_string())
            .collect(),
        (LocaleEncoding::Language, LocaleKind::Language) => {
            let code = raw.trim().to_lowercase();
            if language_to_countries(&code).is_empty() {
                Vec::new()
            } else {
                vec![code]
            }
        }
        (LocaleEncoding::CountryName | LocaleEncoding::Iso2, LocaleKind::Country) => {
            country_name_to_iso2(raw)
                .map(|iso2| vec![iso2.to_string()])
                .unwrap_or_default()
        }
        (LocaleEncoding::CountryName | LocaleEncoding::Iso2, LocaleKind::Language) => Vec::new(),
    }
}

#[derive(Debug, Default)]
pub struct UnresolvedLog {
    seen: Mutex<HashSet<String>>,
}

impl UnresolvedLog {
    pub fn note(&self, context: &str, raw: &str) {
        let Ok(mut seen) = self.seen.lock() else {
            return;
        };
        if seen.insert(raw.to_string()) {
            warn!(context, locale = raw, "dropping rows with unresolved locale");
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Germany", Some("DE"))]
    #[case("  the Netherlands ", Some("NL"))]
    #[case("UNITED KINGDOM", Some("GB"))]
    #[case("fr", Some("FR"))]
    #[case("unknown", None)]
    #[case("Unknown", None)]
    #[case("", None)]
    #[case("Atlantis", None)]
    fn resolves_country_names(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(country_name_to_iso2(name), expected);
    }

    #[test]
    fn language_expands_to_every_mapped_country() {
        let countries = resolve_locale("de", LocaleEncoding::Language, LocaleKind::Country);
        assert_eq!(countries, vec!["DE", "AT", "CH", "LU", "LI", "BE"]);
    }

    #[test]
    fn language_kind_keeps_language_codes() {
        assert_eq!(
            resolve_locale("DE", LocaleEncoding::Language, LocaleKind::Language),
            vec!["de".to_string()]
        );
        assert!(resolve_locale("xx", LocaleEncoding::Language, LocaleKind::Language).is_empty());
    }

    #[test]
    fn country_rows_cannot_become_languages() {
        assert!(resolve_locale("France", LocaleEncoding::CountryName, LocaleKind::Language)
            .is_empty());
    }

    #[test]
    fn unresolved_locales_are_dropped_not_raised() {
        assert!(resolve_locale("unknown", LocaleEncoding::CountryName, LocaleKind::Country)
            .is_empty());
        assert!(resolve_locale("zz", LocaleEncoding::Language, LocaleKind::Country).is_empty());
    }

    #[test]
    fn unresolved_log_counts_distinct_values() {
        let log = UnresolvedLog::default();
        log.note("flickr", "unknown");
        log.note("flickr", "unknown");
        log.note("flickr", "Atlantis");
        assert_eq!(log.count(), 2);
    }
}
