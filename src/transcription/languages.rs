use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const BUILTIN_LANGUAGES: &[(&str, &str)] = &[
    ("english", "en"),
    ("spanish", "es"),
    ("french", "fr"),
    ("german", "de"),
    ("italian", "it"),
    ("portuguese", "pt"),
    ("dutch", "nl"),
    ("russian", "ru"),
    ("chinese", "zh"),
    ("japanese", "ja"),
    ("korean", "ko"),
    ("arabic", "ar"),
    ("hindi", "hi"),
    ("bengali", "bn"),
    ("urdu", "ur"),
    ("turkish", "tr"),
    ("polish", "pl"),
    ("ukrainian", "uk"),
    ("vietnamese", "vi"),
    ("indonesian", "id"),
    ("swedish", "sv"),
    ("greek", "el"),
    ("hebrew", "he"),
    ("tamil", "ta"),
    ("telugu", "te"),
];

/// Maps human language names to backend language codes
#[derive(Debug, Clone)]
pub struct LanguageMap {
    names: HashMap<String, String>,
    default_code: String,
}

impl LanguageMap {
    pub fn new(default_code: &str, extra: &BTreeMap<String, String>) -> Self {
        let mut names: HashMap<String, String> = BUILTIN_LANGUAGES
            .iter()
            .map(|(name, code)| (name.to_string(), code.to_string()))
            .collect();

        for (name, code) in extra {
            names.insert(name.trim().to_lowercase(), code.trim().to_lowercase());
        }

        Self {
            names,
            default_code: default_code.trim().to_lowercase(),
        }
    }

    /// Resolve a language name or code; unknown input yields the default code
    pub fn resolve(&self, language: &str) -> String {
        let key = language.trim().to_lowercase();

        if let Some(code) = self.names.get(&key) {
            return code.clone();
        }

        if self.names.values().any(|code| *code == key) {
            return key;
        }

        debug!(
            "Unknown language '{}', falling back to '{}'",
            language, self.default_code
        );
        self.default_code.clone()
    }

    pub fn default_code(&self) -> &str {
        &self.default_code
    }

    /// Supported language names, sorted
    pub fn supported(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for LanguageMap {
    fn default() -> Self {
        Self::new("en", &BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_map_to_codes() {
        let map = LanguageMap::default();
        assert_eq!(map.resolve("english"), "en");
        assert_eq!(map.resolve("Spanish"), "es");
        assert_eq!(map.resolve("  JAPANESE "), "ja");
    }

    #[test]
    fn test_codes_pass_through() {
        let map = LanguageMap::default();
        assert_eq!(map.resolve("fr"), "fr");
    }

    #[test]
    fn test_unknown_language_uses_default() {
        let map = LanguageMap::new("es", &BTreeMap::new());
        assert_eq!(map.resolve("klingon"), "es");
        assert_eq!(map.resolve(""), "es");
    }

    #[test]
    fn test_extra_languages_extend_the_table() {
        let mut extra = BTreeMap::new();
        extra.insert("Catalan".to_string(), "ca".to_string());
        let map = LanguageMap::new("en", &extra);
        assert_eq!(map.resolve("catalan"), "ca");
        assert!(map.supported().contains(&"catalan"));
    }
}
