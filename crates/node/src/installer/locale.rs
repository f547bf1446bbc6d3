//! Locale-aware resolution of `__MSG_*__` manifest strings.

use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;

lazy_static! {
    static ref MSG_PLACEHOLDER: regex::Regex =
        regex::Regex::new(r"(?i)^__MSG_(.+)__$").unwrap();
}

/// Candidate locales, most specific first: the app locale with `-`
/// normalized to `_`, its language root, the manifest's default locale and
/// finally `en`. Deduplicated, order preserved.
pub fn candidates(app_locale: &str, default_locale: Option<&str>) -> Vec<String> {
    let normalized = app_locale.replace('-', "_");
    let root = normalized
        .split('_')
        .next()
        .unwrap_or_default()
        .to_string();

    let mut out = vec![];
    for candidate in [
        Some(normalized),
        Some(root),
        default_locale.map(str::to_string),
        Some("en".to_string()),
    ]
    .into_iter()
    .flatten()
    {
        if !candidate.is_empty() && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

/// Load the message table of the first candidate with a
/// `_locales/<candidate>/messages.json`. Unreadable or unparseable tables
/// are treated as absent.
pub fn load_messages(root: &Path, candidates: &[String]) -> HashMap<String, String> {
    for candidate in candidates {
        let path = root.join("_locales").join(candidate).join("messages.json");
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        let Ok(table) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            tracing::warn!("Ignoring unparseable locale table {}", path.display());
            continue;
        };
        let Some(entries) = table.as_object() else {
            continue;
        };
        return entries
            .iter()
            .filter_map(|(key, entry)| {
                let text = entry
                    .get("message")
                    .or_else(|| entry.get("value"))
                    .and_then(|v| v.as_str())?;
                Some((key.to_lowercase(), text.to_string()))
            })
            .collect();
    }
    HashMap::new()
}

/// Resolve `value` against the message table. Non-placeholder values and
/// missing keys come back unchanged.
pub fn localize(value: &str, messages: &HashMap<String, String>) -> String {
    let Some(captures) = MSG_PLACEHOLDER.captures(value) else {
        return value.to_string();
    };
    let key = captures
        .get(1)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();
    messages
        .get(&key)
        .cloned()
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_order_and_dedup() {
        assert_eq!(
            candidates("pt-BR", Some("es")),
            vec!["pt_BR", "pt", "es", "en"]
        );
        assert_eq!(candidates("en", None), vec!["en"]);
        assert_eq!(candidates("en-US", Some("en")), vec!["en_US", "en"]);
    }

    #[test]
    fn test_localize_placeholder() {
        let mut messages = HashMap::new();
        messages.insert("appname".to_string(), "My Extension".to_string());

        assert_eq!(localize("__MSG_appName__", &messages), "My Extension");
        assert_eq!(localize("__msg_APPNAME__", &messages), "My Extension");
        assert_eq!(localize("plain name", &messages), "plain name");
        assert_eq!(localize("__MSG_unknown__", &messages), "__MSG_unknown__");
    }

    #[test]
    fn test_load_messages_prefers_first_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let pt = dir.path().join("_locales/pt_BR");
        let en = dir.path().join("_locales/en");
        std::fs::create_dir_all(&pt).unwrap();
        std::fs::create_dir_all(&en).unwrap();
        std::fs::write(
            pt.join("messages.json"),
            br#"{"appName": {"message": "Minha"}}"#,
        )
        .unwrap();
        std::fs::write(
            en.join("messages.json"),
            br#"{"appName": {"message": "Mine"}, "other": {"value": "v"}}"#,
        )
        .unwrap();

        let table = load_messages(
            dir.path(),
            &candidates("pt-BR", None),
        );
        assert_eq!(table.get("appname").map(String::as_str), Some("Minha"));

        let table = load_messages(dir.path(), &candidates("fr", None));
        assert_eq!(table.get("appname").map(String::as_str), Some("Mine"));
        assert_eq!(table.get("other").map(String::as_str), Some("v"));
    }
}
