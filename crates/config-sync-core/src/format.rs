//! Config-file formats a namespace can be published in.
//!
//! The format is derived once from the namespace name (`application.yml`,
//! `rules.json`, ...). Non-properties namespaces carry their whole document in
//! a single `content` entry; [`ConfigFileFormat::as_properties`] flattens the
//! structured ones into dotted keys.

use figment::providers::{Format, Yaml};
use figment::Figment;
use serde_json::Value;
use thiserror::Error;

use crate::snapshot::ConfigEntries;

/// Entry holding the raw document of non-properties namespaces.
pub const CONTENT_KEY: &str = "content";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{0:?} namespaces cannot be viewed as properties")]
    Unsupported(ConfigFileFormat),
    #[error("namespace has no `content` entry")]
    MissingContent,
    #[error("invalid yaml document: {0}")]
    Yaml(String),
    #[error("invalid json document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document root must be a mapping")]
    NotAMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigFileFormat {
    Properties,
    Xml,
    Json,
    Yaml,
    Yml,
    Txt,
}

impl ConfigFileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFileFormat::Properties => "properties",
            ConfigFileFormat::Xml => "xml",
            ConfigFileFormat::Json => "json",
            ConfigFileFormat::Yaml => "yaml",
            ConfigFileFormat::Yml => "yml",
            ConfigFileFormat::Txt => "txt",
        }
    }

    /// Derives the format from a namespace name; no recognised extension means properties.
    pub fn from_namespace(namespace: &str) -> Self {
        let Some((_, ext)) = namespace.rsplit_once('.') else {
            return ConfigFileFormat::Properties;
        };
        match ext.to_ascii_lowercase().as_str() {
            "xml" => ConfigFileFormat::Xml,
            "json" => ConfigFileFormat::Json,
            "yaml" => ConfigFileFormat::Yaml,
            "yml" => ConfigFileFormat::Yml,
            "txt" => ConfigFileFormat::Txt,
            _ => ConfigFileFormat::Properties,
        }
    }

    /// Renders the namespace as a single document.
    pub fn content(&self, entries: &ConfigEntries) -> Option<String> {
        match self {
            ConfigFileFormat::Properties => Some(write_properties(entries)),
            _ => entries.get(CONTENT_KEY).cloned(),
        }
    }

    /// Views the namespace as flat key/value pairs.
    pub fn as_properties(&self, entries: &ConfigEntries) -> Result<ConfigEntries, FormatError> {
        match self {
            ConfigFileFormat::Properties => Ok(entries.clone()),
            ConfigFileFormat::Yaml | ConfigFileFormat::Yml => {
                let content = entries.get(CONTENT_KEY).ok_or(FormatError::MissingContent)?;
                let value: Value = Figment::from(Yaml::string(content))
                    .extract()
                    .map_err(|err| FormatError::Yaml(err.to_string()))?;
                flatten_document(&value)
            }
            ConfigFileFormat::Json => {
                let content = entries.get(CONTENT_KEY).ok_or(FormatError::MissingContent)?;
                let value: Value = serde_json::from_str(content)?;
                flatten_document(&value)
            }
            ConfigFileFormat::Xml | ConfigFileFormat::Txt => Err(FormatError::Unsupported(*self)),
        }
    }
}

fn flatten_document(value: &Value) -> Result<ConfigEntries, FormatError> {
    if !value.is_object() {
        return Err(FormatError::NotAMapping);
    }
    let mut out = ConfigEntries::new();
    flatten_into(&mut out, String::new(), value);
    Ok(out)
}

fn flatten_into(out: &mut ConfigEntries, prefix: String, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, path, child);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                flatten_into(out, format!("{prefix}[{idx}]"), child);
            }
        }
        Value::String(s) => {
            out.insert(prefix, s.clone());
        }
        Value::Null => {
            out.insert(prefix, String::new());
        }
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}

/// Parses the `.properties` text encoding.
///
/// Supports `#`/`!` comments, `=`, `:` or whitespace separators, backslash line
/// continuations and the usual escapes including `\uXXXX`.
pub fn parse_properties(text: &str) -> ConfigEntries {
    let mut entries = ConfigEntries::new();
    let mut logical = String::new();

    for raw_line in text.lines() {
        // Continuation lines drop their leading whitespace too.
        let line = raw_line.trim_start();
        if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }
        if ends_with_continuation(line) {
            logical.push_str(&line[..line.len() - 1]);
            continue;
        }
        logical.push_str(line);
        let (key, value) = split_key_value(&logical);
        entries.insert(unescape(key), unescape(value));
        logical.clear();
    }
    if !logical.is_empty() {
        let (key, value) = split_key_value(&logical);
        entries.insert(unescape(key), unescape(value));
    }
    entries
}

/// Writes entries in the `.properties` text encoding.
pub fn write_properties(entries: &ConfigEntries) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(&escape(key, true));
        out.push('=');
        out.push_str(&escape(value, false));
        out.push('\n');
    }
    out
}

fn ends_with_continuation(line: &str) -> bool {
    let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
    trailing % 2 == 1
}

fn split_key_value(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '=' | ':' => return (&line[..idx], line[idx + 1..].trim_start()),
            c if c.is_whitespace() => {
                let rest = line[idx..].trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                return (&line[..idx], rest.trim_start());
            }
            _ => {}
        }
    }
    (line, "")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape(s: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for (idx, ch) in s.chars().enumerate() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{c}' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' if is_key => {
                out.push('\\');
                out.push(ch);
            }
            ' ' if is_key || idx == 0 => out.push_str("\\ "),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> ConfigEntries {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn format_is_derived_from_namespace_extension() {
        assert_eq!(
            ConfigFileFormat::from_namespace("application"),
            ConfigFileFormat::Properties
        );
        assert_eq!(
            ConfigFileFormat::from_namespace("datasource.YML"),
            ConfigFileFormat::Yml
        );
        assert_eq!(
            ConfigFileFormat::from_namespace("rules.json"),
            ConfigFileFormat::Json
        );
        assert_eq!(
            ConfigFileFormat::from_namespace("team.common"),
            ConfigFileFormat::Properties
        );
    }

    #[test]
    fn parse_properties_handles_separators_comments_and_escapes() {
        let text = "# comment\n! other\nurl = http://host:80/\nname:demo\nspaced value\\\n   continued\nunicode=caf\\u00e9\nempty\n";
        let parsed = parse_properties(text);
        assert_eq!(parsed.get("url").map(String::as_str), Some("http://host:80/"));
        assert_eq!(parsed.get("name").map(String::as_str), Some("demo"));
        assert_eq!(
            parsed.get("spaced").map(String::as_str),
            Some("valuecontinued")
        );
        assert_eq!(parsed.get("unicode").map(String::as_str), Some("café"));
        assert_eq!(parsed.get("empty").map(String::as_str), Some(""));
        assert_eq!(parsed.len(), 5);
    }

    #[test]
    fn written_properties_parse_back_to_the_same_entries() {
        let original = entries(&[("a key", "line\nbreak"), ("x=y", " leading"), ("plain", "v")]);
        let text = write_properties(&original);
        assert_eq!(parse_properties(&text), original);
    }

    #[test]
    fn yaml_content_is_flattened_into_dotted_keys() {
        let yaml = "server:\n  port: 8080\n  hosts:\n    - a\n    - b\nenabled: true\n";
        let flat = ConfigFileFormat::Yaml
            .as_properties(&entries(&[(CONTENT_KEY, yaml)]))
            .expect("valid yaml");
        assert_eq!(flat.get("server.port").map(String::as_str), Some("8080"));
        assert_eq!(flat.get("server.hosts[1]").map(String::as_str), Some("b"));
        assert_eq!(flat.get("enabled").map(String::as_str), Some("true"));
    }

    #[test]
    fn json_content_is_flattened_and_xml_is_unsupported() {
        let flat = ConfigFileFormat::Json
            .as_properties(&entries(&[(CONTENT_KEY, r#"{"a":{"b":"c"}}"#)]))
            .expect("valid json");
        assert_eq!(flat.get("a.b").map(String::as_str), Some("c"));

        assert!(matches!(
            ConfigFileFormat::Json.as_properties(&entries(&[(CONTENT_KEY, "[1]")])),
            Err(FormatError::NotAMapping)
        ));
        assert!(matches!(
            ConfigFileFormat::Xml.as_properties(&entries(&[(CONTENT_KEY, "<a/>")])),
            Err(FormatError::Unsupported(ConfigFileFormat::Xml))
        ));
        assert!(matches!(
            ConfigFileFormat::Yaml.as_properties(&ConfigEntries::new()),
            Err(FormatError::MissingContent)
        ));
    }

    #[test]
    fn content_returns_document_or_properties_text() {
        let props = entries(&[("a", "1")]);
        assert_eq!(
            ConfigFileFormat::Properties.content(&props).as_deref(),
            Some("a=1\n")
        );
        let doc = entries(&[(CONTENT_KEY, "hello")]);
        assert_eq!(ConfigFileFormat::Txt.content(&doc).as_deref(), Some("hello"));
        assert_eq!(ConfigFileFormat::Txt.content(&props), None);
    }
}
