//! Ordered name/value multimap with query-string and form-post encoders
//!
//! OIDC responses arrive as query strings or form bodies and leave the
//! pipeline the same way. `Parameters` keeps insertion order so encoded
//! output is stable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use url::form_urlencoded;

/// Replacement value for redacted fields
pub const REDACTED: &str = "***REDACTED***";

/// Fields that must never reach a log sink in clear text
pub const SENSITIVE_FIELDS: &[&str] = &[
    "code",
    "id_token",
    "access_token",
    "refresh_token",
    "client_secret",
    "code_verifier",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    entries: Vec<(String, Vec<String>)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `application/x-www-form-urlencoded` text (query string or form body)
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('?').unwrap_or(text);
        form_urlencoded::parse(text.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect()
    }

    /// Build from a dictionary, skipping absent values
    pub fn from_dictionary<I, K, V>(data: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        data.into_iter()
            .filter_map(|(name, value)| value.map(|v| (name.into(), v.into())))
            .collect()
    }

    /// Append a value, keeping any existing values for `name`
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => self.entries[index].1.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Replace all values of `name` with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set_all(name.into(), vec![value.into()]);
    }

    fn set_all(&mut self, name: String, values: Vec<String>) {
        match self.position(&name) {
            Some(index) => self.entries[index].1 = values,
            None => self.entries.push((name, values)),
        }
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.position(name)
            .map(|index| self.entries[index].1.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name)
            .map(|index| self.entries.remove(index).1)
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    /// Overwrite entries with same-named entries from `extras`; unrelated names are kept
    pub fn merge(&mut self, extras: &Parameters) {
        for (name, values) in &extras.entries {
            self.set_all(name.clone(), values.clone());
        }
    }

    /// Overwrite entries from any displayable values
    pub fn merge_map<I, K, V>(&mut self, extras: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Display,
    {
        for (name, value) in extras {
            self.set(name, value.to_string());
        }
    }

    /// Percent-encode all pairs; multi-valued names repeat, spaces become `%20`
    pub fn to_query_string(&self) -> String {
        let mut pairs = Vec::with_capacity(self.entries.len());
        for (name, values) in &self.entries {
            if values.is_empty() {
                pairs.push(encode_pair(name, ""));
            }
            for value in values {
                pairs.push(encode_pair(name, value));
            }
        }
        pairs.join("&")
    }

    /// One hidden input per name carrying its first value
    pub fn to_form_post(&self) -> String {
        let mut html = String::with_capacity(128);
        for (name, values) in &self.entries {
            let value = values.first().map(String::as_str).unwrap_or_default();
            html.push_str(&format!(
                "<input type='hidden' name='{}' value='{}' />\n",
                html_escape(name),
                html_escape(value)
            ));
        }
        html
    }

    /// Copy of all pairs with values of `redact` names replaced by [`REDACTED`]
    ///
    /// This is the only form in which OIDC payloads may be logged.
    pub fn to_scrubbed_dictionary(&self, redact: &[&str]) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, values)| {
                let value = if redact.contains(&name.as_str()) {
                    REDACTED.to_string()
                } else {
                    values.join(",")
                };
                (name.clone(), value)
            })
            .collect()
    }

    pub fn to_dictionary(&self) -> BTreeMap<String, String> {
        self.to_scrubbed_dictionary(&[])
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (name, value) in iter {
            params.add(name, value);
        }
        params
    }
}

fn encode_pair(name: &str, value: &str) -> String {
    let name = url_encode(name);
    if value.is_empty() {
        name
    } else {
        format!("{}={}", name, url_encode(value))
    }
}

/// Form-encode, then turn form-style `+` spaces into `%20`.
/// A literal `+` is already escaped as `%2B` at this point.
fn url_encode(text: &str) -> String {
    form_urlencoded::byte_serialize(text.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// HTML escape for attribute values
pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
