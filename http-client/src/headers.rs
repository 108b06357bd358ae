//! Case-insensitive HTTP header map.

use std::fmt;

/// Headers whose repeated occurrences replace the previous value instead of
/// being joined with `", "`.
const SINGLE_VALUED: [&str; 3] = ["Content-Length", "Location", "Host"];

/// Normalise a header name the way every lookup sees it: the first letter of
/// each alphabetic run upper-cased, the rest lower-cased.
///
/// ```
/// assert_eq!(http_client::normalize_name("content-length"), "Content-Length");
/// assert_eq!(http_client::normalize_name("SID"), "Sid");
/// ```
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_word = false;
    for c in name.trim().chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

/// Ordered header collection keyed by normalised name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a header, looked up case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = normalize_name(name);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether the comma-separated header value lists `token`
    /// (ASCII case-insensitive, surrounding spaces ignored).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token.trim()))
        })
    }

    /// Add a header as it appears on the wire: repeats are joined with
    /// `", "` except for `Content-Length`, `Location` and `Host`, which keep
    /// the last value.
    pub fn append(&mut self, name: &str, value: &str) {
        let key = normalize_name(name);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) if SINGLE_VALUED.contains(&key.as_str()) => {
                *existing = value.to_string();
            }
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.entries.push((key, value.to_string())),
        }
    }

    /// Set a header, replacing any previous value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let key = normalize_name(name);
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let key = normalize_name(name);
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wire form: one `Name: value\r\n` line per header.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v.as_ref());
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("content-length", "Content-Length")]
    #[case("CONTENT-TYPE", "Content-Type")]
    #[case("sid", "Sid")]
    #[case("nt", "Nt")]
    #[case("cache-control", "Cache-Control")]
    #[case("x-dlna2test", "X-Dlna2Test")]
    #[case("  host ", "Host")]
    fn test_normalize_name(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_name(raw), expected);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("LOCATION", "http://192.168.1.2/desc.xml");
        assert_eq!(headers.get("location"), Some("http://192.168.1.2/desc.xml"));
        assert_eq!(headers.get("Location"), Some("http://192.168.1.2/desc.xml"));
        assert!(headers.contains("LoCaTiOn"));
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/xml");
        headers.append("accept", "text/html");
        assert_eq!(headers.get("Accept"), Some("text/xml, text/html"));
    }

    #[rstest]
    #[case("Content-Length")]
    #[case("Location")]
    #[case("Host")]
    fn test_single_valued_headers_keep_last(#[case] name: &str) {
        let mut headers = Headers::new();
        headers.append(name, "first");
        headers.append(name, "second");
        assert_eq!(headers.get(name), Some("second"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_has_token() {
        let mut headers = Headers::new();
        headers.insert("Connection", "Keep-Alive, Upgrade");
        assert!(headers.has_token("connection", "keep-alive"));
        assert!(headers.has_token("connection", "upgrade"));
        assert!(!headers.has_token("connection", "close"));
        assert!(!headers.has_token("transfer-encoding", "chunked"));
    }

    #[test]
    fn test_insert_remove_and_display() {
        let mut headers: Headers = [("host", "a"), ("accept-encoding", "identity")]
            .into_iter()
            .collect();
        headers.insert("HOST", "b");
        assert_eq!(headers.to_string(), "Host: b\r\nAccept-Encoding: identity\r\n");
        assert_eq!(headers.remove("host"), Some("b".to_string()));
        assert_eq!(headers.remove("host"), None);
        assert_eq!(headers.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_normalization_is_idempotent(name in "[a-zA-Z0-9-]{0,24}") {
            let once = normalize_name(&name);
            prop_assert_eq!(normalize_name(&once), once.clone());
            prop_assert!(once.eq_ignore_ascii_case(name.trim()));
        }

        #[test]
        fn prop_any_casing_finds_header(name in "[a-z]{1,8}(-[a-z]{1,8}){0,2}", value in "[ -~]{0,16}") {
            let mut headers = Headers::new();
            headers.insert(&name.to_uppercase(), value.clone());
            prop_assert_eq!(headers.get(&name), Some(value.as_str()));
        }
    }
}
