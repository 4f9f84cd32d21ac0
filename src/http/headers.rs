//! Ordered header multimap

use super::{decode_latin1, encode_latin1};
use encoding_rs::Encoding;
use std::time::SystemTime;

/// Headers that describe a single transport leg
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// Header fields in wire order
///
/// Names compare case-insensitively. A name may appear several times;
/// single-value lookups return the last occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    entries: Vec<(String, String)>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in insertion order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Replace all values of `name` with a single value
    ///
    /// The field keeps the position of its first occurrence, or is appended
    /// when it was absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// Append a value, keeping any existing ones
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    /// Remove every value of `name`; returns whether anything was removed
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace each field named in `overrides` with the overriding values
    pub fn apply_overrides(&mut self, overrides: &HeaderFields) {
        for (name, _) in &overrides.entries {
            self.remove(name);
        }
        for (name, value) in &overrides.entries {
            self.add(name, value.clone());
        }
    }

    /// Last value of `name` decoded from `charset`
    ///
    /// An unknown charset label yields the raw value.
    pub fn get_decoded(&self, name: &str, charset: &str) -> Option<String> {
        let raw = self.get(name)?;
        match Encoding::for_label(charset.as_bytes()) {
            Some(encoding) => {
                let bytes = encode_latin1(raw);
                let (text, _) = encoding.decode_without_bom_handling(&bytes);
                Some(text.into_owned())
            }
            None => Some(raw.to_string()),
        }
    }

    /// Set `name` to `value` encoded in `charset`
    ///
    /// An unknown charset label stores the value unchanged.
    pub fn set_encoded(&mut self, name: &str, value: &str, charset: &str) {
        match Encoding::for_label(charset.as_bytes()) {
            Some(encoding) => {
                let (bytes, _, _) = encoding.encode(value);
                self.set(name, decode_latin1(&bytes));
            }
            None => self.set(name, value),
        }
    }

    /// Declared body length; `None` when absent or unparsable
    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.set("Content-Length", length.to_string());
    }

    /// Date-valued field; parse failures read as absent
    pub fn date(&self, name: &str) -> Option<SystemTime> {
        self.get(name)
            .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
    }

    /// Set a date-valued field in RFC 1123 format at GMT
    pub fn set_date(&mut self, name: &str, time: SystemTime) {
        self.set(name, httpdate::fmt_http_date(time));
    }

    /// Strip `Connection`, every field it names, and the fixed hop-by-hop set
    pub fn remove_hop_by_hop(&mut self) {
        let listed: Vec<String> = self
            .get_all("Connection")
            .iter()
            .flat_map(|v| v.split(','))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect();

        for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
            self.remove(name);
        }
    }

    /// Whether the `Connection` field carries `token`
    pub fn connection_has(&self, token: &str) -> bool {
        self.get_all("Connection")
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend(encode_latin1(name));
            out.extend_from_slice(b": ");
            out.extend(encode_latin1(value));
            out.extend_from_slice(b"\r\n");
        }
    }
}
