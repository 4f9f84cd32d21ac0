//! HTTP/1.x message codec
//!
//! Header bytes are mapped 1:1 to `char`s (ISO-8859-1), so a parsed message
//! serializes back to the bytes it was read from. Values carrying text in
//! another charset are converted explicitly with
//! [`HeaderFields::get_decoded`] and [`HeaderFields::set_encoded`].

pub mod headers;
pub mod message;

pub use headers::HeaderFields;
pub use message::{HttpMessage, RequestHeader, ResponseHeader, MAX_HEADER_BYTES};

/// Decode bytes with the byte-preserving mapping
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Encode a string with the byte-preserving mapping
///
/// Characters outside U+0000..=U+00FF cannot be represented and become `?`.
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
