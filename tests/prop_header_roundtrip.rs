// Property: a message head in canonical form ("Name: value\r\n" lines)
// serializes back to exactly the bytes it was parsed from, whether parsed
// from memory or read from a stream.

use nicocache::http::{HttpMessage, RequestHeader};
use proptest::prelude::*;

fn field_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9-]{0,15}"
}

/// Printable ISO-8859-1 without leading whitespace
fn field_value() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[!-~\u{a0}-\u{ff}][ -~\u{a0}-\u{ff}]{0,30}",
    ]
}

fn canonical_head(start_line: &str, fields: &[(String, String)]) -> Vec<u8> {
    let mut text = format!("{}\r\n", start_line);
    for (name, value) in fields {
        text.push_str(&format!("{}: {}\r\n", name, value));
    }
    text.push_str("\r\n");
    nicocache::http::encode_latin1(&text)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_canonical_head_round_trips(
        path in "/[a-z0-9/._-]{0,20}",
        fields in prop::collection::vec((field_name(), field_value()), 0..12),
    ) {
        let start_line = format!("GET http://example.com{} HTTP/1.1", path);
        let bytes = canonical_head(&start_line, &fields);

        let parsed = HttpMessage::parse(&bytes).expect("canonical head parses");
        prop_assert_eq!(&parsed.start_line, &start_line);
        prop_assert_eq!(parsed.fields.len(), fields.len());
        prop_assert_eq!(parsed.to_bytes(), bytes.clone());

        let mut reader = &bytes[..];
        let read = tokio_test::block_on(HttpMessage::read_from(&mut reader))
            .expect("canonical head reads");
        prop_assert_eq!(read, parsed);
    }

    #[test]
    fn prop_trailing_bytes_are_left_unread(
        fields in prop::collection::vec((field_name(), field_value()), 0..6),
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let head = canonical_head("POST http://example.com/ HTTP/1.1", &fields);
        let mut stream = head.clone();
        stream.extend_from_slice(&body);

        let mut reader = &stream[..];
        let request = tokio_test::block_on(RequestHeader::read_from(&mut reader))
            .expect("head reads");
        prop_assert_eq!(request.method(), "POST");
        prop_assert_eq!(request.to_bytes(), head);
        prop_assert_eq!(reader, &body[..]);
    }

    #[test]
    fn prop_lookup_returns_last_value(
        name in field_name(),
        values in prop::collection::vec(field_value(), 1..5),
    ) {
        let fields: Vec<(String, String)> =
            values.iter().map(|v| (name.clone(), v.clone())).collect();
        let bytes = canonical_head("HTTP/1.1 200 OK", &fields);
        let parsed = HttpMessage::parse(&bytes).unwrap();

        prop_assert_eq!(parsed.fields.get(&name.to_ascii_uppercase()), values.last().map(String::as_str));
        prop_assert_eq!(parsed.fields.get_all(&name).len(), values.len());
    }
}
