pub mod action;
pub mod device;
pub mod format;
pub mod plan;
pub mod record;

use humanize_rs::bytes;

use crate::errors::BlkError;

/// Parses a human byte string ("8G", "500 MiB") into a byte count.
pub fn parse_human_bytes(s: &str) -> Result<u64, BlkError> {
    (s.to_lowercase())
        .parse::<bytes::Bytes>()
        .map(|b| b.size() as u64)
        .map_err(|err| BlkError::BadPlan(format!("bad byte unit string {s}: {err}")))
}

#[test]
fn test_parse_human_bytes() {
    let valids = vec![
        ("1k", 1000u64),
        ("1kb", 1000),
        ("1Ki", 1024),
        ("1KiB", 1024),
        ("8G", 8_000_000_000),
        ("1 GiB", 1 << 30),
        ("10 MiB", 10 << 20),
    ];

    for (s, expected) in valids {
        let got = parse_human_bytes(s)
            .unwrap_or_else(|err| panic!("{s} should be valid: {err}"));

        assert_eq!(got, expected, "parsing {s}");
    }

    let invalids = vec!["", "G", "-1G", "0.5G", "2000EiB"];

    for s in invalids {
        if let Ok(bytes) = parse_human_bytes(s) {
            panic!("{s} should be invalid, but got {bytes:?}");
        }
    }
}
