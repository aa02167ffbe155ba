use std::time::Duration;

use http::{HeaderMap, HeaderValue};

use super::GRPC_TIMEOUT_HEADER;

/// Largest `TimeoutValue`, the protocol allows at most 8 digits.
const MAX_TIMEOUT_VALUE: u128 = 99_999_999;
const MAX_TIMEOUT: &str = "99999999H";

const UNITS: [(u128, char); 6] = [
    (1, 'n'),
    (1_000, 'u'),
    (1_000_000, 'm'),
    (1_000_000_000, 'S'),
    (60_000_000_000, 'M'),
    (3_600_000_000_000, 'H'),
];

/// Encode a remaining timeout as a `grpc-timeout` value, using the most
/// precise unit that fits in 8 digits. Values are rounded up.
pub(crate) fn encode_grpc_timeout(timeout: Duration) -> HeaderValue {
    let nanos = timeout.as_nanos();
    for (per_unit, unit) in UNITS {
        let value = nanos.div_ceil(per_unit);
        if value <= MAX_TIMEOUT_VALUE {
            return HeaderValue::try_from(format!("{value}{unit}"))
                .unwrap_or_else(|_err| HeaderValue::from_static(MAX_TIMEOUT));
        }
    }
    HeaderValue::from_static(MAX_TIMEOUT)
}

/// Tries to parse the `grpc-timeout` header if it is present. If we fail to parse, returns
/// the value we attempted to parse.
///
/// Follows the [gRPC over HTTP2 spec](https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md).
pub(crate) fn try_parse_grpc_timeout(
    headers: &HeaderMap<HeaderValue>,
) -> Result<Option<Duration>, &HeaderValue> {
    let Some(val) = headers.get(GRPC_TIMEOUT_HEADER) else {
        return Ok(None);
    };

    let (timeout_value, timeout_unit) = val
        .to_str()
        .map_err(|_err| val)
        .and_then(|s| if s.is_empty() { Err(val) } else { Ok(s) })?
        // ASCII only, so splitting before the last byte stays on a char boundary
        .split_at(val.len() - 1);

    // at most 8 digits, which also rules out overflow below
    if timeout_value.len() > 8 {
        return Err(val);
    }

    let timeout_value: u64 = timeout_value.parse().map_err(|_err| val)?;

    let duration = match timeout_unit {
        "H" => Duration::from_secs(timeout_value * 60 * 60),
        "M" => Duration::from_secs(timeout_value * 60),
        "S" => Duration::from_secs(timeout_value),
        "m" => Duration::from_millis(timeout_value),
        "u" => Duration::from_micros(timeout_value),
        "n" => Duration::from_nanos(timeout_value),
        _ => return Err(val),
    };

    Ok(Some(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn setup_map_try_parse(val: Option<&str>) -> Result<Option<Duration>, HeaderValue> {
        let mut hm = HeaderMap::new();
        if let Some(v) = val {
            let hv = HeaderValue::from_str(v).unwrap();
            hm.insert(GRPC_TIMEOUT_HEADER, hv);
        };

        try_parse_grpc_timeout(&hm).map_err(|e| e.clone())
    }

    #[test]
    fn test_units() {
        for (raw, expected) in [
            ("3H", Duration::from_secs(3 * 60 * 60)),
            ("1M", Duration::from_secs(60)),
            ("42S", Duration::from_secs(42)),
            ("13m", Duration::from_millis(13)),
            ("2u", Duration::from_micros(2)),
            ("82n", Duration::from_nanos(82)),
        ] {
            let parsed = setup_map_try_parse(Some(raw)).unwrap().unwrap();
            assert_eq!(expected, parsed, "parsing {raw}");
        }
    }

    #[test]
    fn test_header_not_present() {
        assert!(setup_map_try_parse(None).unwrap().is_none());
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(setup_map_try_parse(Some("82f")).unwrap_err(), "82f");
        assert_eq!(
            setup_map_try_parse(Some("123456789H")).unwrap_err(),
            "123456789H"
        );
        assert_eq!(setup_map_try_parse(Some("oneH")).unwrap_err(), "oneH");
        assert_eq!(setup_map_try_parse(Some("")).unwrap_err(), "");
    }

    #[test]
    fn test_encode_picks_precise_unit() {
        assert_eq!(encode_grpc_timeout(Duration::from_nanos(82)), "82n");
        assert_eq!(encode_grpc_timeout(Duration::from_millis(250)), "250000u");
        assert_eq!(encode_grpc_timeout(Duration::from_secs(30)), "30000000u");
        assert_eq!(encode_grpc_timeout(Duration::from_secs(3 * 86_400)), "259200S");
        assert_eq!(
            encode_grpc_timeout(Duration::from_secs(u64::MAX)),
            MAX_TIMEOUT
        );
    }

    #[quickcheck]
    fn encoded_timeout_never_shortens(millis: u32) -> bool {
        let timeout = Duration::from_millis(u64::from(millis));
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_TIMEOUT_HEADER, encode_grpc_timeout(timeout));
        let parsed = try_parse_grpc_timeout(&headers).unwrap().unwrap();
        parsed >= timeout
    }

    #[quickcheck]
    fn fuzz(header_value: HeaderValueGen) -> bool {
        // this just shouldn't panic
        let _ = setup_map_try_parse(Some(&header_value.0));
        true
    }

    #[derive(Clone, Debug)]
    struct HeaderValueGen(String);

    impl Arbitrary for HeaderValueGen {
        fn arbitrary(g: &mut Gen) -> Self {
            let max = g.choose(&(1..70).collect::<Vec<_>>()).copied().unwrap();
            let bytes: Vec<_> = (0..max)
                .map(|_| {
                    g.choose(b"ABCDEFGHIJKLMNOPQRSTUVabcdefghilpqrstuvwxyz0123456789----")
                        .copied()
                        .unwrap()
                })
                .collect();
            Self(String::from_utf8(bytes).unwrap())
        }
    }
}
