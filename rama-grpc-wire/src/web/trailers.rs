use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::Status;
use crate::codec::frame::{HEADER_SIZE, TRAILER_FLAG};

/// Encode `trailers` as a grpc-web trailer frame.
///
/// Each entry becomes a `name: value\r\n` line, names are lowercase.
pub fn encode_trailers(trailers: &HeaderMap) -> Bytes {
    let block_len: usize = trailers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum();

    let mut block = BytesMut::with_capacity(block_len);
    for (name, value) in trailers {
        block.put_slice(name.as_str().as_bytes());
        block.put_slice(b": ");
        block.put_slice(value.as_bytes());
        block.put_slice(b"\r\n");
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + block.len());
    frame.put_u8(TRAILER_FLAG);
    frame.put_u32(u32::try_from(block.len()).unwrap_or(u32::MAX));
    frame.put(block);
    frame.freeze()
}

/// Decode the payload of a grpc-web trailer frame.
///
/// Lines may end in `\r\n` or `\n`, names are matched case-insensitively.
pub fn decode_trailers(block: &[u8]) -> Result<HeaderMap, Status> {
    let mut trailers = HeaderMap::new();

    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return Err(Status::internal("protocol error: malformed grpc-web trailer line"));
        };
        let name = HeaderName::from_bytes(line[..colon].trim_ascii()).map_err(|_err| {
            Status::internal("protocol error: invalid grpc-web trailer name")
        })?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii()).map_err(|_err| {
            Status::internal("protocol error: invalid grpc-web trailer value")
        })?;
        trailers.append(name, value);
    }

    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn encode_layout() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.insert("grpc-message", HeaderValue::from_static("ok"));

        let frame = encode_trailers(&trailers);
        assert_eq!(frame[0], TRAILER_FLAG);
        assert_eq!(
            &frame[HEADER_SIZE..],
            b"grpc-status: 0\r\ngrpc-message: ok\r\n"
        );
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(len, frame.len() - HEADER_SIZE);

        let decoded = decode_trailers(&frame[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, trailers);
    }

    #[test]
    fn decode_is_lenient() {
        let trailers = decode_trailers(b"Grpc-Status:13\nx-a: 1\r\nx-a:  2 \r\n\r\n").unwrap();
        assert_eq!(trailers["grpc-status"], "13");
        let values: Vec<_> = trailers.get_all("x-a").iter().collect();
        assert_eq!(values, ["1", "2"]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_trailers(b"no colon here\r\n").unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
