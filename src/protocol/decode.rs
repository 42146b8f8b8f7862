//! Protocol reply decoding

use super::message::Reply;
use bytes::BytesMut;
use std::io;

/// Maximum size of a single (possibly multi-line) reply.
///
/// Servers that keep sending continuation lines past this limit are rejected
/// instead of growing the read buffer without bound.
const MAX_REPLY_LENGTH: usize = 64 * 1024;

/// Decode one reply from the front of the buffer without consuming it
///
/// # Returns
/// `Ok((reply, consumed))` - Reply and number of bytes it occupies; the caller
/// advances the buffer
/// `Err(e)` with `UnexpectedEof` - the reply is not complete yet, read more
/// `Err(e)` with `InvalidData` - the bytes are not a valid reply
pub fn decode_reply(data: &BytesMut) -> io::Result<(Reply, usize)> {
    let mut offset = 0;
    let mut code: Option<u16> = None;
    let mut lines = Vec::new();

    loop {
        if offset > MAX_REPLY_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply exceeds maximum length {}", MAX_REPLY_LENGTH),
            ));
        }

        let rest = &data[offset..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            if data.len() > MAX_REPLY_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("reply exceeds maximum length {}", MAX_REPLY_LENGTH),
                ));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete reply",
            ));
        };

        let raw = &rest[..newline];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        offset += newline + 1;

        match code {
            None => {
                let parsed = parse_code(raw).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("reply does not start with a code: {:?}", line),
                    )
                })?;
                let text = line.get(4..).unwrap_or("").to_string();
                match raw.get(3) {
                    Some(b'-') => {
                        code = Some(parsed);
                        lines.push(text);
                    }
                    Some(b' ') | None => {
                        lines.push(text);
                        return Ok((
                            Reply {
                                code: parsed,
                                lines,
                            },
                            offset,
                        ));
                    }
                    Some(other) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unexpected separator 0x{:02X} after reply code", other),
                        ));
                    }
                }
            }
            Some(expected) => {
                let closes = parse_code(raw) == Some(expected)
                    && matches!(raw.get(3), Some(b' ') | None);
                if closes {
                    lines.push(line.get(4..).unwrap_or("").to_string());
                    return Ok((
                        Reply {
                            code: expected,
                            lines,
                        },
                        offset,
                    ));
                }
                lines.push(line.into_owned());
            }
        }
    }
}

fn parse_code(line: &[u8]) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    (100..600).contains(&code).then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_line() {
        let data = BytesMut::from(&b"220 Welcome to test FTP\r\n"[..]);
        let (reply, consumed) = decode_reply(&data).unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["Welcome to test FTP".to_string()]);
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_decode_multi_line() {
        let data = BytesMut::from(
            &b"220-Welcome\r\n banner line\r\n220 ready\r\n331 next\r\n"[..],
        );
        let (reply, consumed) = decode_reply(&data).unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.lines[2], "ready");
        // Only the first reply is consumed
        assert_eq!(&data[consumed..], b"331 next\r\n");
    }

    #[test]
    fn test_decode_multi_line_ignores_other_codes_inside() {
        let data = BytesMut::from(&b"211-Features:\r\n230 not a terminator\r\n211 End\r\n"[..]);
        let (reply, _) = decode_reply(&data).unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.lines[1], "230 not a terminator");
    }

    #[test]
    fn test_decode_bare_newline_terminator() {
        let data = BytesMut::from(&b"230 Logged in\n"[..]);
        let (reply, consumed) = decode_reply(&data).unwrap();
        assert_eq!(reply.code, 230);
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_decode_incomplete() {
        let data = BytesMut::from(&b"220 Welc"[..]);
        let err = decode_reply(&data).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let data = BytesMut::from(&b"220-Welcome\r\nmore\r\n"[..]);
        let err = decode_reply(&data).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let data = BytesMut::from(&b"HTTP/1.1 400 Bad Request\r\n"[..]);
        let err = decode_reply(&data).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_oversized_reply() {
        let mut data = BytesMut::from(&b"220-"[..]);
        data.extend_from_slice(&vec![b'x'; MAX_REPLY_LENGTH + 1]);
        let err = decode_reply(&data).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
