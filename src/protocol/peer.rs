//! Block-level requests served by storage nodes.
//!
//! One datagram per request. The header is ASCII, space-separated; a `WRITE`
//! frame carries the raw block after the fourth space and that payload must
//! survive byte-exact, spaces and newlines included.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use snafu::{OptionExt, Snafu};

use crate::raid::Role;

/// Largest datagram any peer must accept: a full block at the maximum
/// striping unit plus framing fits well within this.
pub const MAX_DATAGRAM: usize = 65_536;

/// Reply to a `READ` for a block the node does not hold.
pub const BLOCK_NOT_FOUND: &[u8] = b"BLOCK NOT FOUND";

/// Reply to `FAIL` once the store is wiped.
pub const FAIL_COMPLETE: &[u8] = b"fail-complete";

#[derive(Debug, Snafu)]
pub enum FrameError {
    #[snafu(display("empty datagram"))]
    Empty,

    #[snafu(display("{verb} frame is missing its {field} field"))]
    MissingField {
        verb: &'static str,
        field: &'static str,
    },

    #[snafu(display("{field} field is not valid UTF-8"))]
    NotUtf8 { field: &'static str },

    #[snafu(display("{verb} takes {expected} operands"))]
    WrongOperandCount {
        verb: &'static str,
        expected: usize,
    },

    #[snafu(display("bad stripe index {value:?}"))]
    BadStripe { value: String },

    #[snafu(display("bad drive index {value:?}"))]
    BadDrive { value: String },

    #[snafu(display("unknown block role {value:?}"))]
    BadRole { value: String },

    #[snafu(display("unknown verb {verb:?}"))]
    UnknownVerb { verb: String },
}

/// A single data-plane request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// Upsert one block. No reply.
    Write {
        file: String,
        stripe: u64,
        role: Role,
        payload: Bytes,
    },
    /// Fetch one block; replied with the stored bytes or [`BLOCK_NOT_FOUND`].
    /// The drive index rides along for diagnostics only.
    Read { file: String, stripe: u64, drive: usize },
    /// Wipe the whole store; replied with [`FAIL_COMPLETE`].
    Fail,
    /// Drop every block belonging to the named DSS. No reply.
    Delete { dss: String },
}

impl PeerRequest {
    pub fn encode(&self) -> Bytes {
        match self {
            PeerRequest::Write {
                file,
                stripe,
                role,
                payload,
            } => {
                let header = format!("WRITE {file} {stripe} {role} ");
                let mut buf = BytesMut::with_capacity(header.len() + payload.len());
                buf.put_slice(header.as_bytes());
                buf.put_slice(payload);
                buf.freeze()
            }
            PeerRequest::Read {
                file,
                stripe,
                drive,
            } => Bytes::from(format!("READ {file} {stripe} {drive}")),
            PeerRequest::Fail => Bytes::from_static(b"FAIL"),
            PeerRequest::Delete { dss } => Bytes::from(format!("DELETE {dss}")),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.is_empty() {
            return Err(FrameError::Empty);
        }

        let (verb, rest) = match memchr(b' ', buf) {
            Some(idx) => (&buf[..idx], &buf[idx + 1..]),
            None => (buf, &[][..]),
        };

        match verb {
            b"WRITE" => decode_write(rest),
            b"READ" => decode_read(rest),
            b"FAIL" => Ok(PeerRequest::Fail),
            b"DELETE" => decode_delete(rest),
            other => Err(FrameError::UnknownVerb {
                verb: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }
}

fn next_field<'a>(
    buf: &'a [u8],
    verb: &'static str,
    field: &'static str,
) -> Result<(&'a [u8], &'a [u8]), FrameError> {
    let idx = memchr(b' ', buf).context(MissingFieldSnafu { verb, field })?;
    Ok((&buf[..idx], &buf[idx + 1..]))
}

fn utf8<'a>(token: &'a [u8], field: &'static str) -> Result<&'a str, FrameError> {
    std::str::from_utf8(token)
        .ok()
        .context(NotUtf8Snafu { field })
}

fn parse_stripe(token: &str) -> Result<u64, FrameError> {
    token.parse().ok().context(BadStripeSnafu { value: token })
}

fn decode_write(rest: &[u8]) -> Result<PeerRequest, FrameError> {
    // The payload begins right after the fourth space and is taken verbatim.
    let (file, rest) = next_field(rest, "WRITE", "stripe")?;
    let (stripe, rest) = next_field(rest, "WRITE", "role")?;
    let (role, payload) = next_field(rest, "WRITE", "payload")?;

    let role = utf8(role, "role")?;
    let role: Role = role.parse().map_err(|_| FrameError::BadRole {
        value: role.to_string(),
    })?;

    Ok(PeerRequest::Write {
        file: utf8(file, "filename")?.to_string(),
        stripe: parse_stripe(utf8(stripe, "stripe")?)?,
        role,
        payload: Bytes::copy_from_slice(payload),
    })
}

fn decode_read(rest: &[u8]) -> Result<PeerRequest, FrameError> {
    let rest = utf8(rest, "operands")?;
    let operands: Vec<&str> = rest.split_ascii_whitespace().collect();
    let &[file, stripe, drive] = operands.as_slice() else {
        return Err(FrameError::WrongOperandCount {
            verb: "READ",
            expected: 3,
        });
    };

    Ok(PeerRequest::Read {
        file: file.to_string(),
        stripe: parse_stripe(stripe)?,
        drive: drive.parse().ok().context(BadDriveSnafu { value: drive })?,
    })
}

fn decode_delete(rest: &[u8]) -> Result<PeerRequest, FrameError> {
    let dss = utf8(rest, "dss")?.trim();
    if dss.is_empty() {
        return Err(FrameError::MissingField {
            verb: "DELETE",
            field: "dss",
        });
    }
    Ok(PeerRequest::Delete {
        dss: dss.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_round_trips_a_binary_payload() {
        // Spaces, newlines, and a stray "READ" inside the payload must all
        // come back untouched.
        let payload = Bytes::from_static(b"\x00\x01 two words\nREAD fake 9 9\xff\xfe");
        let frame = PeerRequest::Write {
            file: "foo.bin".to_string(),
            stripe: 7,
            role: Role::Parity,
            payload: payload.clone(),
        };

        let decoded = PeerRequest::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn write_header_shape() {
        let frame = PeerRequest::Write {
            file: "f".to_string(),
            stripe: 0,
            role: Role::Data,
            payload: Bytes::from_static(b"xyz"),
        };
        assert_eq!(&frame.encode()[..], b"WRITE f 0 data xyz");
    }

    #[test]
    fn read_fail_delete_round_trip() {
        for frame in [
            PeerRequest::Read {
                file: "a.txt".to_string(),
                stripe: 12,
                drive: 2,
            },
            PeerRequest::Fail,
            PeerRequest::Delete {
                dss: "D1".to_string(),
            },
        ] {
            assert_eq!(PeerRequest::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn truncated_write_is_rejected() {
        assert!(matches!(
            PeerRequest::decode(b"WRITE foo 3 data"),
            Err(FrameError::MissingField {
                field: "payload",
                ..
            })
        ));
    }

    #[test]
    fn garbage_is_rejected_not_panicked_on() {
        assert!(PeerRequest::decode(b"").is_err());
        assert!(PeerRequest::decode(b"STORE x 1 data y").is_err());
        assert!(PeerRequest::decode(b"READ onlytwo 5").is_err());
        assert!(PeerRequest::decode(b"WRITE f x data abc").is_err());
        assert!(PeerRequest::decode(b"WRITE f 1 checksum abc").is_err());
        assert!(PeerRequest::decode(b"DELETE ").is_err());
    }

    #[test]
    fn empty_write_payload_is_legal() {
        let decoded = PeerRequest::decode(b"WRITE f 1 data ").unwrap();
        assert_eq!(
            decoded,
            PeerRequest::Write {
                file: "f".to_string(),
                stripe: 1,
                role: Role::Data,
                payload: Bytes::new(),
            }
        );
    }
}
