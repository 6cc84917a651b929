//! SMPP framing layer.
//!
//! Wraps rusmpp's `CommandCodec` to police the declared command_length
//! before any decoding happens. Length violations are framing errors and are
//! reported separately from decode failures on a well-formed frame: the
//! session layer answers the former with `ESME_RINVCMDLEN` and the latter
//! with `ESME_RINVCMDID`, closing the connection in both cases.

use std::{fmt, io};

use bytes::BytesMut;
use rusmpp::{Command, tokio_codec::CommandCodec};
use tokio_util::codec::{Decoder, Encoder};

/// SMPP header: command_length + command_id + command_status + sequence_number.
const HEADER_LEN: u32 = 16;

#[derive(Debug)]
pub enum SmppCodecError {
    /// Declared command_length exceeds the configured maximum.
    OversizedFrame {
        declared: u32,
        max: u32,
        sequence_number: Option<u32>,
    },
    /// Declared command_length is shorter than an SMPP header.
    UndersizedFrame { declared: u32 },
    /// The frame was well-formed but its body did not decode.
    Decode(String),
    Io(io::Error),
}

impl SmppCodecError {
    /// Whether this is a framing violation (bad declared length) as opposed
    /// to a decode failure on a well-formed frame.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::OversizedFrame { .. } | Self::UndersizedFrame { .. }
        )
    }

    /// Sequence number recovered from the raw header, when enough of it was
    /// buffered to read one.
    pub fn sequence_number(&self) -> u32 {
        match self {
            Self::OversizedFrame {
                sequence_number, ..
            } => sequence_number.unwrap_or(0),
            _ => 0,
        }
    }
}

impl fmt::Display for SmppCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OversizedFrame { declared, max, .. } => {
                write!(f, "command_length {} exceeds maximum {}", declared, max)
            }
            Self::UndersizedFrame { declared } => {
                write!(f, "command_length {} is below the header size", declared)
            }
            Self::Decode(reason) => write!(f, "PDU decode failed: {}", reason),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for SmppCodecError {}

impl From<io::Error> for SmppCodecError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// `CommandCodec` with an upper bound on the declared frame length.
pub struct SmppCodec {
    inner: CommandCodec,
    max_pdu_size: u32,
}

impl SmppCodec {
    pub fn new(max_pdu_size: u32) -> Self {
        Self {
            inner: CommandCodec::new(),
            max_pdu_size,
        }
    }
}

impl Decoder for SmppCodec {
    type Item = Command;
    type Error = SmppCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, SmppCodecError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if declared < HEADER_LEN {
            return Err(SmppCodecError::UndersizedFrame { declared });
        }
        if declared > self.max_pdu_size {
            let sequence_number = (src.len() >= 16)
                .then(|| u32::from_be_bytes([src[12], src[13], src[14], src[15]]));
            return Err(SmppCodecError::OversizedFrame {
                declared,
                max: self.max_pdu_size,
                sequence_number,
            });
        }

        self.inner
            .decode(src)
            .map_err(|e| SmppCodecError::Decode(e.to_string()))
    }
}

impl Encoder<Command> for SmppCodec {
    type Error = SmppCodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), SmppCodecError> {
        self.inner
            .encode(item, dst)
            .map_err(|e| SmppCodecError::Decode(e.to_string()))
    }
}

impl Encoder<&Command> for SmppCodec {
    type Error = SmppCodecError;

    fn encode(&mut self, item: &Command, dst: &mut BytesMut) -> Result<(), SmppCodecError> {
        self.inner
            .encode(item, dst)
            .map_err(|e| SmppCodecError::Decode(e.to_string()))
    }
}
