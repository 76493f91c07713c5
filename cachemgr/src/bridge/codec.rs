//! Line codecs for the worker pipes.
//!
//! `LineCodec<T>` frames on `\n` with a hard maximum line length and converts
//! each line to a protocol type. `DrainCodec` frames worker stdout/stderr and
//! never fails on content: over-long lines are split, bad UTF-8 is replaced.

use std::marker::PhantomData;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{IncomingRequest, ProtocolError, Reply, Request};

/// A protocol message written as exactly one line.
pub trait EncodeLine {
    fn encode_line(&self, dst: &mut BytesMut);
}

/// A protocol message read from exactly one line.
pub trait DecodeLine: Sized {
    fn parse_line(line: &[u8]) -> Result<Self, ProtocolError>;

    /// Outcome for a line longer than the codec allows.
    fn too_long(max: usize) -> Result<Self, ProtocolError> {
        Err(ProtocolError::LineTooLong { max })
    }
}

impl EncodeLine for Request {
    fn encode_line(&self, dst: &mut BytesMut) {
        self.encode(dst);
    }
}

impl DecodeLine for Request {
    fn parse_line(line: &[u8]) -> Result<Self, ProtocolError> {
        Request::parse(line)
    }
}

impl EncodeLine for Reply {
    fn encode_line(&self, dst: &mut BytesMut) {
        self.encode(dst);
    }
}

impl DecodeLine for Reply {
    fn parse_line(line: &[u8]) -> Result<Self, ProtocolError> {
        Reply::parse(line)
    }
}

impl DecodeLine for IncomingRequest {
    fn parse_line(line: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match Request::parse(line) {
            Ok(request) => IncomingRequest::Request(request),
            Err(e) => IncomingRequest::Malformed(e),
        })
    }

    fn too_long(max: usize) -> Result<Self, ProtocolError> {
        Ok(IncomingRequest::Malformed(ProtocolError::LineTooLong { max }))
    }
}

/// Codec for one direction of the command channel.
///
/// An over-long line is reported once through `DecodeLine::too_long`, and
/// its remaining bytes are skipped up to the next `\n`.
pub struct LineCodec<T> {
    max_length: usize,
    next_index: usize,
    is_discarding: bool,
    _phantom: PhantomData<T>,
}

impl<T> LineCodec<T> {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            is_discarding: false,
            _phantom: PhantomData,
        }
    }
}

/// Split the next `\n`-terminated line off `src`, without the terminator.
fn take_line(src: &mut BytesMut, next_index: &mut usize) -> Option<BytesMut> {
    let offset = src[*next_index..].iter().position(|&b| b == b'\n')?;
    let end = *next_index + offset;
    *next_index = 0;
    let mut line = src.split_to(end + 1);
    line.truncate(end);
    if line.last() == Some(&b'\r') {
        line.truncate(end - 1);
    }
    Some(line)
}

impl<T: DecodeLine> Decoder for LineCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.is_discarding {
            match src.iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    src.advance(offset + 1);
                    self.is_discarding = false;
                }
                None => {
                    src.clear();
                    return Ok(None);
                }
            }
        }

        match take_line(src, &mut self.next_index) {
            Some(line) if line.len() > self.max_length => {
                tracing::debug!(line_len = line.len(), max = self.max_length, "Line too long");
                T::too_long(self.max_length).map(Some)
            }
            Some(line) => {
                tracing::trace!(line_len = line.len(), "Decoding line");
                T::parse_line(&line).map(Some)
            }
            None if src.len() > self.max_length => {
                tracing::debug!(max = self.max_length, "Line too long, discarding to newline");
                self.next_index = 0;
                self.is_discarding = true;
                T::too_long(self.max_length).map(Some)
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    tracing::debug!(bytes = src.len(), "Discarding unterminated line at EOF");
                    src.clear();
                }
                self.next_index = 0;
                self.is_discarding = false;
                Ok(None)
            }
        }
    }
}

impl<T: EncodeLine> Encoder<T> for LineCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        item.encode_line(dst);
        tracing::trace!(line_len = dst.len() - start, "Encoded line");
        Ok(())
    }
}

/// Codec for the worker's merged stdout/stderr.
pub struct DrainCodec {
    max_length: usize,
    next_index: usize,
}

impl DrainCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
        }
    }
}

impl Decoder for DrainCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = take_line(src, &mut self.next_index) {
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        if src.len() >= self.max_length {
            self.next_index = 0;
            let chunk = src.split_to(self.max_length);
            return Ok(Some(String::from_utf8_lossy(&chunk).into_owned()));
        }
        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = String::from_utf8_lossy(src.chunk()).into_owned();
        src.clear();
        Ok(Some(rest))
    }
}
