use super::types::{ParseError, ParseErrorKind};

const CRLF: &[u8] = b"\r\n";
const MAX_CHUNK_LINE: usize = 4096;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    /// The decoded size, when the framing announces it up front.
    pub fn known_length(self) -> Option<u64> {
        match self {
            BodyFraming::Empty => Some(0),
            BodyFraming::Length(length) => Some(length),
            BodyFraming::Chunked | BodyFraming::UntilClose => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    UntilClose,
    Done,
}

/// Incremental decoder for one message body.
///
/// Input can arrive in pieces of any size; every wire byte is looked at once.
/// Error offsets count from the first body byte.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    framing: BodyFraming,
    state: State,
    position: usize,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty | BodyFraming::Length(0) => State::Done,
            BodyFraming::Length(remaining) => State::Length { remaining },
            BodyFraming::Chunked => State::ChunkSize,
            BodyFraming::UntilClose => State::UntilClose,
        };
        Self {
            framing,
            state,
            position: 0,
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Appends the payload found in `input` to `out` and returns the number of
    /// input bytes consumed.
    ///
    /// Decoding stops at the end of the body, so anything after it is left
    /// unconsumed, and so is a chunk-size or trailer line that is not complete
    /// yet. Callers keep those bytes and pass them again with more input.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ParseError> {
        let mut cursor = 0;
        loop {
            let rest = &input[cursor..];
            match self.state {
                State::Done => break,
                State::UntilClose => {
                    out.extend_from_slice(rest);
                    cursor = input.len();
                    break;
                }
                State::Length { remaining } => {
                    if rest.is_empty() {
                        break;
                    }
                    let taken = take_payload(rest, remaining, out);
                    cursor += taken;
                    let remaining = remaining - taken as u64;
                    self.state = if remaining == 0 {
                        State::Done
                    } else {
                        State::Length { remaining }
                    };
                }
                State::ChunkData { remaining } => {
                    if rest.is_empty() {
                        break;
                    }
                    let taken = take_payload(rest, remaining, out);
                    cursor += taken;
                    let remaining = remaining - taken as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                }
                State::ChunkSize => {
                    let offset = self.position + cursor;
                    let Some(line) = find_line(rest, offset)? else {
                        break;
                    };
                    let size = parse_chunk_size(line, offset)?;
                    cursor += line.len() + CRLF.len();
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkDataEnd => {
                    if rest.len() < CRLF.len() {
                        break;
                    }
                    if &rest[..CRLF.len()] != CRLF {
                        return Err(ParseError {
                            kind: ParseErrorKind::InvalidChunkTerminator,
                            offset: self.position + cursor,
                        });
                    }
                    cursor += CRLF.len();
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line) = find_line(rest, self.position + cursor)? else {
                        break;
                    };
                    cursor += line.len() + CRLF.len();
                    if line.is_empty() {
                        self.state = State::Done;
                    }
                }
            }
        }
        self.position += cursor;
        Ok(cursor)
    }

    /// Signals that the peer closed the stream. Only a close-delimited body
    /// may end this way.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        match self.state {
            State::Done => Ok(()),
            State::UntilClose => {
                self.state = State::Done;
                Ok(())
            }
            _ => Err(ParseError {
                kind: ParseErrorKind::UnexpectedEof,
                offset: self.position,
            }),
        }
    }
}

fn take_payload(rest: &[u8], remaining: u64, out: &mut Vec<u8>) -> usize {
    let taken = usize::try_from(remaining).map_or(rest.len(), |remaining| remaining.min(rest.len()));
    out.extend_from_slice(&rest[..taken]);
    taken
}

fn find_line(rest: &[u8], offset: usize) -> Result<Option<&[u8]>, ParseError> {
    let too_long = ParseError {
        kind: ParseErrorKind::InvalidChunkSize,
        offset,
    };
    match twoway::find_bytes(rest, CRLF) {
        Some(end) if end > MAX_CHUNK_LINE => Err(too_long),
        Some(end) => Ok(Some(&rest[..end])),
        None if rest.len() > MAX_CHUNK_LINE => Err(too_long),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8], offset: usize) -> Result<u64, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidChunkSize,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid)
}
