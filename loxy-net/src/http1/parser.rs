use super::body::{BodyDecoder, BodyFraming};
use super::types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    Request, RequestLine, Response, ResponseHead, StatusLine,
};

const CRLF: &[u8] = b"\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore {
        warnings: Vec<ParseWarning>,
    },
    Complete {
        message: T,
        warnings: Vec<ParseWarning>,
    },
    Error {
        error: ParseError,
        warnings: Vec<ParseWarning>,
    },
}

/// A message whose head has been parsed and whose body is still arriving.
#[derive(Debug)]
struct PendingBody<L> {
    line: L,
    headers: Vec<Header>,
    decoder: BodyDecoder,
    body: Vec<u8>,
    body_offset: usize,
}

impl<L> PendingBody<L> {
    fn new(line: L, headers: Vec<Header>, framing: BodyFraming, body_offset: usize) -> Self {
        Self {
            line,
            headers,
            decoder: BodyDecoder::new(framing),
            body: Vec::new(),
            body_offset,
        }
    }

    /// Decodes whatever `buffer` holds and drops the consumed bytes from it.
    fn decode(&mut self, buffer: &mut Vec<u8>, limits: Limits) -> Result<(), ParseError> {
        let body_offset = self.body_offset;
        let consumed = self
            .decoder
            .decode(buffer, &mut self.body)
            .map_err(|error| shift(error, body_offset))?;
        buffer.drain(..consumed);
        if self.body.len() > limits.max_body_bytes {
            return Err(ParseError {
                kind: ParseErrorKind::BodyTooLarge,
                offset: body_offset,
            });
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ParseError> {
        let body_offset = self.body_offset;
        self.decoder.finish().map_err(|error| shift(error, body_offset))
    }
}

fn shift(error: ParseError, body_offset: usize) -> ParseError {
    ParseError {
        offset: body_offset + error.offset,
        ..error
    }
}

/// Incremental HTTP/1.x request parser.
///
/// Bytes past the end of a complete message stay buffered, so pipelined
/// requests are returned one per `push` call (push an empty slice to drain).
#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
    pending: Option<PendingBody<RequestLine>>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
            pending: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Request> {
        self.buffer.extend_from_slice(bytes);
        let result = self.advance();
        report(result, &mut self.warnings, &mut self.pending)
    }

    /// True when no part of a request has been received yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_none()
    }

    /// Hands over bytes received after the last complete request.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn advance(&mut self) -> Result<Option<Request>, ParseError> {
        if self.pending.is_none() {
            self.warnings.clear();
            let Some((line, headers, consumed)) =
                split_head(&self.buffer, self.limits, &mut self.warnings, parse_request_line)?
            else {
                return Ok(None);
            };
            let framing = request_framing(&headers, consumed)?;
            check_declared_length(framing, self.limits, consumed)?;
            self.buffer.drain(..consumed);
            self.pending = Some(PendingBody::new(line, headers, framing, consumed));
        }

        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        pending.decode(&mut self.buffer, self.limits)?;
        if !pending.decoder.is_done() {
            return Ok(None);
        }
        Ok(self.pending.take().map(|pending| Request {
            line: pending.line,
            headers: pending.headers,
            body: pending.body,
        }))
    }
}

/// Incremental HTTP/1.x response parser.
///
/// [`ResponseParser::push`] buffers whole responses. Responses without
/// `Content-Length` or chunked framing are delimited by the connection
/// closing; call [`ResponseParser::finish`] once the peer hits EOF.
///
/// [`ResponseParser::push_head`] stops after the header block instead and
/// leaves the body to the caller, see [`BodyDecoder`].
#[derive(Debug, Default)]
pub struct ResponseParser {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
    head_request: bool,
    pending: Option<PendingBody<StatusLine>>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
            head_request: false,
            pending: None,
        }
    }

    /// Responses to `HEAD` never carry a body, whatever their headers say.
    pub fn for_method(mut self, method: &str) -> Self {
        self.head_request = method.eq_ignore_ascii_case("HEAD");
        self
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Response> {
        self.buffer.extend_from_slice(bytes);
        let result = self.advance(false);
        report(result, &mut self.warnings, &mut self.pending)
    }

    /// Completes a close-delimited response after the peer closed the stream.
    pub fn finish(&mut self) -> ParseStatus<Response> {
        let result = self.advance(true);
        report(result, &mut self.warnings, &mut self.pending)
    }

    /// Parses only the status line and headers. Body bytes that arrived with
    /// the head stay buffered; take them with [`ResponseParser::take_buffered`].
    pub fn push_head(&mut self, bytes: &[u8]) -> ParseStatus<ResponseHead> {
        self.buffer.extend_from_slice(bytes);
        self.warnings.clear();
        match self.parse_head() {
            Ok(Some((head, consumed))) => {
                self.buffer.drain(..consumed);
                let warnings = std::mem::take(&mut self.warnings);
                ParseStatus::Complete {
                    message: head,
                    warnings,
                }
            }
            Ok(None) => ParseStatus::NeedMore {
                warnings: self.warnings.clone(),
            },
            Err(error) => {
                let warnings = std::mem::take(&mut self.warnings);
                ParseStatus::Error { error, warnings }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_none()
    }

    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn parse_head(&mut self) -> Result<Option<(ResponseHead, usize)>, ParseError> {
        let Some((line, headers, consumed)) =
            split_head(&self.buffer, self.limits, &mut self.warnings, parse_status_line)?
        else {
            return Ok(None);
        };
        let framing = response_framing(line.status_code, &headers, self.head_request, consumed)?;
        Ok(Some((
            ResponseHead {
                line,
                headers,
                framing,
            },
            consumed,
        )))
    }

    fn advance(&mut self, eof: bool) -> Result<Option<Response>, ParseError> {
        if self.pending.is_none() {
            self.warnings.clear();
            let Some((head, consumed)) = self.parse_head()? else {
                if eof {
                    return Err(ParseError {
                        kind: ParseErrorKind::UnexpectedEof,
                        offset: self.buffer.len(),
                    });
                }
                return Ok(None);
            };
            check_declared_length(head.framing, self.limits, consumed)?;
            self.buffer.drain(..consumed);
            self.pending = Some(PendingBody::new(head.line, head.headers, head.framing, consumed));
        }

        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        pending.decode(&mut self.buffer, self.limits)?;
        if eof {
            pending.finish()?;
        }
        if !pending.decoder.is_done() {
            return Ok(None);
        }
        Ok(self.pending.take().map(|pending| Response {
            line: pending.line,
            headers: pending.headers,
            body: pending.body,
        }))
    }
}

fn report<T, L>(
    result: Result<Option<T>, ParseError>,
    warnings: &mut Vec<ParseWarning>,
    pending: &mut Option<PendingBody<L>>,
) -> ParseStatus<T> {
    match result {
        Ok(Some(message)) => ParseStatus::Complete {
            message,
            warnings: std::mem::take(warnings),
        },
        Ok(None) => ParseStatus::NeedMore {
            warnings: warnings.clone(),
        },
        Err(error) => {
            *pending = None;
            ParseStatus::Error {
                error,
                warnings: std::mem::take(warnings),
            }
        }
    }
}

/// Parses the start line and header block. Returns `None` until the blank
/// line ending the head has arrived; the count is the head's size on the wire.
fn split_head<L>(
    buffer: &[u8],
    limits: Limits,
    warnings: &mut Vec<ParseWarning>,
    parse_line: fn(&[u8], usize, &mut Vec<ParseWarning>) -> Result<L, ParseError>,
) -> Result<Option<(L, Vec<Header>, usize)>, ParseError> {
    let Some(headers_end) = find_headers_end(buffer, limits)? else {
        return Ok(None);
    };

    let line_end = find_line_end(buffer, 0).ok_or(ParseError {
        kind: ParseErrorKind::UnexpectedEof,
        offset: buffer.len(),
    })?;
    let line = parse_line(&buffer[..line_end], 0, warnings)?;
    let cursor = line_end + CRLF.len();

    let headers = match buffer.get(cursor..headers_end) {
        Some(bytes) => parse_headers(bytes, cursor, warnings)?,
        None => Vec::new(),
    };
    Ok(Some((line, headers, headers_end + HEADER_TERMINATOR.len())))
}

fn check_declared_length(
    framing: BodyFraming,
    limits: Limits,
    offset: usize,
) -> Result<(), ParseError> {
    match framing {
        BodyFraming::Length(length) if length > limits.max_body_bytes as u64 => Err(ParseError {
            kind: ParseErrorKind::BodyTooLarge,
            offset,
        }),
        _ => Ok(()),
    }
}

fn find_headers_end(buffer: &[u8], limits: Limits) -> Result<Option<usize>, ParseError> {
    match twoway::find_bytes(buffer, HEADER_TERMINATOR) {
        Some(index) if index > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        Some(index) => Ok(Some(index)),
        None if buffer.len() > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        None => Ok(None),
    }
}

fn find_line_end(buffer: &[u8], start: usize) -> Option<usize> {
    twoway::find_bytes(&buffer[start..], CRLF).map(|offset| start + offset)
}

fn parse_request_line(
    line: &[u8],
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<RequestLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.split_whitespace();
    let method = parts.next().ok_or(invalid.clone())?;
    let target = parts.next().ok_or(invalid.clone())?;
    let version_raw = parts.next().unwrap_or("HTTP/1.1");

    if parts.next().is_some() || !method.bytes().all(|byte| byte.is_ascii_alphabetic()) {
        return Err(invalid);
    }

    let version = parse_http_version(version_raw, offset, warnings);

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version,
    })
}

fn parse_status_line(
    line: &[u8],
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<StatusLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.splitn(3, ' ');
    let version_raw = parts.next().unwrap_or("HTTP/1.1");
    let status_raw = parts.next().ok_or(invalid.clone())?;
    let reason = parts.next().unwrap_or("");

    let status_code = status_raw.parse::<u16>().map_err(|_| invalid)?;

    let version = parse_http_version(version_raw, offset, warnings);

    Ok(StatusLine {
        version,
        status_code,
        reason: reason.to_string(),
    })
}

fn parse_http_version(
    version_raw: &str,
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> HttpVersion {
    match version_raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::UnknownVersion(other.to_string()),
                offset,
            });
            HttpVersion::Other(other.to_string())
        }
    }
}

fn parse_headers(
    bytes: &[u8],
    base_offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<Vec<Header>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidHeader,
        offset: base_offset,
    })?;

    let mut headers: Vec<Header> = Vec::new();
    let mut offset = base_offset;

    for line in text.split("\r\n") {
        let line_offset = offset;
        offset += line.len() + CRLF.len();
        if line.is_empty() {
            continue;
        }

        if line.starts_with(|c| c == ' ' || c == '\t') {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::ObsFoldDetected,
                offset: line_offset,
            });
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
        }

        let Some((raw_name, value)) = line.split_once(':') else {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidHeader,
                offset: line_offset,
            });
        };

        let name = raw_name.trim();
        if name.is_empty() || name.len() != raw_name.len() {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidHeaderName,
                offset: line_offset,
            });
        }

        headers.push(Header {
            name: name.to_string(),
            raw_name: raw_name.to_string(),
            value: value.trim().to_string(),
        });
    }

    Ok(headers)
}

fn request_framing(headers: &[Header], offset: usize) -> Result<BodyFraming, ParseError> {
    if has_chunked_transfer_encoding(headers) {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match content_length(headers, offset)? {
        Some(0) | None => BodyFraming::Empty,
        Some(length) => BodyFraming::Length(length),
    })
}

fn response_framing(
    status_code: u16,
    headers: &[Header],
    head_request: bool,
    offset: usize,
) -> Result<BodyFraming, ParseError> {
    if head_request || (100..200).contains(&status_code) || status_code == 204 || status_code == 304
    {
        return Ok(BodyFraming::Empty);
    }
    if has_chunked_transfer_encoding(headers) {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match content_length(headers, offset)? {
        Some(0) => BodyFraming::Empty,
        Some(length) => BodyFraming::Length(length),
        None => BodyFraming::UntilClose,
    })
}

fn content_length(headers: &[Header], offset: usize) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for header in headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("content-length"))
    {
        let value = header.value.parse::<u64>().map_err(|_| ParseError {
            kind: ParseErrorKind::InvalidContentLength,
            offset,
        })?;
        if length.is_some_and(|existing| existing != value) {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidContentLength,
                offset,
            });
        }
        length = Some(value);
    }
    Ok(length)
}

fn has_chunked_transfer_encoding(headers: &[Header]) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("transfer-encoding"))
        .flat_map(|header| header.value.split(','))
        .any(|encoding| encoding.trim().eq_ignore_ascii_case("chunked"))
}
