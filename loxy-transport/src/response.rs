use http::HeaderMap;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue, TRANSFER_ENCODING};
use loxy_net::{BodyFraming, ResponseHead};

use crate::body::Body;
use crate::error::TransportError;

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Response {
    /// A response with no body and an explicit zero `Content-Length`.
    pub fn empty(status: u16, reason: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(0u32));
        Self {
            status,
            reason: reason.to_string(),
            headers,
            body: Body::empty(),
        }
    }

    /// Pairs a parsed response head with its body.
    ///
    /// The body is handed on decoded, so any body whose length is not known
    /// up front is labelled `Transfer-Encoding: chunked` for the next hop.
    pub(crate) fn from_head(head: ResponseHead, body: Body) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::with_capacity(head.headers.len());
        for header in &head.headers {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|err| TransportError::Parse(format!("header {:?}: {err}", header.name)))?;
            let value = HeaderValue::from_str(&header.value)
                .map_err(|err| TransportError::Parse(format!("header {:?}: {err}", header.name)))?;
            headers.append(name, value);
        }

        match head.framing {
            BodyFraming::Empty => {}
            BodyFraming::Length(_) => {
                headers.remove(TRANSFER_ENCODING);
            }
            BodyFraming::Chunked | BodyFraming::UntilClose => {
                headers.remove(CONTENT_LENGTH);
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
        }

        Ok(Self {
            status: head.line.status_code,
            reason: head.line.reason,
            headers,
            body,
        })
    }

    /// Whether the body goes out in chunked framing.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Status line and header block; the body is written separately.
    pub fn encode_head(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in self.headers.iter() {
            bytes.extend_from_slice(name.as_str().as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(value.as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"\r\n");
        bytes
    }
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Removes headers that only describe a single hop, including any named in
/// `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
