mod body;
mod parser;
mod types;

pub use body::{BodyDecoder, BodyFraming};
pub use parser::{ParseStatus, RequestParser, ResponseParser};
pub use types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    Request, RequestLine, Response, ResponseHead, StatusLine,
};
