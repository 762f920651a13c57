mod http1;
mod tls;

pub use http1::{
    BodyDecoder, BodyFraming, Header, HttpVersion, Limits, ParseError, ParseErrorKind,
    ParseStatus, ParseWarning, ParseWarningKind, Request, RequestLine, RequestParser, Response,
    ResponseHead, ResponseParser, StatusLine,
};

pub use tls::{
    CaKeyKind, CaMaterial, CaMaterialPaths, CaRoot, ForgedLeaf, KeyAlgorithm, LEAF_ORGANIZATION,
    TlsError, TlsErrorKind, bare_host, build_acceptor, forge_leaf, generate_ca, serial_for_host,
    write_ca_to_dir,
};
