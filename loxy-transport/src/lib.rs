mod body;
mod client;
#[cfg(test)]
mod client_test;
mod error;
mod pool;
mod request;
mod response;
mod stream;

pub use body::Body;
pub use client::{Client, ClientConfig, RoundTrip};
pub use error::TransportError;
pub use request::{Request, RequestBuilder};
pub use response::{Response, strip_hop_by_hop};
