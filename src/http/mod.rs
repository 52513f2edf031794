//! HTTP/1.x header codec (section 4.2). Grounded on `conn.go`'s header
//! reader and `proxy.go`'s request-line rewriting; kept at the raw-bytes
//! level rather than routed through `hyper::service::Service` so that
//! MITM passthrough stays bit-exact, including header casing and chunk
//! framing the client or upstream actually sent.

pub mod chunked;
pub mod codec;

pub use codec::{HeaderBlock, ReadError, RequestLine, StatusLine};
