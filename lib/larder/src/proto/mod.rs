//! The request layer: a CRLF-delimited text protocol and a framed binary
//! protocol sharing the same item operations. Which one a connection
//! speaks is decided by its first byte.

pub mod binary;
pub mod text;
