//! The framed message codec (C1): HTTP/1.1 and HIVE share one
//! request-line/status-line + headers + body grammar. This module reads and
//! writes that grammar and streams bodies according to their framing
//! (`Content-Length`, `Transfer-Encoding: chunked`, or until-EOF).

mod body;
mod json;
mod message;

pub use body::{stream_chunked_body, stream_fixed_body, stream_until_eof, Framing};
pub use json::extract_json_string_field;
pub use message::{
    hive_line, read_head, read_message, write_head, write_hive, write_message, Head, Message,
    StartLine,
};

/// Header block ceiling (§4.1).
pub const MAX_HEADERS_SIZE: usize = 64 * 1024;
/// Single line ceiling (§4.1), applies to the start-line and each header line.
pub const MAX_LINE_SIZE: usize = 8 * 1024;
/// Default chunk-copy buffer size (§4.1), overridable via config.
pub const DEFAULT_CHUNK_BUFFER_SIZE: usize = 16 * 1024;
/// The HIVE dialect's protocol tag, as it appears in the third field of its
/// request-line.
pub const HIVE_TAG: &str = "HIVE";
