use crate::{query, Version};
use std::{error, fmt, io};

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,

    InvalidUrl,
    #[allow(dead_code)]
    Query(query::Error),

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    InvalidConnection,

    BodyTooLarge,
    #[allow(dead_code)]
    BodyMismatch {
        expected: usize,
        available: usize,
    },
    #[allow(dead_code)]
    UnexpectedBody(usize),

    /// No route matched the request's (method, path) pair and no fallback was registered.
    NotFound,
    /// A connection filter, IP policy, or WebSocket auth policy rejected the request.
    Forbidden,
    /// A WebSocket upgrade's token auth was missing, empty, or rejected by the validator.
    Unauthorized,
    /// The client exceeded its configured request rate.
    RateLimited,

    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $code:literal, $reason:literal, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $code, " ", $reason, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $code, " ", $reason, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $code, " ", $reason, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $code, " ", $reason, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (_, Self::$name { .. }, Version::Http09) => concat!(
                    "ERROR: ", $code
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    // Body shape is `{"error":{"code":N,"message":"...","details":"..."}}`; `code` mirrors
    // the HTTP status so a caller parsing only the JSON body still sees the right number.
    http_errors! {
        InvalidMethod: "400", "Bad Request", "115"
            => r#"{"error":{"code":400,"message":"Invalid HTTP method","details":"The request method is not a recognized HTTP verb"}}"#;

        InvalidUrl: "400", "Bad Request", "101"
            => r#"{"error":{"code":400,"message":"Invalid URL format","details":"The request URL could not be parsed"}}"#;
        Query: "400", "Bad Request", "104"
            => r#"{"error":{"code":400,"message":"Invalid query string","details":"The query string could not be parsed"}}"#;

        InvalidVersion: "400", "Bad Request", "103"
            => r#"{"error":{"code":400,"message":"Invalid HTTP version","details":"The HTTP version token is malformed"}}"#;
        UnsupportedVersion: "505", "HTTP Version Not Supported", "125"
            => r#"{"error":{"code":505,"message":"HTTP version not supported","details":"Only HTTP/1.1, HTTP/1.0 and HTTP/0.9+ are supported"}}"#;

        InvalidHeader: "400", "Bad Request", "103"
            => r#"{"error":{"code":400,"message":"Invalid header format","details":"A request header line is malformed"}}"#;
        TooManyHeaders: "431", "Request Header Fields Too Large", "117"
            => r#"{"error":{"code":431,"message":"Too many headers","details":"The request exceeds the configured header count limit"}}"#;
        InvalidContentLength: "400", "Bad Request", "131"
            => r#"{"error":{"code":400,"message":"Invalid Content-Length","details":"The Content-Length header is not a valid non-negative integer"}}"#;
        InvalidConnection: "400", "Bad Request", "114"
            => r#"{"error":{"code":400,"message":"Invalid Connection header","details":"The Connection header could not be parsed"}}"#;

        BodyTooLarge: "413", "Payload Too Large", "120"
            => r#"{"error":{"code":413,"message":"Request body too large","details":"The request body exceeds the configured size limit"}}"#;
        BodyMismatch: "400", "Bad Request", "122"
            => r#"{"error":{"code":400,"message":"Body length mismatch","details":"The received body length does not match Content-Length"}}"#;
        UnexpectedBody: "400", "Bad Request", "110"
            => r#"{"error":{"code":400,"message":"Unexpected request body","details":"A body was sent where none was expected"}}"#;

        NotFound: "404", "Not Found", "112"
            => r#"{"error":{"code":404,"message":"Resource not found","details":"No route matches the requested path and method"}}"#;
        Forbidden: "403", "Forbidden", "108"
            => r#"{"error":{"code":403,"message":"Forbidden","details":"The request was rejected by an authorization policy"}}"#;
        Unauthorized: "401", "Unauthorized", "108"
            => r#"{"error":{"code":401,"message":"Unauthorized","details":"A valid authentication token is required"}}"#;
        RateLimited: "429", "Too Many Requests", "110"
            => r#"{"error":{"code":429,"message":"Too many requests","details":"The client exceeded the configured rate limit"}}"#;

        ServiceUnavailable: "503", "Service Unavailable", "141"
            => r#"{"error":{"code":503,"message":"Service temporarily unavailable","details":"The server is at capacity and could not accept this connection"}}"#;
        Io: "503", "Service Unavailable", "104"
            => r#"{"error":{"code":503,"message":"I/O error occurred","details":"A transport-level read or write failed"}}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_body_length_matches_header() {
        for (kind, json) in [
            (ErrorKind::InvalidMethod, true),
            (ErrorKind::NotFound, true),
            (ErrorKind::Forbidden, true),
            (ErrorKind::Unauthorized, true),
            (ErrorKind::RateLimited, true),
        ] {
            let bytes = kind.as_http(Version::Http11, json);
            let text = std::str::from_utf8(bytes).unwrap();
            let header_len: usize = text
                .lines()
                .find_map(|l| l.strip_prefix("content-length: "))
                .unwrap()
                .parse()
                .unwrap();
            let body = text.split("\r\n\r\n").nth(1).unwrap();
            assert_eq!(body.len(), header_len);
        }
    }
}
