use std::cmp::max;
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

use crate::SERVER_SOFTWARE;

/// Largest request head we are willing to read.
pub const MAX_REQUEST_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    MovedPermanently,
    BadRequest,
    Forbidden,
    NotFound,
    RequestHeaderFieldsTooLarge,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::MovedPermanently => 301,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::RequestHeaderFieldsTooLarge => 431,
            Self::InternalServerError => 500,
        }
    }
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::MovedPermanently => "Moved Permanently",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// The parts of a request line we act on.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// The raw request target, as sent by the client.
    pub url: String,
    /// Decoded and normalized path, without the leading slash. Empty for the root.
    pub path: Vec<u8>,
    pub query: String,
}

/// Parse a request line like "GET /cgi/hello?name=x HTTP/1.1".
///
/// Returns None for anything other than a well-formed GET or POST for HTTP/1.1 whose path stays
/// inside the served root.
pub fn parse_request_line(line: &str) -> Option<Request> {
    let parts: Vec<&str> = line.split_ascii_whitespace().collect();
    if parts.len() != 3 {
        return None;
    }
    let method = match parts[0] {
        "GET" => Method::Get,
        "POST" => Method::Post,
        _ => return None,
    };
    if parts[2] != "HTTP/1.1" {
        return None;
    }
    let url = parts[1];
    let mut target = url.splitn(2, '?');
    let raw_path = target.next()?;
    let query = target.next().unwrap_or("").to_string();
    let mut path = make_safe_url(&url_decode(raw_path))?;
    path.remove(0);
    Some(Request {
        method,
        url: url.to_string(),
        path,
        query,
    })
}

/// Return the request line (without line terminator) of a request head.
pub fn request_line(head: &[u8]) -> Option<&str> {
    let end = head
        .iter()
        .position(|&b| matches!(b, b'\r' | b'\n'))
        .unwrap_or_else(|| head.len());
    std::str::from_utf8(&head[..end]).ok()
}

/// Length of the request head in `buf`, including its terminating blank line, once a blank line
/// has arrived. Anything after it is request body.
pub fn head_length(buf: &[u8]) -> Option<usize> {
    let crlf = find(b"\r\n\r\n", buf).map(|end| end + 4);
    let lf = find(b"\n\n", buf).map(|end| end + 2);
    match (crlf, lf) {
        (Some(crlf), Some(lf)) => Some(crlf.min(lf)),
        (crlf, lf) => crlf.or(lf),
    }
}

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Resolve //, /./, and /../ in a URL path.
///
/// Returns None if the path is invalid or would escape the root.
pub fn make_safe_url(url: &[u8]) -> Option<Vec<u8>> {
    let mut url = url.to_vec();

    // URLs not starting with a slash are illegal.
    if !url.starts_with(b"/") || url.contains(&0) {
        return None;
    }

    let mut src_index = 0;
    let mut dst_index = 0;
    while src_index < url.len() {
        if url[src_index] == b'/' && url.get(src_index + 1) == Some(&b'/') {
            // skip slash
            src_index += 1;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && matches!(url.get(src_index + 2), Some(&b'/') | None)
        {
            // skip slash dot slash
            src_index += 2;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && url.get(src_index + 2) == Some(&b'.')
            && matches!(url.get(src_index + 3), Some(&b'/') | None)
        {
            // skip slash dot dot slash
            src_index += 3;
            // overwrite previous component
            loop {
                if dst_index == 0 {
                    return None;
                }
                dst_index -= 1;
                if url[dst_index] == b'/' {
                    break;
                }
            }
        } else {
            url[dst_index] = url[src_index];
            src_index += 1;
            dst_index += 1;
        }
    }

    // Always preserve leading slash
    dst_index = max(dst_index, 1);
    url.truncate(dst_index);
    Some(url)
}

/// Decode URL by converting %XX (where XX are hexadecimal digits) to the byte it represents.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            }
        }
        Ok(())
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// A complete response, ready to be written to the client.
#[derive(Debug)]
pub struct Response {
    pub status: Status,
    /// Extra header lines, each terminated by CRLF.
    pub extra_headers: String,
    pub content_type: String,
    pub body: Body,
}

#[derive(Debug)]
pub enum Body {
    Bytes(Vec<u8>),
    File(std::fs::File, u64),
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::File(_, len) => *len,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Response {
    pub fn new(status: Status, content_type: &str, body: Body) -> Self {
        Self {
            status,
            extra_headers: String::new(),
            content_type: content_type.to_string(),
            body,
        }
    }

    /// A default reply for any (erroneous) occasion.
    pub fn error(status: Status, now: SystemTime) -> Self {
        let page = format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            <h3>Error code: {}</h3>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status.code(),
            status.reason(),
            status.reason(),
            status.code(),
            GeneratedOn(now),
        );
        Self::new(
            status,
            "text/html; charset=UTF-8",
            Body::Bytes(page.into_bytes()),
        )
    }

    /// A redirect reply.
    pub fn redirect(location: &str, now: SystemTime) -> Self {
        let page = format!(
            "<html><head><title>301 Moved Permanently</title></head><body>\n\
            <h1>Moved Permanently</h1>\n\
            Moved to: <a href=\"{}\">{}</a>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            HtmlEscaped(location),
            HtmlEscaped(location),
            GeneratedOn(now),
        );
        let mut response = Self::new(
            Status::MovedPermanently,
            "text/html; charset=UTF-8",
            Body::Bytes(page.into_bytes()),
        );
        response.extra_headers = format!("Location: {}\r\n", location);
        response
    }

    /// The status line and header block, including the terminating blank line.
    pub fn head(&self, now: SystemTime) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n\
            Date: {}\r\n\
            Server: {}\r\n\
            Content-Type: {}\r\n\
            Content-Length: {}\r\n\
            {}\
            Connection: close\r\n\
            \r\n",
            self.status.code(),
            self.status.reason(),
            HttpDate(now),
            SERVER_SOFTWARE,
            self.content_type,
            self.body.len(),
            self.extra_headers,
        )
    }
}

/// "Generated by" string.
pub struct GeneratedOn(pub SystemTime);

impl std::fmt::Display for GeneratedOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Generated by {} on {}", SERVER_SOFTWARE, HttpDate(self.0))
    }
}
