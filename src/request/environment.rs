//! The CGI/1.1 environment of a single request.
//!
//! Built up from the Params stream one name-value pair at a time.
//! Recognized variables land in typed fields, `QUERY_STRING` and
//! `HTTP_COOKIE` are decoded into their maps, and everything else is kept
//! verbatim in `others`. After the zero-length Params record the
//! environment is never mutated again, except for the post-body decode
//! which fills `posts` and `files`.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use compact_str::CompactString;


/// The HTTP method of a request, as reported by `REQUEST_METHOD`.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    #[default]
    Unknown,
    Head,
    Get,
    Post,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
}

impl RequestMethod {
    fn from_bytes(raw: &[u8]) -> Self {
        match raw {
            b"HEAD" => Self::Head,
            b"GET" => Self::Get,
            b"POST" => Self::Post,
            b"PUT" => Self::Put,
            b"DELETE" => Self::Delete,
            b"TRACE" => Self::Trace,
            b"OPTIONS" => Self::Options,
            b"CONNECT" => Self::Connect,
            _ => Self::Unknown,
        }
    }
}


/// A file uploaded through a `multipart/form-data` post body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// The client-side file name, as sent in the part's disposition.
    pub filename: String,
    /// The content type declared for the part.
    pub content_type: String,
    /// The raw file bytes.
    pub data: Bytes,
}

impl UploadedFile {
    /// The size of the uploaded file in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}


/// All request metadata delivered through the Params stream.
#[derive(Debug, Default)]
pub struct Environment {
    /// The value of the `Host` request header.
    pub host: String,
    /// The client's `User-Agent` header.
    pub user_agent: String,
    /// The raw `Accept` header listing acceptable content types.
    pub accept_content_types: String,
    /// Languages from `Accept-Language`, quality parameters stripped.
    pub accept_languages: Vec<String>,
    /// The raw `Accept-Charset` header.
    pub accept_charsets: String,
    /// The client's `Referer` header.
    pub referer: String,
    /// The declared content type of the request body.
    pub content_type: String,
    /// The declared length of the request body in bytes.
    pub content_length: u64,
    /// Keep-alive duration requested by the client, in seconds.
    pub keep_alive: u32,
    /// The local address the web server received the request on.
    pub server_address: Option<IpAddr>,
    /// The local port the web server received the request on.
    pub server_port: u16,
    /// The peer address of the HTTP client.
    pub remote_address: Option<IpAddr>,
    /// The peer port of the HTTP client.
    pub remote_port: u16,
    /// The script name matched by the web server.
    pub script_name: String,
    /// The full request URI, query string included.
    pub request_uri: String,
    /// The request method.
    pub request_method: RequestMethod,
    /// The document root configured in the web server.
    pub root: String,
    /// The raw `If-None-Match` header.
    pub etag: String,
    /// The raw `If-Modified-Since` header.
    pub if_modified_since: String,
    /// Decoded `PATH_INFO` segments, split on `/`.
    pub path_info: Vec<String>,
    /// Decoded query-string parameters.
    pub gets: HashMap<String, String>,
    /// Decoded post parameters (urlencoded bodies and multipart fields).
    pub posts: HashMap<String, String>,
    /// Cookies from the `Cookie` header.
    pub cookies: HashMap<String, String>,
    /// Files uploaded in a multipart body, keyed by field name.
    pub files: HashMap<String, UploadedFile>,
    /// Any Params variable this library does not recognize.
    pub others: HashMap<CompactString, String>,
}

impl Environment {
    /// Stores one Params name-value pair into the environment.
    pub(crate) fn fill(&mut self, name: &[u8], value: &[u8]) {
        let text = || String::from_utf8_lossy(value).into_owned();
        match name {
            b"HTTP_HOST" => self.host = text(),
            b"HTTP_USER_AGENT" => self.user_agent = text(),
            b"HTTP_ACCEPT" => self.accept_content_types = text(),
            b"HTTP_ACCEPT_LANGUAGE" => {
                self.accept_languages = String::from_utf8_lossy(value)
                    .split(',')
                    .map(|lang| lang.split(';').next().unwrap_or(lang).trim().to_owned())
                    .filter(|lang| !lang.is_empty())
                    .collect();
            },
            b"HTTP_ACCEPT_CHARSET" => self.accept_charsets = text(),
            b"HTTP_REFERER" => self.referer = text(),
            b"CONTENT_TYPE" => self.content_type = text(),
            b"CONTENT_LENGTH" => {
                self.content_length = String::from_utf8_lossy(value).trim().parse().unwrap_or(0);
            },
            b"HTTP_KEEP_ALIVE" => {
                self.keep_alive = String::from_utf8_lossy(value).trim().parse().unwrap_or(0);
            },
            b"SERVER_ADDR" => self.server_address = String::from_utf8_lossy(value).parse().ok(),
            b"REMOTE_ADDR" => self.remote_address = String::from_utf8_lossy(value).parse().ok(),
            b"SERVER_PORT" => {
                self.server_port = String::from_utf8_lossy(value).trim().parse().unwrap_or(0);
            },
            b"REMOTE_PORT" => {
                self.remote_port = String::from_utf8_lossy(value).trim().parse().unwrap_or(0);
            },
            b"SCRIPT_NAME" => self.script_name = text(),
            b"REQUEST_URI" => self.request_uri = text(),
            b"REQUEST_METHOD" => self.request_method = RequestMethod::from_bytes(value),
            b"DOCUMENT_ROOT" => self.root = text(),
            b"HTTP_IF_NONE_MATCH" => self.etag = text(),
            b"HTTP_IF_MODIFIED_SINCE" => self.if_modified_since = text(),
            b"PATH_INFO" => {
                self.path_info = value
                    .split(|&b| b == b'/')
                    .filter(|seg| !seg.is_empty())
                    .map(url_decode)
                    .collect();
            },
            b"QUERY_STRING" => parse_url_encoded(value, &mut self.gets),
            b"HTTP_COOKIE" => self.parse_cookies(value),
            _ => {
                let name = String::from_utf8_lossy(name);
                self.others.insert(CompactString::from(name), text());
            },
        }
    }

    fn parse_cookies(&mut self, raw: &[u8]) {
        for cookie in raw.split(|&b| b == b';') {
            let mut parts = cookie.splitn(2, |&b| b == b'=');
            let name = parts.next().unwrap_or_default();
            let name = url_decode(name.strip_prefix(b" ").unwrap_or(name));
            if name.is_empty() {
                continue;
            }
            let value = url_decode(parts.next().unwrap_or_default());
            self.cookies.insert(name, value);
        }
    }

    /// Decodes an accumulated post body according to `content_type`.
    ///
    /// Returns false if the body is non-empty but the content type is
    /// neither urlencoded nor multipart; the caller answers with a 415.
    pub(crate) fn parse_post(&mut self, body: &Bytes) -> bool {
        if body.is_empty() {
            return true;
        }
        let ctype = self.content_type.clone();
        if ctype.starts_with("application/x-www-form-urlencoded") {
            parse_url_encoded(body, &mut self.posts);
            true
        } else if let Some(boundary) = multipart_boundary(&ctype) {
            self.parse_multipart(boundary.as_bytes(), body);
            true
        } else {
            false
        }
    }

    fn parse_multipart(&mut self, boundary: &[u8], body: &Bytes) {
        let delim = [b"--", boundary].concat();
        let Some(mut pos) = find(body, &delim) else { return };
        pos += delim.len();

        loop {
            let rest = &body[pos..];
            if rest.starts_with(b"--") {
                // Closing delimiter
                return;
            }
            let Some(head_start) = skip_line_break(rest) else { return };
            let part_start = pos + head_start;

            // Part runs until the next delimiter (or input end, for
            // tolerance of a missing close).
            let part_end = match find(&body[part_start..], &delim) {
                Some(off) => part_start + off,
                None => body.len(),
            };
            self.parse_part(body, part_start, part_end);

            if part_end == body.len() {
                return;
            }
            pos = part_end + delim.len();
        }
    }

    fn parse_part(&mut self, body: &Bytes, start: usize, end: usize) {
        let part = &body[start..end];
        let Some(head_len) = find(part, b"\r\n\r\n") else { return };
        let content_start = start + head_len + 4;

        let mut name = None;
        let mut filename = None;
        let mut content_type = String::new();
        for line in part[..head_len].split(|&b| b == b'\n') {
            if let Some(rest) = strip_header(line, b"content-disposition:") {
                name = header_param(rest, b"name");
                filename = header_param(rest, b"filename");
            } else if let Some(rest) = strip_header(line, b"content-type:") {
                content_type = String::from_utf8_lossy(trim_bytes(rest)).into_owned();
            }
        }
        let Some(name) = name else { return };

        // Strip the line break preceding the next delimiter.
        let mut content_end = end.min(body.len());
        if content_end >= content_start + 2 && &body[content_end - 2..content_end] == b"\r\n" {
            content_end -= 2;
        }
        let content = body.slice(content_start..content_end.max(content_start));

        if let Some(filename) = filename {
            self.files.insert(name, UploadedFile { filename, content_type, data: content });
        } else {
            self.posts.insert(name, String::from_utf8_lossy(&content).into_owned());
        }
    }
}


/// Extracts the boundary parameter from a multipart content type.
fn multipart_boundary(ctype: &str) -> Option<&str> {
    let rest = ctype.strip_prefix("multipart/form-data")?;
    let idx = rest.find("boundary=")?;
    let raw = rest[idx + "boundary=".len()..].split(';').next()?.trim();
    Some(raw.trim_matches('"')).filter(|b| !b.is_empty())
}

/// Decodes `name=value&name=value` syntax into the map.
fn parse_url_encoded(raw: &[u8], into: &mut HashMap<String, String>) {
    for pair in raw.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let mut halves = pair.splitn(2, |&b| b == b'=');
        let name = url_decode(halves.next().unwrap_or_default());
        if name.is_empty() {
            continue;
        }
        let value = url_decode(halves.next().unwrap_or_default());
        into.insert(name, value);
    }
}

/// Reverses percent-encoding, mapping `+` to a space.
fn url_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut it = raw.iter();
    while let Some(&b) = it.next() {
        match b {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = it.next().and_then(|&c| (c as char).to_digit(16));
                let lo = it.next().and_then(|&c| (c as char).to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                    _ => out.push(b'%'),
                }
            },
            _ => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Naive substring search; inputs here are tiny.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Consumes one CRLF (or bare LF) at the start of `data`.
fn skip_line_break(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\r\n") {
        Some(2)
    } else if data.starts_with(b"\n") {
        Some(1)
    } else {
        None
    }
}

fn trim_bytes(mut data: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = data {
        data = rest;
    }
    while let [rest @ .., b' ' | b'\t' | b'\r'] = data {
        data = rest;
    }
    data
}

/// Matches a header name case-insensitively, returning the value bytes.
fn strip_header<'a>(line: &'a [u8], header: &[u8]) -> Option<&'a [u8]> {
    let name = line.get(..header.len())?;
    name.eq_ignore_ascii_case(header).then(|| &line[header.len()..])
}

/// Extracts a quoted `key="value"` parameter from a header line.
fn header_param(line: &[u8], key: &[u8]) -> Option<String> {
    let pattern = [key, b"=\""].concat();
    let start = find(line, &pattern)? + pattern.len();
    let len = line[start..].iter().position(|&b| b == b'"')?;
    Some(String::from_utf8_lossy(&line[start..start + len]).into_owned())
}
