//! The HTTP/1.x head codec used by the dispatcher.
//!
//! Serialization writes request heads the way they go on the wire;
//! parsing leans on `httparse` and copies the head out into the
//! message's typed header map.

use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, EXPECT, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tracing::trace;

use crate::error::{Error, Parse};
use crate::message::Message;
use crate::status::Status;

pub(crate) const MAX_HEADERS: usize = 100;
const AVERAGE_HEADER_SIZE: usize = 30;

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// No body at all.
    None,
    /// A body of exactly this many bytes.
    ContentLength(u64),
    /// A chunked body.
    Chunked,
    /// A body terminated by connection close.
    Eof,
    /// Framing headers this implementation cannot honor.
    Unrecognized,
}

impl Encoding {
    pub fn is_chunked(&self) -> bool {
        *self == Encoding::Chunked
    }
}

/// Serializes the request head for `msg` into `dst` and returns the
/// encoding its body will use.
///
/// A proxy sees the absolute request target, everything else the
/// origin-form; CONNECT carries the bare `host:port` tunnel destination.
/// The `Host` header is synthesized for HTTP/1.1 requests that don't
/// carry one, and a missing `Content-Length` is filled in from the
/// request body when the encoding calls for it.
pub(crate) fn write_request_head(msg: &mut Message, via_proxy: bool, dst: &mut Vec<u8>) -> Encoding {
    dst.reserve(msg.request_headers.len() * AVERAGE_HEADER_SIZE + 64);

    let host = wire_host(msg.uri.host().unwrap_or(""));
    let default_port = scheme_default_port(&msg.uri);
    let explicit_port = msg.uri.port_u16();

    dst.extend_from_slice(msg.method.as_str().as_bytes());
    dst.push(b' ');
    if msg.method == Method::CONNECT {
        dst.extend_from_slice(host.as_bytes());
        dst.push(b':');
        let _ = itoa::write(&mut *dst, explicit_port.unwrap_or(default_port));
    } else if via_proxy {
        if let Some(scheme) = msg.uri.scheme_str() {
            dst.extend_from_slice(scheme.as_bytes());
            dst.extend_from_slice(b"://");
        }
        dst.extend_from_slice(host.as_bytes());
        if let Some(port) = explicit_port {
            if port != default_port {
                dst.push(b':');
                let _ = itoa::write(&mut *dst, port);
            }
        }
        dst.extend_from_slice(path_and_query(msg).as_bytes());
    } else {
        dst.extend_from_slice(path_and_query(msg).as_bytes());
    }
    match msg.http_version {
        Version::HTTP_10 => dst.extend_from_slice(b" HTTP/1.0\r\n"),
        _ => dst.extend_from_slice(b" HTTP/1.1\r\n"),
    }

    if msg.http_version != Version::HTTP_10 && !msg.request_headers.contains_key(HOST) {
        dst.extend_from_slice(b"Host: ");
        dst.extend_from_slice(host.as_bytes());
        if let Some(port) = explicit_port {
            if port != default_port {
                dst.push(b':');
                let _ = itoa::write(&mut *dst, port);
            }
        }
        dst.extend_from_slice(b"\r\n");
    }

    let mut encoding = request_encoding(&msg.request_headers);
    let wants_length = match encoding {
        Encoding::ContentLength(_) | Encoding::None => true,
        _ => false,
    };
    if wants_length
        && (!msg.request_body.is_empty() || msg.request_headers.contains_key(CONTENT_TYPE))
        && !msg.request_headers.contains_key(CONTENT_LENGTH)
    {
        let len = msg.request_body.len();
        msg.request_headers
            .insert(CONTENT_LENGTH, http::HeaderValue::from(len));
        encoding = Encoding::ContentLength(len);
    }

    for (name, value) in msg.request_headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");

    trace!(
        "serialized request head, {} bytes, encoding {:?}",
        dst.len(),
        encoding
    );
    encoding
}

/// Parses a response head out of `buf` into `msg`: status, reason
/// phrase, version, and response headers.
pub(crate) fn parse_response_head(buf: &[u8], msg: &mut Message) -> Result<(), Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    trace!("Response.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());
    match res.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::new_parse(Parse::Status)),
        Err(e) => return Err(Error::new_parse(e.into())),
    }

    let version = match res.version {
        Some(1) => Version::HTTP_11,
        Some(0) => Version::HTTP_10,
        _ => return Err(Error::new_parse(Parse::Version)),
    };
    let code = res
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| Error::new_parse(Parse::Status))?;

    msg.response_headers.clear();
    for header in res.headers.iter() {
        let name = http::header::HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::new_parse(Parse::Header))?;
        let value = http::HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::new_parse(Parse::Header))?;
        msg.response_headers.append(name, value);
    }

    msg.status = Status::Http(code);
    msg.reason_phrase = res.reason.map(|r| r.to_string());
    if version < msg.http_version {
        msg.http_version = version;
    }
    Ok(())
}

/// The body framing a response announces, after the rules that override
/// any framing headers: HEAD, 204, 304, 1xx, and a successful CONNECT
/// never carry a body.
pub(crate) fn response_encoding(msg: &Message) -> Encoding {
    let code = match msg.status.code() {
        Some(code) => code,
        None => return Encoding::None,
    };
    if msg.method == Method::HEAD
        || code == StatusCode::NO_CONTENT
        || code == StatusCode::NOT_MODIFIED
        || code.is_informational()
        || (msg.method == Method::CONNECT && code.is_success())
    {
        return Encoding::None;
    }
    headers_encoding(&msg.response_headers, true)
}

pub(crate) fn request_encoding(headers: &HeaderMap) -> Encoding {
    headers_encoding(headers, false)
}

fn headers_encoding(headers: &HeaderMap, is_response: bool) -> Encoding {
    if headers.contains_key(TRANSFER_ENCODING) {
        // The final transfer coding must be chunked; anything else is
        // unparseable for us.
        let last = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .flat_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .last();
        return match last {
            Some(token) if token.eq_ignore_ascii_case("chunked") => Encoding::Chunked,
            _ => Encoding::Unrecognized,
        };
    }

    if let Some(value) = headers.get(CONTENT_LENGTH) {
        return match value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Some(len) => Encoding::ContentLength(len),
            None => Encoding::Unrecognized,
        };
    }

    if is_response {
        Encoding::Eof
    } else {
        Encoding::None
    }
}

/// Whether the request asks for an `Expect: 100-continue` handshake.
pub(crate) fn expects_continue(headers: &HeaderMap) -> bool {
    header_contains(headers.get_all(EXPECT).iter(), "100-continue")
}

pub(crate) fn connection_contains(headers: &HeaderMap, token: &str) -> bool {
    header_contains(headers.get_all(CONNECTION).iter(), token)
}

fn header_contains<'a, I>(values: I, token: &str) -> bool
where
    I: Iterator<Item = &'a http::HeaderValue>,
{
    values
        .flat_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Whether the connection may be reused after this exchange.
pub(crate) fn is_keepalive(msg: &Message) -> bool {
    if msg.status == Status::OK && msg.method == Method::CONNECT {
        return true;
    }
    // A terminate-by-EOF response uses up the connection by definition.
    if response_encoding(msg) == Encoding::Eof {
        return false;
    }
    if msg.http_version == Version::HTTP_10 {
        connection_contains(&msg.response_headers, "keep-alive")
    } else {
        !connection_contains(&msg.request_headers, "close")
            && !connection_contains(&msg.response_headers, "close")
    }
}

fn path_and_query(msg: &Message) -> &str {
    msg.uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
}

/// The host as it should appear in a request target or Host header:
/// IPv6 literals bracketed, IDN hosts in their ASCII form.
fn wire_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else if !host.is_ascii() {
        idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_string())
    } else {
        host.to_string()
    }
}

pub(crate) fn scheme_default_port(uri: &http::Uri) -> u16 {
    match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    fn get(uri: &str) -> Message {
        Message::new(Method::GET, uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn request_head_origin_form() {
        let mut msg = get("http://example.com/index.html?q=1");
        let mut buf = Vec::new();
        let encoding = write_request_head(&mut msg, false, &mut buf);
        assert_eq!(encoding, Encoding::None);
        assert_eq!(
            buf,
            &b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"[..]
        );
    }

    #[test]
    fn request_head_absolute_form_via_proxy() {
        let mut msg = get("http://example.com/a");
        let mut buf = Vec::new();
        write_request_head(&mut msg, true, &mut buf);
        assert!(buf.starts_with(b"GET http://example.com/a HTTP/1.1\r\n"));
    }

    #[test]
    fn request_head_nondefault_port() {
        let mut msg = get("http://example.com:8080/");
        let mut buf = Vec::new();
        write_request_head(&mut msg, false, &mut buf);
        assert!(buf.starts_with(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n"));
    }

    #[test]
    fn request_head_non_ascii_host() {
        // `http::Uri` rejects raw non-ASCII authorities, so hosts reach
        // the wire helper already split out; IDN conversion happens
        // there, next to the IPv6 bracketing.
        assert_eq!(wire_host("müller.example"), "xn--mller-kva.example");
        assert_eq!(wire_host("::1"), "[::1]");
        assert_eq!(wire_host("[::1]"), "[::1]");
        assert_eq!(wire_host("example.com"), "example.com");
    }

    #[test]
    fn request_head_connect_target() {
        let mut msg = Message::new(
            Method::CONNECT,
            "https://example.com/".parse::<Uri>().unwrap(),
        );
        let mut buf = Vec::new();
        write_request_head(&mut msg, true, &mut buf);
        assert!(buf.starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n"));
    }

    #[test]
    fn content_length_synthesized_from_body() {
        let mut msg = Message::new(Method::POST, "http://example.com/".parse().unwrap());
        msg.request_body.append(&b"hello"[..]);
        let mut buf = Vec::new();
        let encoding = write_request_head(&mut msg, false, &mut buf);
        assert_eq!(encoding, Encoding::ContentLength(5));
        let head = std::str::from_utf8(&buf).unwrap();
        assert!(head.contains("content-length: 5\r\n"), "head: {:?}", head);
    }

    #[test]
    fn serialized_head_reparses_identically() {
        let mut msg = get("http://example.com/x");
        msg.request_headers
            .insert("accept", "text/plain".parse().unwrap());
        msg.request_headers
            .append("cookie", "a=1".parse().unwrap());
        msg.request_headers
            .append("cookie", "b=2".parse().unwrap());
        let mut buf = Vec::new();
        write_request_head(&mut msg, false, &mut buf);
        assert!(buf.ends_with(b"\r\n\r\n"));

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf).unwrap() {
            httparse::Status::Complete(len) => assert_eq!(len, buf.len()),
            partial => panic!("unexpected {:?}", partial),
        }
        let reparsed = req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect::<Vec<_>>();
        let original = msg
            .request_headers
            .iter()
            .map(|(n, v)| (n.as_str().to_string(), v.as_bytes().to_vec()))
            .collect::<Vec<_>>();
        // Host was synthesized in front of the user headers.
        assert_eq!(reparsed[0].0, "Host");
        assert_eq!(&reparsed[1..], &original[..]);
    }

    #[test]
    fn response_parse_fills_message() {
        let mut msg = get("http://example.com/");
        parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n",
            &mut msg,
        )
        .unwrap();
        assert_eq!(msg.status, Status::OK);
        assert_eq!(msg.reason_phrase.as_deref(), Some("OK"));
        assert_eq!(response_encoding(&msg), Encoding::ContentLength(5));
    }

    #[test]
    fn response_version_downgrades_message() {
        let mut msg = get("http://example.com/");
        parse_response_head(b"HTTP/1.0 200 OK\r\n\r\n", &mut msg).unwrap();
        assert_eq!(msg.http_version, Version::HTTP_10);
    }

    #[test]
    fn head_response_has_no_body() {
        let mut msg = Message::new(Method::HEAD, "http://example.com/".parse().unwrap());
        parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 123\r\n\r\n",
            &mut msg,
        )
        .unwrap();
        assert_eq!(response_encoding(&msg), Encoding::None);
    }

    #[test]
    fn unknown_transfer_encoding_is_unrecognized() {
        let mut msg = get("http://example.com/");
        parse_response_head(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: broken\r\n\r\n",
            &mut msg,
        )
        .unwrap();
        assert_eq!(response_encoding(&msg), Encoding::Unrecognized);
    }

    #[test]
    fn te_final_coding_chunked() {
        let mut msg = get("http://example.com/");
        parse_response_head(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
            &mut msg,
        )
        .unwrap();
        assert_eq!(response_encoding(&msg), Encoding::Chunked);
    }

    #[test]
    fn keepalive_rules() {
        let mut msg = get("http://example.com/");
        parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", &mut msg).unwrap();
        assert!(is_keepalive(&msg));

        let mut msg = get("http://example.com/");
        parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            &mut msg,
        )
        .unwrap();
        assert!(!is_keepalive(&msg));

        // EOF-delimited bodies use the connection up.
        let mut msg = get("http://example.com/");
        parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n", &mut msg).unwrap();
        assert!(!is_keepalive(&msg));

        // HTTP/1.0 requires an explicit keep-alive.
        let mut msg = get("http://example.com/");
        parse_response_head(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n", &mut msg).unwrap();
        assert!(!is_keepalive(&msg));
        let mut msg = get("http://example.com/");
        parse_response_head(
            b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n",
            &mut msg,
        )
        .unwrap();
        assert!(is_keepalive(&msg));
    }

    #[test]
    fn expect_continue_detection() {
        let mut headers = HeaderMap::new();
        assert!(!expects_continue(&headers));
        headers.insert(EXPECT, "100-continue".parse().unwrap());
        assert!(expects_continue(&headers));
    }
}
