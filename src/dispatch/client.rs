//! The client side of the dispatcher: serialize request heads, parse
//! response heads, and run both body state machines.

use std::io::Write;

use tracing::{debug, trace};

use crate::headers::{self, Encoding};
use crate::status::Status;

use super::item::{body_state, IoState, Item};
use super::{Dispatcher, IoCore, Role, WriteSrc};

/// The client role. Requests go out, responses come in.
#[derive(Debug)]
pub struct Client {
    _priv: (),
}

impl Role for Client {
    fn start(disp: &mut Dispatcher<Client>, key: usize) {
        {
            let (_, item) = disp.parts(key);
            item.msg.cleanup_response();
        }
        disp.process_output_queue();
    }

    fn write(disp: &mut Dispatcher<Client>, key: usize) -> bool {
        let (io, item) = disp.parts(key);
        write_item(io, item)
    }

    fn read(disp: &mut Dispatcher<Client>, key: usize) -> bool {
        let (io, item) = disp.parts(key);
        read_item(io, item)
    }
}

fn write_item(io: &mut IoCore, item: &mut Item) -> bool {
    if item.write_state == IoState::NotStarted {
        item.write_state = IoState::Headers;
    }

    loop {
        trace!("write_item state {:?}", item.write_state);
        match item.write_state {
            IoState::NotStarted => return false,

            IoState::Headers => {
                if item.write_buf.is_empty() {
                    item.write_encoding =
                        headers::write_request_head(&mut item.msg, io.via_proxy, &mut item.write_buf);
                }
                if !io.write_data(item, WriteSrc::Scratch, false) {
                    return false;
                }
                item.write_buf.clear();

                if let Encoding::ContentLength(len) = item.write_encoding {
                    item.write_length = len;
                }

                if headers::expects_continue(&item.msg.request_headers) {
                    // Nothing else goes out until the server weighs in.
                    item.write_state = IoState::Blocking;
                    item.read_state = IoState::Headers;
                } else {
                    item.write_state = body_state(item.write_encoding);
                }

                if item.msg.status.is_informational() {
                    item.observer.wrote_informational(&mut item.msg);
                    item.msg.cleanup_response();
                } else {
                    item.observer.wrote_headers(&mut item.msg);
                }
                if item.after_callback() {
                    return false;
                }
            }

            IoState::Blocking => {
                // If the read side released us it also re-entered the
                // write processor, so returning is all there is to do.
                return false;
            }

            IoState::Body => {
                if item.write_length == 0 && item.write_encoding != Encoding::Eof {
                    item.write_state = IoState::Finishing;
                    item.observer.wrote_body(&mut item.msg);
                    if item.after_callback() {
                        return false;
                    }
                    continue;
                }

                if item.write_chunk.is_none() {
                    let chunk = match item.msg.request_body.chunk(item.write_body_offset) {
                        Some(chunk) => chunk,
                        None => {
                            // The body stream has nothing for us yet.
                            item.paused = true;
                            return false;
                        }
                    };
                    if chunk.len() as u64 > item.write_length
                        && item.write_encoding != Encoding::Eof
                    {
                        // More than the headers promised; truncate to the
                        // advertised length.
                        item.write_chunk = Some(chunk.slice(..item.write_length as usize));
                    } else if item.write_encoding == Encoding::Eof && chunk.is_empty() {
                        item.write_state = IoState::Finishing;
                        item.observer.wrote_body(&mut item.msg);
                        if item.after_callback() {
                            return false;
                        }
                        continue;
                    } else {
                        item.write_chunk = Some(chunk);
                    }
                }

                if !io.write_data(item, WriteSrc::Chunk, true) {
                    return false;
                }

                let written = item.write_chunk.take().map(|c| c.len()).unwrap_or(0);
                item.write_body_offset += written as u64;
                if !item.msg.flags.can_rebuild {
                    item.msg.request_body.discard_to(item.write_body_offset);
                }
                item.observer.wrote_chunk(&mut item.msg);
                if item.after_callback() {
                    return false;
                }
            }

            IoState::ChunkSize => {
                if item.write_chunk.is_none() {
                    let chunk = match item.msg.request_body.chunk(item.write_body_offset) {
                        Some(chunk) => chunk,
                        None => {
                            item.paused = true;
                            return false;
                        }
                    };
                    let _ = write!(item.write_buf, "{:x}\r\n", chunk.len());
                    item.write_body_offset += chunk.len() as u64;
                    item.write_chunk = Some(chunk);
                }

                if !io.write_data(item, WriteSrc::Scratch, false) {
                    return false;
                }
                item.write_buf.clear();

                if item
                    .write_chunk
                    .as_ref()
                    .map(|c| c.is_empty())
                    .unwrap_or(true)
                {
                    // The terminating chunk has no data or CRLF of its
                    // own, just the trailer block.
                    item.write_chunk = None;
                    item.write_state = IoState::Trailers;
                    continue;
                }
                item.write_state = IoState::Chunk;
            }

            IoState::Chunk => {
                if !io.write_data(item, WriteSrc::Chunk, true) {
                    return false;
                }
                item.write_chunk = None;
                item.write_state = IoState::ChunkEnd;
                if !item.msg.flags.can_rebuild {
                    item.msg.request_body.discard_to(item.write_body_offset);
                }
                item.observer.wrote_chunk(&mut item.msg);
                if item.after_callback() {
                    return false;
                }
            }

            IoState::ChunkEnd => {
                if !io.write_data(item, WriteSrc::Eol, false) {
                    return false;
                }
                item.write_state = IoState::ChunkSize;
            }

            IoState::Trailers => {
                if !io.write_data(item, WriteSrc::Eol, false) {
                    return false;
                }
                item.write_state = IoState::Finishing;
                item.observer.wrote_body(&mut item.msg);
                if item.after_callback() {
                    return false;
                }
            }

            IoState::Finishing => {
                item.write_state = IoState::Done;
                item.read_state = IoState::Headers;
                return true;
            }

            IoState::Done => {
                debug_assert!(false, "write_item called in Done state");
                return true;
            }
        }
    }
}

fn read_item(io: &mut IoCore, item: &mut Item) -> bool {
    loop {
        trace!("read_item state {:?}", item.read_state);
        match item.read_state {
            IoState::NotStarted => return false,

            IoState::Headers => {
                if !io.read_metadata(item, true) {
                    return false;
                }

                let parsed = headers::parse_response_head(&item.read_meta_buf, &mut item.msg)
                    .map(|()| headers::response_encoding(&item.msg));
                item.read_meta_buf.clear();

                let encoding = match parsed {
                    Ok(Encoding::Unrecognized) | Err(_) => {
                        // Either the head didn't parse or it announced
                        // framing we can't honor. Skip to the end and
                        // make sure the connection closes afterwards.
                        debug!("malformed response head");
                        item.msg.status = Status::Malformed;
                        item.msg
                            .request_headers
                            .append(http::header::CONNECTION, http::HeaderValue::from_static("close"));
                        item.read_state = IoState::Finishing;
                        continue;
                    }
                    Ok(encoding) => encoding,
                };

                item.read_encoding = encoding;
                if encoding == Encoding::Eof {
                    item.read_eof_ok = true;
                }
                if let Encoding::ContentLength(len) = encoding {
                    item.read_length = len;
                    if !item.msg.is_keepalive() {
                        // Tolerate a short body from servers that send a
                        // wrong Content-Length and then just hang up.
                        item.read_eof_ok = true;
                    }
                }

                if item.msg.status.is_informational() {
                    if item.msg.status.code() == Some(http::StatusCode::CONTINUE)
                        && item.write_state == IoState::Blocking
                    {
                        // Park the reader, release the writer.
                        item.read_state = IoState::Blocking;
                        item.write_state = body_state(item.write_encoding);
                    } else {
                        item.read_state = IoState::Headers;
                    }
                    item.observer.got_informational(&mut item.msg);
                    item.msg.cleanup_response();
                    if item.after_callback() {
                        return false;
                    }
                } else {
                    item.read_state = body_state(encoding);
                    // A client waiting for a Continue that got a final
                    // response instead is done writing.
                    if item.write_state == IoState::Blocking {
                        item.write_state = IoState::Done;
                    }
                    item.observer.got_headers(&mut item.msg);
                    if item.after_callback() {
                        return false;
                    }
                }
            }

            IoState::Blocking => return false,

            IoState::Body => {
                if !io.read_body_chunk(item) {
                    return false;
                }
                if !finish_body(io, item) {
                    return false;
                }
            }

            IoState::ChunkSize => {
                if !io.read_metadata(item, false) {
                    return false;
                }
                item.read_length = parse_chunk_size(&item.read_meta_buf);
                item.read_meta_buf.clear();
                item.read_state = if item.read_length > 0 {
                    IoState::Chunk
                } else {
                    IoState::Trailers
                };
            }

            IoState::Chunk => {
                if !io.read_body_chunk(item) {
                    return false;
                }
                item.read_state = IoState::ChunkEnd;
            }

            IoState::ChunkEnd => {
                if !io.read_metadata(item, false) {
                    return false;
                }
                item.read_meta_buf.clear();
                item.read_state = IoState::ChunkSize;
            }

            IoState::Trailers => {
                if !io.read_metadata(item, false) {
                    return false;
                }
                if item.read_meta_buf.len() <= 2 {
                    item.read_meta_buf.clear();
                    if !finish_body(io, item) {
                        return false;
                    }
                    continue;
                }
                // Trailer fields are read and dropped.
                item.read_meta_buf.clear();
            }

            IoState::Finishing => {
                item.read_state = IoState::Done;
                return true;
            }

            IoState::Done => {
                debug_assert!(false, "read_item called in Done state");
                return true;
            }
        }
    }
}

/// The body is fully read: flush sniffing and fire `got_body`.
fn finish_body(io: &mut IoCore, item: &mut Item) -> bool {
    if !io.handle_sniffing(item, true) {
        return false;
    }
    item.read_state = IoState::Finishing;
    item.observer.got_body(&mut item.msg);
    !item.after_callback()
}

/// Chunk sizes are lowercase hex with optional extensions after a
/// semicolon; everything past the last hex digit is ignored.
fn parse_chunk_size(buf: &[u8]) -> u64 {
    let mut len: u64 = 0;
    for &b in buf {
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as u64,
            b'a'..=b'f' => (b - b'a' + 10) as u64,
            b'A'..=b'F' => (b - b'A' + 10) as u64,
            _ => break,
        };
        len = len.saturating_mul(16).saturating_add(digit);
    }
    len
}

#[cfg(test)]
mod tests {
    use super::parse_chunk_size;

    #[test]
    fn chunk_sizes() {
        assert_eq!(parse_chunk_size(b"0\r\n"), 0);
        assert_eq!(parse_chunk_size(b"5\r\n"), 5);
        assert_eq!(parse_chunk_size(b"1a2B\r\n"), 0x1a2b);
        assert_eq!(parse_chunk_size(b"10;ext=1\r\n"), 16);
        assert_eq!(parse_chunk_size(b"ffffffffffffffffff"), u64::max_value());
    }
}
