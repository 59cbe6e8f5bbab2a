//! HTTP process plugin.
//!
//! Recognises HTTP/1.x requests and responses by their first bytes, records
//! the interesting header fields on the flow, and flushes the flow when a
//! second request (or response) arrives on the same 5-tuple so each
//! application transaction exports as its own record. HTTP/2 is detected in
//! two steps: the 24-byte connection preface arms detection and a valid
//! frame header confirms it.

use std::any::Any;
use std::sync::OnceLock;

use nom::IResult;
use nom::bytes::complete::{take, take_till};
use nom::number::complete::{be_u8, be_u24, be_u32};
use nom::sequence::tuple;
use serde::Serialize;
use tracing::trace;

use crate::cache::record::FlowRecord;
use crate::packet::Packet;
use crate::process::{
    Extension, ExtensionId, ParserAction, ProcessPlugin, register_extension,
};

static HTTP_EXTENSION_ID: OnceLock<ExtensionId> = OnceLock::new();

/// The process-wide extension id of [`HttpExtension`].
pub fn http_extension_id() -> ExtensionId {
    *HTTP_EXTENSION_ID.get_or_init(register_extension)
}

const HTTP2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const HTTP2_FRAME_HEADER_LEN: usize = 9;
/// Highest frame type defined by RFC 7540 (CONTINUATION).
const HTTP2_MAX_FRAME_TYPE: u8 = 0x9;

const MAX_URI_LEN: usize = 512;
const MAX_FIELD_LEN: usize = 255;

/// HTTP state attached to a flow.
#[derive(Debug, Default, Clone, Serialize)]
pub struct HttpExtension {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request URI, capped at 512 bytes.
    pub uri: String,
    /// `Host` request header.
    pub host: String,
    /// `User-Agent` request header.
    pub user_agent: String,
    /// `Referer` request header.
    pub referer: String,
    /// Response status code, 0 until a response was seen.
    pub status_code: u16,
    /// `Content-Type` response header.
    pub content_type: String,
    /// A complete request line and header block was recorded.
    pub request_seen: bool,
    /// A complete response status line and header block was recorded.
    pub response_seen: bool,
    /// The HTTP/2 connection preface was observed; detection is armed.
    pub http2_preface_seen: bool,
    /// HTTP/2 confirmed: preface plus at least one valid frame header.
    pub http2: bool,
}

impl Extension for HttpExtension {
    fn id(&self) -> ExtensionId {
        http_extension_id()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

enum ParseOutcome {
    /// Fields recorded on the extension.
    Stored,
    /// A transaction of this kind was already recorded on the flow.
    Repeat,
    /// Payload did not parse as the expected message.
    NotHttp,
}

/// HTTP request/response/HTTP-2 parser hooked at `post_create` and
/// `pre_update`.
#[derive(Debug, Default)]
pub struct HttpPlugin {
    requests: u64,
    responses: u64,
    total: u64,
}

impl HttpPlugin {
    /// Fresh plugin with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsed requests so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Parsed responses so far.
    pub fn responses(&self) -> u64 {
        self.responses
    }

    /// HTTP payloads inspected so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn handle_http2(&mut self, flow: &mut FlowRecord, payload: &[u8]) {
        self.total += 1;
        let id = http_extension_id();
        if flow.extension::<HttpExtension>(id).is_none() {
            let _ = flow.add_extension(Box::new(HttpExtension::default()));
        }
        let Some(ext) = flow.extension_mut::<HttpExtension>(id) else {
            return;
        };

        let frames = if has_preface(payload) {
            ext.http2_preface_seen = true;
            &payload[HTTP2_PREFACE.len()..]
        } else {
            payload
        };
        if ext.http2_preface_seen && !ext.http2 && valid_frame_header(frames) {
            trace!("http2 confirmed by frame header");
            ext.http2 = true;
        }
    }

    fn handle_request(&mut self, flow: &mut FlowRecord, payload: &[u8]) -> ParserAction {
        self.total += 1;
        let id = http_extension_id();
        if let Some(ext) = flow.extension_mut::<HttpExtension>(id) {
            match parse_request(payload, ext) {
                ParseOutcome::Stored => {
                    self.requests += 1;
                    ParserAction::Continue
                }
                ParseOutcome::Repeat => {
                    self.total -= 1;
                    ParserAction::FlushWithReinsert
                }
                ParseOutcome::NotHttp => ParserAction::Continue,
            }
        } else {
            // Parse into a scratch extension; attach only what parsed.
            let mut fresh = HttpExtension::default();
            if matches!(parse_request(payload, &mut fresh), ParseOutcome::Stored) {
                self.requests += 1;
                let _ = flow.add_extension(Box::new(fresh));
            }
            ParserAction::Continue
        }
    }

    fn handle_response(&mut self, flow: &mut FlowRecord, payload: &[u8]) -> ParserAction {
        self.total += 1;
        let id = http_extension_id();
        if let Some(ext) = flow.extension_mut::<HttpExtension>(id) {
            match parse_response(payload, ext) {
                ParseOutcome::Stored => {
                    self.responses += 1;
                    ParserAction::Continue
                }
                ParseOutcome::Repeat => {
                    self.total -= 1;
                    ParserAction::FlushWithReinsert
                }
                ParseOutcome::NotHttp => ParserAction::Continue,
            }
        } else {
            let mut fresh = HttpExtension::default();
            if matches!(parse_response(payload, &mut fresh), ParseOutcome::Stored) {
                self.responses += 1;
                let _ = flow.add_extension(Box::new(fresh));
            }
            ParserAction::Continue
        }
    }

    fn http2_armed(&self, flow: &FlowRecord) -> bool {
        flow.extension::<HttpExtension>(http_extension_id())
            .map(|ext| ext.http2_preface_seen)
            .unwrap_or(false)
    }
}

impl ProcessPlugin for HttpPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn extension_id(&self) -> Option<ExtensionId> {
        Some(http_extension_id())
    }

    fn make_extension(&self) -> Option<Box<dyn Extension>> {
        Some(Box::new(HttpExtension::default()))
    }

    fn post_create(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        let payload = pkt.payload;
        if has_preface(payload) {
            self.handle_http2(flow, payload);
        } else if is_request(payload) {
            let _ = self.handle_request(flow, payload);
        } else if is_response(payload) {
            let _ = self.handle_response(flow, payload);
        }
        ParserAction::Continue
    }

    fn pre_update(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        let payload = pkt.payload;
        if has_preface(payload) || (payload.len() >= HTTP2_FRAME_HEADER_LEN && self.http2_armed(flow)) {
            self.handle_http2(flow, payload);
            ParserAction::Continue
        } else if is_request(payload) {
            self.handle_request(flow, payload)
        } else if is_response(payload) {
            self.handle_response(flow, payload)
        } else {
            ParserAction::Continue
        }
    }
}

/// True when the payload begins with a plausible HTTP method.
pub fn is_request(payload: &[u8]) -> bool {
    if payload.len() < 4 {
        return false;
    }
    matches!(
        &payload[..4],
        b"GET " | b"POST" | b"PUT " | b"HEAD" | b"DELE" | b"TRAC" | b"OPTI" | b"CONN" | b"PATC"
    )
}

/// True when the payload begins with an HTTP status line.
pub fn is_response(payload: &[u8]) -> bool {
    payload.len() >= 4 && &payload[..4] == b"HTTP"
}

fn has_preface(payload: &[u8]) -> bool {
    payload.len() >= HTTP2_PREFACE.len() && &payload[..HTTP2_PREFACE.len()] == HTTP2_PREFACE
}

/// Validates one HTTP/2 frame header: known frame type and a frame length
/// consistent with the bytes on the wire.
fn valid_frame_header(buf: &[u8]) -> bool {
    let parsed: IResult<&[u8], (u32, u8, u8, u32)> =
        tuple((be_u24, be_u8, be_u8, be_u32))(buf);
    match parsed {
        Ok((rest, (length, frame_type, _flags, _stream))) => {
            frame_type <= HTTP2_MAX_FRAME_TYPE && rest.len() >= length as usize
        }
        Err(_) => false,
    }
}

/// One header line without its CRLF; fails when the line is fragmented.
fn crlf_line(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, line) = take_till(|c| c == b'\n')(i)?;
    let (rest, _) = take(1usize)(rest)?;
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Ok((rest, line))
}

fn capped_string(bytes: &[u8], cap: usize) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(cap)]).into_owned()
}

fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&c| c == b':')?;
    let value = &line[colon + 1..];
    let value = value.strip_prefix(b" ").unwrap_or(value);
    Some((&line[..colon], value))
}

fn parse_request(payload: &[u8], ext: &mut HttpExtension) -> ParseOutcome {
    let Ok((rest, line)) = crlf_line(payload) else {
        return ParseOutcome::NotHttp;
    };
    let mut tokens = line.splitn(3, |&c| c == b' ');
    let (Some(method), Some(uri), Some(version)) = (tokens.next(), tokens.next(), tokens.next())
    else {
        return ParseOutcome::NotHttp;
    };
    if !version.starts_with(b"HTTP") {
        return ParseOutcome::NotHttp;
    }
    if ext.request_seen {
        return ParseOutcome::Repeat;
    }

    ext.method = capped_string(method, 16);
    ext.uri = capped_string(uri, MAX_URI_LEN);

    let mut rest = rest;
    while !rest.is_empty() {
        let Ok((next, line)) = crlf_line(rest) else {
            return ParseOutcome::NotHttp;
        };
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = split_header(line) {
            match name {
                b"Host" => ext.host = capped_string(value, MAX_FIELD_LEN),
                b"User-Agent" => ext.user_agent = capped_string(value, MAX_FIELD_LEN),
                b"Referer" => ext.referer = capped_string(value, MAX_FIELD_LEN),
                _ => {}
            }
        } else {
            return ParseOutcome::NotHttp;
        }
        rest = next;
    }

    ext.request_seen = true;
    ParseOutcome::Stored
}

fn parse_response(payload: &[u8], ext: &mut HttpExtension) -> ParseOutcome {
    let Ok((rest, line)) = crlf_line(payload) else {
        return ParseOutcome::NotHttp;
    };
    let mut tokens = line.splitn(3, |&c| c == b' ');
    let (Some(version), Some(code)) = (tokens.next(), tokens.next()) else {
        return ParseOutcome::NotHttp;
    };
    if !version.starts_with(b"HTTP") {
        return ParseOutcome::NotHttp;
    }
    let Some(code) = std::str::from_utf8(code)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|&c| c > 0)
    else {
        return ParseOutcome::NotHttp;
    };
    if ext.response_seen {
        return ParseOutcome::Repeat;
    }
    ext.status_code = code;

    let mut rest = rest;
    while !rest.is_empty() {
        let Ok((next, line)) = crlf_line(rest) else {
            return ParseOutcome::NotHttp;
        };
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = split_header(line) {
            if name == b"Content-Type" {
                ext.content_type = capped_string(value, MAX_FIELD_LEN);
            }
        } else {
            return ParseOutcome::NotHttp;
        }
        rest = next;
    }

    ext.response_seen = true;
    ParseOutcome::Stored
}
