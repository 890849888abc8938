// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode CoAP messages carried in bootstrap datagrams.
// Author: Lukas Bower

//! Minimal CoAP (RFC 7252) message codec: fixed header, token, delta-encoded options
//! and payload. Block-wise transfer and observe are not supported.

use std::fmt;

use thiserror::Error;

/// Protocol version carried in every header.
pub const COAP_VERSION: u8 = 1;
/// Separates options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;
/// Longest token permitted by the header's 4-bit length field.
pub const MAX_TOKEN_LEN: usize = 8;
/// Uri-Path option number.
pub const OPTION_URI_PATH: u16 = 11;
/// Content-Format option number.
pub const OPTION_CONTENT_FORMAT: u16 = 12;
/// Uri-Query option number.
pub const OPTION_URI_QUERY: u16 = 15;

const HEADER_LEN: usize = 4;
const MAX_OPTION_FIELD: usize = 65_535 + 269;

/// Codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoapError {
    /// The datagram ended before a declared field.
    #[error("truncated message")]
    Truncated,
    /// Header version is not 1.
    #[error("unsupported CoAP version {0}")]
    UnsupportedVersion(u8),
    /// Token length nibble above 8.
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    /// Reserved nibble or option number overflow.
    #[error("malformed option")]
    InvalidOption,
    /// Payload marker followed by zero bytes.
    #[error("payload marker without payload")]
    EmptyPayload,
    /// Empty message (code 0.00) carrying token, options or payload.
    #[error("empty message carries content")]
    MalformedEmpty,
    /// Token too long to encode.
    #[error("token of {0} bytes exceeds {MAX_TOKEN_LEN}")]
    TokenTooLong(usize),
    /// Option delta or length too large to encode.
    #[error("option field of {0} exceeds the encodable range")]
    OptionTooLarge(usize),
}

/// Message type from the header's T field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Requires an acknowledgement.
    Confirmable,
    /// Fire and forget.
    NonConfirmable,
    /// Acknowledges a confirmable message, possibly carrying a response.
    Acknowledgement,
    /// Rejects a message the receiver cannot process.
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// Method or response code, `class.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

#[allow(missing_docs)]
impl Code {
    pub const EMPTY: Self = Self::new(0, 0);
    pub const GET: Self = Self::new(0, 1);
    pub const POST: Self = Self::new(0, 2);
    pub const PUT: Self = Self::new(0, 3);
    pub const DELETE: Self = Self::new(0, 4);
    pub const CREATED: Self = Self::new(2, 1);
    pub const DELETED: Self = Self::new(2, 2);
    pub const CHANGED: Self = Self::new(2, 4);
    pub const CONTENT: Self = Self::new(2, 5);
    pub const BAD_REQUEST: Self = Self::new(4, 0);
    pub const UNAUTHORIZED: Self = Self::new(4, 1);
    pub const NOT_FOUND: Self = Self::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);
    pub const NOT_ACCEPTABLE: Self = Self::new(4, 6);
    pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);
    pub const SERVICE_UNAVAILABLE: Self = Self::new(5, 3);
}

impl Code {
    /// Build a code from class (0..=7) and detail (0..=31).
    #[must_use]
    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1F))
    }

    /// Code from its wire byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Wire byte.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Class digit.
    #[must_use]
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Detail digits.
    #[must_use]
    pub const fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Whether this is a method code.
    #[must_use]
    pub const fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    /// Whether this is a response code (classes 2 to 5).
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self.class(), 2..=5)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({self})")
    }
}

/// One option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number.
    pub number: u16,
    /// Raw option value.
    pub value: Vec<u8>,
}

/// A decoded CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header type.
    pub kind: MessageType,
    /// Method or response code.
    pub code: Code,
    /// Message id used for deduplication and ACK matching.
    pub message_id: u16,
    /// Request/response correlation token.
    pub token: Vec<u8>,
    options: Vec<CoapOption>,
    /// Body after the payload marker.
    pub payload: Vec<u8>,
}

impl Message {
    /// Message without token, options or payload.
    #[must_use]
    pub fn new(kind: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Empty acknowledgement for `message_id`.
    #[must_use]
    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id)
    }

    /// Reset for `message_id`.
    #[must_use]
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id)
    }

    /// Attach a token.
    #[must_use]
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Insert an option after any existing option with the same number.
    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let at = self.options.partition_point(|option| option.number <= number);
        self.options.insert(at, CoapOption { number, value });
    }

    /// Append a Uri-Path segment.
    pub fn add_uri_path(&mut self, segment: &str) {
        self.add_option(OPTION_URI_PATH, segment.as_bytes().to_vec());
    }

    /// Append a Uri-Query argument.
    pub fn add_uri_query(&mut self, query: &str) {
        self.add_option(OPTION_URI_QUERY, query.as_bytes().to_vec());
    }

    /// Set the Content-Format option, encoded as a minimal unsigned integer.
    pub fn set_content_format(&mut self, format: u16) {
        self.options
            .retain(|option| option.number != OPTION_CONTENT_FORMAT);
        let value = match format {
            0 => Vec::new(),
            1..=0xFF => vec![format as u8],
            _ => format.to_be_bytes().to_vec(),
        };
        self.add_option(OPTION_CONTENT_FORMAT, value);
    }

    /// Options in wire order.
    #[must_use]
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Values of every option with `number`, in order.
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |option| option.number == number)
            .map(|option| option.value.as_slice())
    }

    /// Uri-Path segments decoded as UTF-8 (lossy).
    #[must_use]
    pub fn uri_path(&self) -> Vec<String> {
        self.option_values(OPTION_URI_PATH)
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    /// Uri-Query arguments decoded as UTF-8 (lossy).
    #[must_use]
    pub fn uri_queries(&self) -> Vec<String> {
        self.option_values(OPTION_URI_QUERY)
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    /// Content-Format, if present.
    #[must_use]
    pub fn content_format(&self) -> Option<u16> {
        let value = self.option_values(OPTION_CONTENT_FORMAT).next()?;
        if value.len() > 2 {
            return None;
        }
        Some(value.iter().fold(0u16, |acc, byte| (acc << 8) | u16::from(*byte)))
    }

    /// Serialise to a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, CoapError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CoapError::TokenTooLong(self.token.len()));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.token.len() + self.payload.len() + 16);
        buf.push((COAP_VERSION << 6) | (self.kind.bits() << 4) | self.token.len() as u8);
        buf.push(self.code.raw());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.token);

        let mut previous = 0u16;
        for option in &self.options {
            let delta = usize::from(option.number - previous);
            let length = option.value.len();
            if length > MAX_OPTION_FIELD {
                return Err(CoapError::OptionTooLarge(length));
            }
            buf.push((nibble(delta) << 4) | nibble(length));
            push_extended(&mut buf, delta);
            push_extended(&mut buf, length);
            buf.extend_from_slice(&option.value);
            previous = option.number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        Ok(buf)
    }

    /// Parse a datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoapError> {
        if bytes.len() < HEADER_LEN {
            return Err(CoapError::Truncated);
        }
        let version = bytes[0] >> 6;
        if version != COAP_VERSION {
            return Err(CoapError::UnsupportedVersion(version));
        }
        let kind = MessageType::from_bits(bytes[0] >> 4);
        let token_len = bytes[0] & 0x0F;
        if usize::from(token_len) > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(token_len));
        }
        let code = Code::from_raw(bytes[1]);
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut pos = HEADER_LEN;
        let token = take(bytes, &mut pos, usize::from(token_len))?.to_vec();
        if code == Code::EMPTY && (token_len != 0 || bytes.len() > HEADER_LEN) {
            return Err(CoapError::MalformedEmpty);
        }

        let mut message = Self::new(kind, code, message_id).with_token(token);
        let mut number = 0u16;
        while pos < bytes.len() {
            let byte = bytes[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == bytes.len() {
                    return Err(CoapError::EmptyPayload);
                }
                message.payload = bytes[pos..].to_vec();
                break;
            }
            let delta = read_extended(bytes, &mut pos, byte >> 4)?;
            let length = read_extended(bytes, &mut pos, byte & 0x0F)?;
            number = u16::try_from(delta)
                .ok()
                .and_then(|delta| number.checked_add(delta))
                .ok_or(CoapError::InvalidOption)?;
            let value = take(bytes, &mut pos, length)?.to_vec();
            message.options.push(CoapOption { number, value });
        }
        Ok(message)
    }
}

fn nibble(value: usize) -> u8 {
    match value {
        0..=12 => value as u8,
        13..=268 => 13,
        _ => 14,
    }
}

fn push_extended(buf: &mut Vec<u8>, value: usize) {
    match value {
        0..=12 => {}
        13..=268 => buf.push((value - 13) as u8),
        _ => buf.extend_from_slice(&((value - 269) as u16).to_be_bytes()),
    }
}

fn read_extended(bytes: &[u8], pos: &mut usize, nibble: u8) -> Result<usize, CoapError> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => Ok(usize::from(take(bytes, pos, 1)?[0]) + 13),
        14 => {
            let ext = take(bytes, pos, 2)?;
            Ok(usize::from(u16::from_be_bytes([ext[0], ext[1]])) + 269)
        }
        _ => Err(CoapError::InvalidOption),
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], CoapError> {
    let end = pos.checked_add(len).ok_or(CoapError::Truncated)?;
    let slice = bytes.get(*pos..end).ok_or(CoapError::Truncated)?;
    *pos = end;
    Ok(slice)
}
