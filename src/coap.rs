//! CoAP message codec
//!
//! Minimal RFC 7252 message codec used by the flattener and the header
//! builder. It validates a message, exposes header fields, tokens and options
//! by position or number, and re-encodes options with delta encoding.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::error::{Result, SchcError};

pub const COAP_VERSION: u8 = 1;
pub const PAYLOAD_MARKER: u8 = 0xFF;
pub const MAX_TOKEN_LEN: usize = 8;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A parsed (or to-be-encoded) CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    version: u8,
    message_type: u8,
    code: u8,
    message_id: u16,
    token: Vec<u8>,
    options: Vec<CoapOption>,
    payload: Vec<u8>,
}

impl Default for CoapMessage {
    fn default() -> Self {
        Self {
            version: COAP_VERSION,
            message_type: 0,
            code: 0,
            message_id: 0,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> SchcError {
    SchcError::InvalidPacket(format!("CoAP: {}", msg.into()))
}

impl CoapMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and parse a CoAP message.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(invalid(format!("{} bytes is shorter than the header", data.len())));
        }

        let version = data[0] >> 6;
        if version != COAP_VERSION {
            return Err(invalid(format!("unsupported version {version}")));
        }
        let message_type = (data[0] >> 4) & 0x03;
        let tkl = (data[0] & 0x0F) as usize;
        if tkl > MAX_TOKEN_LEN {
            return Err(invalid(format!("token length {tkl} exceeds {MAX_TOKEN_LEN}")));
        }
        let code = data[1];
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = HEADER_LEN;
        let token = data
            .get(pos..pos + tkl)
            .ok_or_else(|| invalid("truncated token"))?
            .to_vec();
        pos += tkl;

        let mut options = Vec::new();
        let mut payload = Vec::new();
        let mut number: u16 = 0;

        while pos < data.len() {
            let byte = data[pos];
            pos += 1;

            if byte == PAYLOAD_MARKER {
                if pos == data.len() {
                    return Err(invalid("payload marker without payload"));
                }
                payload = data[pos..].to_vec();
                break;
            }

            let delta = read_extended(data, &mut pos, byte >> 4)?;
            let length = read_extended(data, &mut pos, byte & 0x0F)? as usize;

            number = number
                .checked_add(delta)
                .ok_or_else(|| invalid("option number overflow"))?;
            let value = data
                .get(pos..pos + length)
                .ok_or_else(|| invalid(format!("option {number} value truncated")))?
                .to_vec();
            pos += length;

            options.push(CoapOption { number, value });
        }

        Ok(Self {
            version,
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn set_version(&mut self, version: u8) {
        self.version = version & 0x03;
    }

    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: u8) {
        self.message_type = message_type & 0x03;
    }

    pub fn token_length(&self) -> u8 {
        self.token.len() as u8
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn set_code(&mut self, code: u8) {
        self.code = code;
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn set_message_id(&mut self, message_id: u16) {
        self.message_id = message_id;
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn set_token(&mut self, token: Vec<u8>) -> Result<()> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(invalid(format!("token length {} exceeds {MAX_TOKEN_LEN}", token.len())));
        }
        self.token = token;
        Ok(())
    }

    /// Options in wire order.
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    pub fn options_by_number(&self, number: u16) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.number == number)
    }

    /// Add an option after any existing option with the same or a lower number.
    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(at, CoapOption { number, value });
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Encoded length of everything before the payload, marker included.
    pub fn header_len(&self) -> usize {
        let mut len = HEADER_LEN + self.token.len();
        let mut prev = 0;
        for option in &self.options {
            len += encoded_option_len(option.number - prev, option.value.len());
            prev = option.number;
        }
        if !self.payload.is_empty() {
            len += 1;
        }
        len
    }

    /// Encode the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() + self.payload.len());
        out.push((self.version << 6) | (self.message_type << 4) | self.token_length());
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut prev = 0;
        for option in &self.options {
            encode_option(&mut out, option.number - prev, &option.value);
            prev = option.number;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }
}

/// Resolve a 4-bit delta/length nibble, consuming extended bytes.
fn read_extended(data: &[u8], pos: &mut usize, nibble: u8) -> Result<u16> {
    match nibble {
        0..=12 => Ok(nibble as u16),
        13 => {
            let ext = *data.get(*pos).ok_or_else(|| invalid("truncated option"))?;
            *pos += 1;
            Ok(ext as u16 + 13)
        }
        14 => {
            let ext = data
                .get(*pos..*pos + 2)
                .ok_or_else(|| invalid("truncated option"))?;
            *pos += 2;
            u16::from_be_bytes([ext[0], ext[1]])
                .checked_add(269)
                .ok_or_else(|| invalid("option field overflow"))
        }
        _ => Err(invalid("reserved option nibble 15")),
    }
}

fn nibble_and_extension_len(value: usize) -> (u8, usize) {
    if value < 13 {
        (value as u8, 0)
    } else if value < 269 {
        (13, 1)
    } else {
        (14, 2)
    }
}

fn encoded_option_len(delta: u16, length: usize) -> usize {
    let (_, delta_ext) = nibble_and_extension_len(delta as usize);
    let (_, length_ext) = nibble_and_extension_len(length);
    1 + delta_ext + length_ext + length
}

/// Encode one option with delta encoding.
fn encode_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) {
    let delta = delta as usize;
    let length = value.len();
    let (delta_nibble, _) = nibble_and_extension_len(delta);
    let (length_nibble, _) = nibble_and_extension_len(length);

    out.push((delta_nibble << 4) | length_nibble);
    push_extension(out, delta);
    push_extension(out, length);
    out.extend_from_slice(value);
}

fn push_extension(out: &mut Vec<u8>, value: usize) {
    if (13..269).contains(&value) {
        out.push((value - 13) as u8);
    } else if value >= 269 {
        out.extend_from_slice(&((value - 269) as u16).to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// CON GET /usage, token 0x21FA01FB, payload "hi"
    fn get_usage() -> Vec<u8> {
        vec![
            0x44, 0x01, 0x12, 0x34, // ver 1, CON, TKL 4, GET, MID 0x1234
            0x21, 0xFA, 0x01, 0xFB, // token
            0xB5, b'u', b's', b'a', b'g', b'e', // Uri-Path "usage"
            0xFF, b'h', b'i',
        ]
    }

    #[test]
    fn test_parse_header_fields() {
        let msg = CoapMessage::parse(&get_usage()).unwrap();
        assert_eq!(msg.version(), 1);
        assert_eq!(msg.message_type(), 0);
        assert_eq!(msg.token_length(), 4);
        assert_eq!(msg.code(), 0x01);
        assert_eq!(msg.message_id(), 0x1234);
        assert_eq!(msg.token(), &[0x21, 0xFA, 0x01, 0xFB]);
        assert_eq!(msg.options().len(), 1);
        assert_eq!(msg.options()[0].number, 11);
        assert_eq!(msg.options()[0].value, b"usage");
        assert_eq!(msg.payload(), b"hi");
        assert_eq!(msg.header_len(), 15);
    }

    #[test]
    fn test_encode_reproduces_input() {
        let raw = get_usage();
        assert_eq!(CoapMessage::parse(&raw).unwrap().to_bytes(), raw);
    }

    #[test]
    fn test_extended_delta_and_length() {
        let mut msg = CoapMessage::new();
        msg.add_option(258, vec![0x1A]);
        msg.add_option(35, vec![b'x'; 300]);
        msg.add_option(11, b"a".to_vec());

        let raw = msg.to_bytes();
        assert_eq!(raw.len(), msg.header_len());
        let parsed = CoapMessage::parse(&raw).unwrap();
        let numbers: Vec<u16> = parsed.options().iter().map(|o| o.number).collect();
        assert_eq!(numbers, vec![11, 35, 258]);
        assert_eq!(parsed.options()[1].value.len(), 300);
    }

    #[test]
    fn test_repeated_options_keep_order() {
        let mut msg = CoapMessage::new();
        msg.add_option(11, b"a".to_vec());
        msg.add_option(15, b"q".to_vec());
        msg.add_option(11, b"b".to_vec());
        let paths: Vec<&[u8]> = msg.options_by_number(11).map(|o| o.value.as_slice()).collect();
        assert_eq!(paths, vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[test]
    fn test_rejects_malformed_messages() {
        assert!(CoapMessage::parse(&[0x40, 0x01, 0x00]).is_err());
        // version 2
        assert!(CoapMessage::parse(&[0x80, 0x01, 0x00, 0x00]).is_err());
        // TKL 9
        assert!(CoapMessage::parse(&[0x49, 0x01, 0x00, 0x00]).is_err());
        // truncated token
        assert!(CoapMessage::parse(&[0x42, 0x01, 0x00, 0x00, 0xAA]).is_err());
        // option value runs past the end
        assert!(CoapMessage::parse(&[0x40, 0x01, 0x00, 0x00, 0xB5, b'u']).is_err());
        // reserved nibble
        assert!(CoapMessage::parse(&[0x40, 0x01, 0x00, 0x00, 0xF1, 0x00]).is_err());
        // marker with nothing after it
        assert!(CoapMessage::parse(&[0x40, 0x01, 0x00, 0x00, 0xFF]).is_err());
    }

    #[test]
    fn test_set_token_bounds() {
        let mut msg = CoapMessage::new();
        assert!(msg.set_token(vec![0; 9]).is_err());
        msg.set_token(vec![1, 2]).unwrap();
        assert_eq!(msg.token_length(), 2);
    }
}
