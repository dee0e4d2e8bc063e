//! ISO 7816-4 command/response APDUs: bit-exact short and extended
//! encodings, plus a processor that recovers `61xx` response chaining and
//! `6Cxx` retry-with-Le transparently.

use tracing::trace;

use crate::connection::SmartCardConnection;
use crate::{Error, Result};

pub const SW_OK: u16 = 0x9000;
pub const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
pub const SW_AUTH_METHOD_BLOCKED: u16 = 0x6983;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_WRONG_DATA: u16 = 0x6A80;
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;
pub const SW_INCORRECT_PARAMETERS: u16 = 0x6A86;
pub const SW_REFERENCE_DATA_NOT_FOUND: u16 = 0x6A88;
pub const SW_WRONG_PARAMETERS_P1P2: u16 = 0x6B00;
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
pub const SW_APPLET_SELECT_FAILED: u16 = 0x6999;
pub const SW_MEMORY_FAILURE: u16 = 0x6581;

const INS_SELECT: u8 = 0xA4;
const INS_GET_RESPONSE: u8 = 0xC0;
const CLA_COMMAND_CHAIN: u8 = 0x10;

const SHORT_DATA_MAX: usize = 255;
const SHORT_NE_MAX: usize = 256;
const EXTENDED_DATA_MAX: usize = 65535;
const EXTENDED_NE_MAX: usize = 65536;

/// Which ISO 7816-4 length form a command is encoded in.
///
/// The form is chosen per command; a session may force the extended form
/// after version probing determines the key prefers it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApduFormat {
    Short,
    Extended,
}

/// One command APDU.
///
/// If `ne` is absent no Le field is encoded and the card is not asked for
/// response data; if present it bounds the expected reply length
/// (`256` short / `65536` extended map to `Le=0`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub ne: Option<usize>,
}

impl Apdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            ne: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_ne(mut self, ne: usize) -> Self {
        self.ne = Some(ne);
        self
    }

    /// Encode in the given length form.
    pub fn encode(&self, format: ApduFormat) -> Result<Vec<u8>> {
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        match format {
            ApduFormat::Short => {
                if self.data.len() > SHORT_DATA_MAX {
                    return Err(Error::InvalidArgument("data too long for short APDU"));
                }
                if !self.data.is_empty() {
                    out.push(self.data.len() as u8);
                    out.extend_from_slice(&self.data);
                }
                if let Some(ne) = self.ne {
                    if ne == 0 || ne > SHORT_NE_MAX {
                        return Err(Error::InvalidArgument("ne out of range for short APDU"));
                    }
                    // Le = 0 means 256
                    out.push(if ne == SHORT_NE_MAX { 0 } else { ne as u8 });
                }
            }
            ApduFormat::Extended => {
                if self.data.len() > EXTENDED_DATA_MAX {
                    return Err(Error::InvalidArgument("data too long for extended APDU"));
                }
                if !self.data.is_empty() {
                    out.push(0);
                    out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                    out.extend_from_slice(&self.data);
                    if let Some(ne) = self.ne {
                        if ne == 0 || ne > EXTENDED_NE_MAX {
                            return Err(Error::InvalidArgument("ne out of range for extended APDU"));
                        }
                        // Le = 0x0000 means 65536
                        out.extend_from_slice(&((ne % EXTENDED_NE_MAX) as u16).to_be_bytes());
                    }
                } else if let Some(ne) = self.ne {
                    if ne == 0 || ne > EXTENDED_NE_MAX {
                        return Err(Error::InvalidArgument("ne out of range for extended APDU"));
                    }
                    out.push(0);
                    out.extend_from_slice(&((ne % EXTENDED_NE_MAX) as u16).to_be_bytes());
                }
            }
        }
        Ok(out)
    }

    /// Decode a short-form command APDU. The inverse of
    /// [`Apdu::encode`] with [`ApduFormat::Short`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::BadResponse("APDU shorter than header"));
        }
        let (header, rest) = bytes.split_at(4);
        let mut apdu = Apdu::new(header[0], header[1], header[2], header[3]);
        match rest.len() {
            0 => {}
            1 => {
                apdu.ne = Some(decode_short_le(rest[0]));
            }
            _ => {
                let lc = rest[0] as usize;
                let body = &rest[1..];
                if body.len() == lc {
                    apdu.data = body.to_vec();
                } else if body.len() == lc + 1 {
                    apdu.data = body[..lc].to_vec();
                    apdu.ne = Some(decode_short_le(body[lc]));
                } else {
                    return Err(Error::BadResponse("APDU Lc does not match body length"));
                }
            }
        }
        Ok(apdu)
    }
}

fn decode_short_le(le: u8) -> usize {
    if le == 0 {
        SHORT_NE_MAX
    } else {
        le as usize
    }
}

/// One response APDU, split into body and status word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl ApduResponse {
    pub fn from_bytes(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::BadResponse("response shorter than status word"));
        }
        let sw2 = bytes.pop().expect("length checked") as u16;
        let sw1 = bytes.pop().expect("length checked") as u16;
        Ok(Self {
            data: bytes,
            sw: sw1 << 8 | sw2,
        })
    }

    pub fn sw1(&self) -> u8 {
        (self.sw >> 8) as u8
    }

    pub fn sw2(&self) -> u8 {
        (self.sw & 0xFF) as u8
    }

    pub fn is_ok(&self) -> bool {
        self.sw == SW_OK
    }
}

/// Owns a connection and drives complete command/response exchanges over
/// it, including command chaining for oversized payloads and response
/// chaining for oversized replies.
#[derive(Debug)]
pub struct ApduProcessor<C> {
    connection: C,
    format: ApduFormat,
}

impl<C: SmartCardConnection> ApduProcessor<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            format: ApduFormat::Short,
        }
    }

    /// Prefer the extended form for every subsequent command. Ignored when
    /// the connection cannot carry it.
    pub fn force_extended(&mut self) {
        self.format = ApduFormat::Extended;
    }

    pub fn supports_extended_length(&self) -> bool {
        self.connection.supports_extended_length()
    }

    /// Release the connection.
    pub fn into_connection(self) -> C {
        self.connection
    }

    /// SELECT the application identified by `aid` and return the FCI bytes.
    pub fn select(&mut self, aid: &[u8]) -> Result<Vec<u8>> {
        let apdu = Apdu::new(0x00, INS_SELECT, 0x04, 0x00)
            .with_data(aid)
            .with_ne(SHORT_NE_MAX);
        match self.send_and_receive(&apdu) {
            Err(Error::Apdu { sw }) if sw == SW_FILE_NOT_FOUND || sw == SW_APPLET_SELECT_FAILED => {
                Err(Error::ApplicationNotAvailable { sw })
            }
            result => result,
        }
    }

    /// Send one logical command and return the concatenated response body.
    ///
    /// Any status word other than `9000` (after chaining recovery) is an
    /// [`Error::Apdu`].
    pub fn send_and_receive(&mut self, apdu: &Apdu) -> Result<Vec<u8>> {
        let extended = self.connection.supports_extended_length()
            && (self.format == ApduFormat::Extended
                || apdu.data.len() > SHORT_DATA_MAX
                || apdu.ne.is_some_and(|ne| ne > SHORT_NE_MAX));
        if extended {
            return self.transmit_collect(apdu, ApduFormat::Extended);
        }
        if apdu.data.len() > SHORT_DATA_MAX {
            // Command chaining: every chunk but the last goes out with the
            // chaining bit set and must come back clean.
            let mut chunks = apdu.data.chunks(SHORT_DATA_MAX);
            let last = chunks.next_back().expect("data is non-empty");
            for chunk in chunks {
                let part = Apdu::new(apdu.cla | CLA_COMMAND_CHAIN, apdu.ins, apdu.p1, apdu.p2)
                    .with_data(chunk);
                let response = self.transmit(&part.encode(ApduFormat::Short)?)?;
                if !response.is_ok() {
                    return Err(Error::Apdu { sw: response.sw });
                }
            }
            let mut final_part =
                Apdu::new(apdu.cla, apdu.ins, apdu.p1, apdu.p2).with_data(last.to_vec());
            final_part.ne = apdu.ne;
            return self.transmit_collect(&final_part, ApduFormat::Short);
        }
        self.transmit_collect(apdu, ApduFormat::Short)
    }

    fn transmit(&mut self, bytes: &[u8]) -> Result<ApduResponse> {
        trace!(len = bytes.len(), "transmit APDU");
        let raw = self.connection.send_and_receive(bytes)?;
        ApduResponse::from_bytes(raw)
    }

    fn transmit_collect(&mut self, apdu: &Apdu, format: ApduFormat) -> Result<Vec<u8>> {
        let mut bytes = apdu.encode(format)?;
        let mut body = Vec::new();
        loop {
            let response = self.transmit(&bytes)?;
            match (response.sw1(), response.sw2()) {
                (0x90, 0x00) => {
                    body.extend_from_slice(&response.data);
                    return Ok(body);
                }
                (0x61, available) => {
                    body.extend_from_slice(&response.data);
                    let ne = decode_short_le(available);
                    bytes = Apdu::new(0x00, INS_GET_RESPONSE, 0x00, 0x00)
                        .with_ne(ne)
                        .encode(ApduFormat::Short)?;
                }
                (0x6C, le) => {
                    let mut retry = apdu.clone();
                    retry.ne = Some(decode_short_le(le));
                    bytes = retry.encode(format)?;
                }
                _ => return Err(Error::Apdu { sw: response.sw }),
            }
        }
    }
}
