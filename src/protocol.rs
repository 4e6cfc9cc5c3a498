//! Binary framing for the gain service.
//!
//! Every request is a one byte opcode followed by a fixed size body; every
//! response is a one byte status followed by a body whose shape depends on the
//! request. Application identifiers travel in a 256 byte field (length byte plus
//! 255 zero padded UTF-8 bytes); a set-gain body is that field followed by a
//! little-endian IEEE-754 `f32`, 260 bytes in total.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

use crate::error::{ProtocolError, ValidationError};

/// Longest application identifier, in bytes.
pub const MAX_APP_ID_LEN: usize = 255;
/// Upper bound on entries accepted in a snapshot response.
pub const MAX_SNAPSHOT_ENTRIES: u32 = 65_536;

const STATUS_OK: u8 = 0x00;

/// Length-prefixed, zero padded identifier field.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct AppIdField {
    len: u8,
    bytes: [u8; MAX_APP_ID_LEN],
}

/// Fixed size set-gain command, also used for snapshot records.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct GainCommand {
    app_id: AppIdField,
    gain: [u8; 4],
}

const _: () = assert!(size_of::<AppIdField>() == 256);
const _: () = assert!(size_of::<GainCommand>() == 260);

/// Reject identifiers the wire field cannot carry or the store should not hold.
pub fn validate_app_id(app_id: &str) -> Result<(), ValidationError> {
    if app_id.is_empty() {
        return Err(ValidationError::EmptyIdentifier);
    }
    if app_id.len() > MAX_APP_ID_LEN {
        return Err(ValidationError::IdentifierTooLong { len: app_id.len() });
    }
    Ok(())
}

/// Reject NaN and anything outside `[0.0, 1.0]`.
pub fn validate_gain(gain: f32) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&gain) {
        Ok(())
    } else {
        Err(ValidationError::GainOutOfRange(gain))
    }
}

impl AppIdField {
    /// Encode `app_id`; only the 255 byte limit is enforced here.
    pub fn encode(app_id: &str) -> Result<Self, ValidationError> {
        if app_id.len() > MAX_APP_ID_LEN {
            return Err(ValidationError::IdentifierTooLong { len: app_id.len() });
        }
        let mut field = Self::zeroed();
        field.len = app_id.len() as u8;
        field.bytes[..app_id.len()].copy_from_slice(app_id.as_bytes());
        Ok(field)
    }

    /// Decode the identifier. An empty identifier decodes successfully.
    pub fn decode(&self) -> Result<String, ProtocolError> {
        let len = self.len as usize;
        std::str::from_utf8(&self.bytes[..len])
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidIdentifier)
    }
}

impl GainCommand {
    /// Build a set-gain command.
    pub fn new(app_id: &str, gain: f32) -> Result<Self, ValidationError> {
        Ok(Self {
            app_id: AppIdField::encode(app_id)?,
            gain: gain.to_le_bytes(),
        })
    }

    /// Identifier carried by the command.
    pub fn app_id(&self) -> Result<String, ProtocolError> {
        self.app_id.decode()
    }

    /// Gain carried by the command, not range checked.
    pub fn gain(&self) -> f32 {
        f32::from_le_bytes(self.gain)
    }
}

/// Operation selector, the first byte of every request.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Body: [`GainCommand`].
    SetGain = 0x01,
    /// Body: [`AppIdField`].
    GetGain = 0x02,
    /// No body.
    AllGains = 0x03,
    /// Body: [`AppIdField`].
    RemoveGain = 0x04,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::SetGain),
            0x02 => Ok(Self::GetGain),
            0x03 => Ok(Self::AllGains),
            0x04 => Ok(Self::RemoveGain),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Rejection reasons carried in the response status byte.
#[repr(u8)]
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Identifier was empty.
    #[error("application identifier is empty")]
    EmptyIdentifier = 0x01,
    /// Identifier longer than 255 bytes.
    #[error("application identifier exceeds 255 bytes")]
    IdentifierTooLong = 0x02,
    /// Gain NaN or outside `[0.0, 1.0]`.
    #[error("gain outside [0.0, 1.0]")]
    GainOutOfRange = 0x03,
    /// A write arrived on the restricted interface.
    #[error("interface is read-only")]
    ReadOnly = 0x04,
    /// The request could not be decoded.
    #[error("malformed request")]
    Malformed = 0x05,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::EmptyIdentifier),
            0x02 => Ok(Self::IdentifierTooLong),
            0x03 => Ok(Self::GainOutOfRange),
            0x04 => Ok(Self::ReadOnly),
            0x05 => Ok(Self::Malformed),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Decoded request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Store a gain.
    SetGain {
        /// Target application.
        app_id: String,
        /// Requested gain.
        gain: f32,
    },
    /// Read one gain.
    GetGain {
        /// Target application.
        app_id: String,
    },
    /// Read the whole map.
    AllGains,
    /// Forget one application.
    RemoveGain {
        /// Target application.
        app_id: String,
    },
}

impl Request {
    /// Operation selector for this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::SetGain { .. } => Opcode::SetGain,
            Self::GetGain { .. } => Opcode::GetGain,
            Self::AllGains => Opcode::AllGains,
            Self::RemoveGain { .. } => Opcode::RemoveGain,
        }
    }

    /// Serialize into a single frame.
    pub fn encode(&self) -> Result<Vec<u8>, ValidationError> {
        let mut frame = vec![self.opcode() as u8];
        match self {
            Self::SetGain { app_id, gain } => {
                frame.extend_from_slice(bytemuck::bytes_of(&GainCommand::new(app_id, *gain)?))
            }
            Self::GetGain { app_id } | Self::RemoveGain { app_id } => {
                frame.extend_from_slice(bytemuck::bytes_of(&AppIdField::encode(app_id)?))
            }
            Self::AllGains => {}
        }
        Ok(frame)
    }
}

fn read_pod<T: Pod, R: Read>(reader: &mut R) -> Result<T, ProtocolError> {
    let mut value = T::zeroed();
    reader.read_exact(bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

/// Read the body that follows an already consumed opcode byte.
pub fn read_request_body<R: Read>(opcode: u8, reader: &mut R) -> Result<Request, ProtocolError> {
    match Opcode::try_from(opcode)? {
        Opcode::SetGain => {
            let command: GainCommand = read_pod(reader)?;
            Ok(Request::SetGain {
                app_id: command.app_id()?,
                gain: command.gain(),
            })
        }
        Opcode::GetGain => Ok(Request::GetGain {
            app_id: read_pod::<AppIdField, _>(reader)?.decode()?,
        }),
        Opcode::AllGains => Ok(Request::AllGains),
        Opcode::RemoveGain => Ok(Request::RemoveGain {
            app_id: read_pod::<AppIdField, _>(reader)?.decode()?,
        }),
    }
}

/// Read one complete request.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request, ProtocolError> {
    let mut opcode = [0u8; 1];
    reader.read_exact(&mut opcode)?;
    read_request_body(opcode[0], reader)
}

/// Decoded response.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Write accepted.
    Done,
    /// Answer to a get-gain.
    Gain(f32),
    /// Answer to an all-gains.
    Snapshot(HashMap<String, f32>),
    /// Request refused.
    Rejected(ErrorCode),
}

impl Response {
    /// Serialize into a single frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Done => vec![STATUS_OK],
            Self::Gain(gain) => {
                let mut frame = vec![STATUS_OK];
                frame.extend_from_slice(&gain.to_le_bytes());
                frame
            }
            Self::Snapshot(gains) => {
                let records: Vec<GainCommand> = gains
                    .iter()
                    .filter_map(|(app_id, gain)| GainCommand::new(app_id, *gain).ok())
                    .take(MAX_SNAPSHOT_ENTRIES as usize)
                    .collect();
                let mut frame = Vec::with_capacity(5 + records.len() * size_of::<GainCommand>());
                frame.push(STATUS_OK);
                frame.extend_from_slice(&(records.len() as u32).to_le_bytes());
                frame.extend_from_slice(bytemuck::cast_slice(&records));
                frame
            }
            Self::Rejected(code) => vec![*code as u8],
        }
    }
}

/// Read the response to a request with opcode `sent`.
pub fn read_response<R: Read>(reader: &mut R, sent: Opcode) -> Result<Response, ProtocolError> {
    let mut status = [0u8; 1];
    reader.read_exact(&mut status)?;
    if status[0] != STATUS_OK {
        return Ok(Response::Rejected(ErrorCode::try_from(status[0])?));
    }
    match sent {
        Opcode::SetGain | Opcode::RemoveGain => Ok(Response::Done),
        Opcode::GetGain => {
            let mut gain = [0u8; 4];
            reader.read_exact(&mut gain)?;
            Ok(Response::Gain(f32::from_le_bytes(gain)))
        }
        Opcode::AllGains => {
            let mut count = [0u8; 4];
            reader.read_exact(&mut count)?;
            let count = u32::from_le_bytes(count);
            if count > MAX_SNAPSHOT_ENTRIES {
                return Err(ProtocolError::TooManyEntries(count));
            }
            let mut gains = HashMap::with_capacity(count as usize);
            for _ in 0..count {
                let record: GainCommand = read_pod(reader)?;
                gains.insert(record.app_id()?, record.gain());
            }
            Ok(Response::Snapshot(gains))
        }
    }
}

/// Write a frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> Result<(), ProtocolError> {
    writer.write_all(frame)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn set_gain_frame_is_opcode_plus_260_bytes() {
        let frame = Request::SetGain {
            app_id: "com.apple.Music".into(),
            gain: 0.5,
        }
        .encode()
        .unwrap();
        assert_eq!(frame.len(), 1 + 260);
        assert_eq!(frame[0], Opcode::SetGain as u8);
        assert_eq!(frame[1], 15);
        assert_eq!(&frame[2..17], b"com.apple.Music");
        assert!(frame[17..257].iter().all(|b| *b == 0));
        assert_eq!(&frame[257..261], &0.5f32.to_le_bytes());
    }

    #[test]
    fn identifier_bounds() {
        let exact = "a".repeat(255);
        assert!(AppIdField::encode(&exact).is_ok());
        assert!(validate_app_id(&exact).is_ok());
        let over = "a".repeat(256);
        assert_eq!(
            AppIdField::encode(&over).err(),
            Some(ValidationError::IdentifierTooLong { len: 256 })
        );
        assert_eq!(
            validate_app_id(""),
            Err(ValidationError::EmptyIdentifier)
        );
    }

    #[test]
    fn gain_validation_rejects_nan_and_out_of_range() {
        assert!(validate_gain(0.0).is_ok());
        assert!(validate_gain(1.0).is_ok());
        assert!(validate_gain(1.0001).is_err());
        assert!(validate_gain(-0.1).is_err());
        assert!(validate_gain(f32::NAN).is_err());
    }

    #[test]
    fn request_decodes_what_was_encoded() {
        let request = Request::RemoveGain {
            app_id: "org.mozilla.firefox".into(),
        };
        let frame = request.encode().unwrap();
        let decoded = read_request(&mut Cursor::new(frame)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn invalid_utf8_identifier_is_malformed() {
        let mut field = AppIdField::zeroed();
        field.len = 2;
        field.bytes[0] = 0xff;
        field.bytes[1] = 0xfe;
        let mut frame = vec![Opcode::GetGain as u8];
        frame.extend_from_slice(bytemuck::bytes_of(&field));
        assert!(matches!(
            read_request(&mut Cursor::new(frame)),
            Err(ProtocolError::InvalidIdentifier)
        ));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert!(matches!(
            read_request(&mut Cursor::new(vec![0x7f])),
            Err(ProtocolError::UnknownOpcode(0x7f))
        ));
    }

    #[test]
    fn snapshot_response_carries_every_entry() {
        let mut gains = HashMap::new();
        gains.insert("a".to_string(), 0.25);
        gains.insert("b".to_string(), 1.0);
        let frame = Response::Snapshot(gains.clone()).encode();
        assert_eq!(frame.len(), 1 + 4 + 2 * 260);
        let decoded = read_response(&mut Cursor::new(frame), Opcode::AllGains).unwrap();
        assert_eq!(decoded, Response::Snapshot(gains));
    }

    #[test]
    fn rejection_status_maps_to_error_code() {
        let frame = Response::Rejected(ErrorCode::ReadOnly).encode();
        let decoded = read_response(&mut Cursor::new(frame), Opcode::SetGain).unwrap();
        assert_eq!(decoded, Response::Rejected(ErrorCode::ReadOnly));
    }
}
