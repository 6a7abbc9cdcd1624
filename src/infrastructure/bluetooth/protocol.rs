//! Joy-Con 2 Protocol
//!
//! Wire formats for the controller halves: input report decoding, the
//! command frames sent to the firmware and the replies it sends back.

use crate::domain::buttons::ButtonSet;
use crate::domain::mapper::{FactoryStick, FactoryStickBlock};
use crate::domain::models::{AxisPair, InputReport, StickRaw, STICK_NEUTRAL};
use thiserror::Error;

/// Optional framing byte some transports put in front of a notification
pub const NOTIFICATION_PREFIX: u8 = 0xA1;

/// First byte of a command reply frame (checked before prefix stripping)
pub const COMMAND_REPLY_MARKER: u8 = 0x21;

/// Length of a full input report as sent by the firmware
pub const INPUT_REPORT_LEN: usize = 63;

/// Bytes needed to extract buttons and both sticks
pub const MIN_INPUT_REPORT_LEN: usize = 16;

pub const BUTTONS_OFFSET: usize = 4;
pub const STICKS_OFFSET: usize = 10;

/// Raw axis value meaning "this stick slot does not exist on this half"
pub const STICK_UNUSED_SENTINEL: u16 = 0x0FFF;

/// Output frame types
pub const FRAME_SUBCOMMAND: u8 = 0x01;
pub const FRAME_RUMBLE: u8 = 0x10;

pub const SUBCOMMAND_FRAME_LEN: usize = 49;
pub const RUMBLE_FRAME_LEN: usize = 10;

const RUMBLE_OFFSET: usize = 2;
const SUBCOMMAND_ID_OFFSET: usize = 10;
const SEQUENCE_OFFSET: usize = 11;
const ARGS_OFFSET: usize = 12;
const MAX_ARGS_LEN: usize = SUBCOMMAND_FRAME_LEN - ARGS_OFFSET;

pub mod subcommand {
    /// Read a block of the controller's configuration flash
    pub const FLASH_READ: u8 = 0x10;
    /// Set the player indicator lights
    pub const SET_PLAYER_INDICATOR: u8 = 0x30;
}

/// Factory stick calibration lives in one 18-byte flash block
pub const FACTORY_STICK_CALIBRATION_ADDR: u32 = 0x603D;
pub const FACTORY_STICK_CALIBRATION_LEN: u8 = 18;

/// Reply frame layout
const REPLY_SEQUENCE_OFFSET: usize = 1;
const REPLY_ACK_OFFSET: usize = 2;
const REPLY_SUBCOMMAND_OFFSET: usize = 3;
const REPLY_DATA_OFFSET: usize = 4;
const REPLY_ACK_BIT: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("report too short: {len} bytes (need 16)")]
    TooShort { len: usize },
    #[error("reply frame too short: {len} bytes")]
    ReplyTooShort { len: usize },
    #[error("not a command reply frame")]
    NotAReply,
    #[error("calibration block too short: {len} bytes")]
    CalibrationTooShort { len: usize },
}

/// What a notification turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    /// Firmware reply to a command; routed to the command queue
    Reply(&'a [u8]),
    /// Input report with any framing prefix already removed
    Input(&'a [u8]),
}

/// Split notifications into command replies and input reports
pub fn classify(bytes: &[u8]) -> InboundFrame<'_> {
    match bytes.first() {
        Some(&COMMAND_REPLY_MARKER) => InboundFrame::Reply(bytes),
        Some(&NOTIFICATION_PREFIX) => InboundFrame::Input(&bytes[1..]),
        _ => InboundFrame::Input(bytes),
    }
}

/// Unpack one three-byte stick field into two 12-bit values
pub fn unpack_stick_pair(bytes: [u8; 3]) -> (u16, u16) {
    let a = bytes[0] as u16 | ((bytes[1] as u16 & 0x0F) << 8);
    let b = (bytes[1] as u16 >> 4) | ((bytes[2] as u16) << 4);
    (a, b)
}

/// Inverse of [`unpack_stick_pair`]; values are truncated to 12 bits
pub fn pack_stick_pair(a: u16, b: u16) -> [u8; 3] {
    let a = a & 0x0FFF;
    let b = b & 0x0FFF;
    [
        (a & 0xFF) as u8,
        ((a >> 8) as u8) | (((b & 0x0F) as u8) << 4),
        (b >> 4) as u8,
    ]
}

/// Decode an input report (prefix already stripped by [`classify`])
///
/// # Input Report Structure
///
/// ```text
/// [0-3]   : Packet counter (ignored)
/// [4-7]   : Button word (u32 little-endian)
/// [8-9]   : Reserved
/// [10-12] : Left stick  (two packed 12-bit values)
/// [13-15] : Right stick (two packed 12-bit values)
/// [16-62] : Motion and status data (ignored)
/// ```
pub fn decode_input_report(bytes: &[u8]) -> Result<InputReport, DecodeError> {
    let Some(head) = bytes.get(..MIN_INPUT_REPORT_LEN) else {
        return Err(DecodeError::TooShort { len: bytes.len() });
    };

    let word = u32::from_le_bytes([
        head[BUTTONS_OFFSET],
        head[BUTTONS_OFFSET + 1],
        head[BUTTONS_OFFSET + 2],
        head[BUTTONS_OFFSET + 3],
    ]);

    let s = STICKS_OFFSET;
    let (left, left_unused) = decode_slot([head[s], head[s + 1], head[s + 2]]);
    let (right, right_unused) = decode_slot([head[s + 3], head[s + 4], head[s + 5]]);

    Ok(InputReport {
        buttons: ButtonSet::from_bits_truncate(word),
        sticks: StickRaw { left, right },
        left_slot_unused: left_unused,
        right_slot_unused: right_unused,
    })
}

fn decode_slot(field: [u8; 3]) -> (AxisPair, bool) {
    let (x, y) = unpack_stick_pair(field);
    let unused = x == STICK_UNUSED_SENTINEL || y == STICK_UNUSED_SENTINEL;
    let clean = |v: u16| {
        if v == STICK_UNUSED_SENTINEL {
            STICK_NEUTRAL
        } else {
            v
        }
    };
    (AxisPair::new(clean(x), clean(y)), unused)
}

/// Eight bytes of rumble data, four per motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleData(pub [u8; 8]);

impl RumbleData {
    /// Motors idle
    pub const NEUTRAL: RumbleData = RumbleData([0x00, 0x01, 0x40, 0x40, 0x00, 0x01, 0x40, 0x40]);

    /// Encode a plain strength in `0.0..=1.0` at the default frequencies.
    ///
    /// This layout is borrowed from the previous controller generation and
    /// has not been confirmed on this hardware.
    pub fn from_strength(strength: f32) -> Self {
        let amp = (strength.clamp(0.0, 1.0) * 100.0).round() as u8;
        let motor = encode_motor(amp);
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&motor);
        bytes[4..].copy_from_slice(&motor);
        RumbleData(bytes)
    }
}

impl Default for RumbleData {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

// High band fixed at code 0x40, low band at 0x80; only amplitude varies.
fn encode_motor(amp: u8) -> [u8; 4] {
    let hf: u16 = 0x40 * 4;
    let hf_amp = amp.wrapping_mul(2);
    let lf: u8 = 0x80 - 0x40;
    let mut lf_amp: u16 = (amp / 2) as u16 + 64;
    if amp % 2 == 1 {
        lf_amp += 0x8000;
    }
    [
        (hf & 0xFF) as u8,
        hf_amp.wrapping_add((hf >> 8) as u8),
        lf.wrapping_add((lf_amp >> 8) as u8),
        (lf_amp & 0xFF) as u8,
    ]
}

/// Build a subcommand frame.
///
/// # Subcommand Frame Structure (49 bytes)
///
/// ```text
/// [0]     : 0x01 (frame type)
/// [1]     : Rolling sub-sequence nibble (0x0-0xF)
/// [2-9]   : Rumble data (neutral)
/// [10]    : Subcommand id
/// [11]    : Sequence number echoed by the reply
/// [12-48] : Arguments, zero padded
/// ```
pub fn build_subcommand_frame(nibble: u8, sequence: u8, subcommand: u8, args: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; SUBCOMMAND_FRAME_LEN];
    frame[0] = FRAME_SUBCOMMAND;
    frame[1] = nibble & 0x0F;
    frame[RUMBLE_OFFSET..RUMBLE_OFFSET + 8].copy_from_slice(&RumbleData::NEUTRAL.0);
    frame[SUBCOMMAND_ID_OFFSET] = subcommand;
    frame[SEQUENCE_OFFSET] = sequence;
    let len = args.len().min(MAX_ARGS_LEN);
    frame[ARGS_OFFSET..ARGS_OFFSET + len].copy_from_slice(&args[..len]);
    frame
}

/// Build a rumble-only frame; with [`RumbleData::NEUTRAL`] this is the keep-alive
pub fn build_rumble_frame(nibble: u8, rumble: RumbleData) -> Vec<u8> {
    let mut frame = vec![0u8; RUMBLE_FRAME_LEN];
    frame[0] = FRAME_RUMBLE;
    frame[1] = nibble & 0x0F;
    frame[RUMBLE_OFFSET..RUMBLE_OFFSET + 8].copy_from_slice(&rumble.0);
    frame
}

/// Argument bytes for [`subcommand::FLASH_READ`]
pub fn flash_read_args(address: u32, len: u8) -> [u8; 5] {
    let a = address.to_le_bytes();
    [a[0], a[1], a[2], a[3], len]
}

/// Light pattern for player `n` (1-4); out of range values clamp
pub fn player_indicator_pattern(player: u8) -> u8 {
    match player {
        0 | 1 => 0b0001,
        2 => 0b0011,
        3 => 0b0111,
        _ => 0b1111,
    }
}

/// Parsed firmware reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub sequence: u8,
    pub accepted: bool,
    pub subcommand: u8,
    pub data: Vec<u8>,
}

/// Parse a reply frame.
///
/// ```text
/// [0]  : 0x21 (reply marker)
/// [1]  : Sequence number of the command being answered
/// [2]  : Ack byte, bit 7 set when the command was accepted
/// [3]  : Subcommand id
/// [4-] : Reply data
/// ```
pub fn parse_reply(bytes: &[u8]) -> Result<CommandReply, DecodeError> {
    if bytes.first() != Some(&COMMAND_REPLY_MARKER) {
        return Err(DecodeError::NotAReply);
    }
    if bytes.len() < REPLY_DATA_OFFSET {
        return Err(DecodeError::ReplyTooShort { len: bytes.len() });
    }
    Ok(CommandReply {
        sequence: bytes[REPLY_SEQUENCE_OFFSET],
        accepted: bytes[REPLY_ACK_OFFSET] & REPLY_ACK_BIT != 0,
        subcommand: bytes[REPLY_SUBCOMMAND_OFFSET],
        data: bytes[REPLY_DATA_OFFSET..].to_vec(),
    })
}

/// Build a reply frame the way the firmware does. Used by the replay
/// transport and tests.
pub fn build_reply_frame(sequence: u8, accepted: bool, subcommand: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REPLY_DATA_OFFSET + data.len());
    frame.push(COMMAND_REPLY_MARKER);
    frame.push(sequence);
    frame.push(if accepted { REPLY_ACK_BIT } else { 0x00 });
    frame.push(subcommand);
    frame.extend_from_slice(data);
    frame
}

/// Sequence number of an outbound subcommand frame, if it is one
pub fn frame_sequence(frame: &[u8]) -> Option<(u8, u8)> {
    if frame.first() != Some(&FRAME_SUBCOMMAND) {
        return None;
    }
    Some((*frame.get(SUBCOMMAND_ID_OFFSET)?, *frame.get(SEQUENCE_OFFSET)?))
}

/// Zero-padded argument area of an outbound subcommand frame
pub fn subcommand_args(frame: &[u8]) -> &[u8] {
    frame.get(ARGS_OFFSET..).unwrap_or(&[])
}

/// Decode the 18-byte factory calibration block.
///
/// The flash-read reply echoes address (4 bytes) and length (1 byte)
/// before the block itself; pass only the block.
///
/// ```text
/// [0-8]  : left stick  = above(x,y) center(x,y) below(x,y)
/// [9-17] : right stick = center(x,y) below(x,y) above(x,y)
/// ```
pub fn decode_factory_stick_block(block: &[u8]) -> Result<FactoryStickBlock, DecodeError> {
    let Some(block) = block.get(..FACTORY_STICK_CALIBRATION_LEN as usize) else {
        return Err(DecodeError::CalibrationTooShort { len: block.len() });
    };
    let pair = |i: usize| unpack_stick_pair([block[i], block[i + 1], block[i + 2]]);

    let left = FactoryStick {
        above: pair(0),
        center: pair(3),
        below: pair(6),
    };
    let right = FactoryStick {
        center: pair(9),
        below: pair(12),
        above: pair(15),
    };
    Ok(FactoryStickBlock { left, right })
}

/// Strip the address/length echo from a flash-read reply
pub fn flash_read_payload(data: &[u8]) -> &[u8] {
    data.get(5..).unwrap_or(&[])
}
