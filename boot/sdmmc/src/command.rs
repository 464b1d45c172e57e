//! Command requests and responses
//!
//! A [`CommandRequest`] describes one bus transaction before it is handed to
//! the engine; a [`Response`] is what came back, tagged with the shape it was
//! decoded as so that callers can only read the fields that shape carries.

use crate::card::CardStatus;
use crate::error::{SdError, SdResult};

/// Default per-command timeout budget (1 s)
pub const DEFAULT_COMMAND_TIMEOUT_US: u64 = 1_000_000;

// =============================================================================
// COMMAND CLASSIFICATION
// =============================================================================

/// Command type as defined by the bus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Broadcast, no response
    Bc,
    /// Broadcast with response
    Bcr,
    /// Addressed, no data
    Ac,
    /// Addressed with data transfer
    Adtc,
}

/// The nine standard response shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Normal response (card status)
    R1,
    /// R1 with busy signalling on DAT0
    R1b,
    /// CID/CSD register (136-bit)
    R2,
    /// OCR register
    R3,
    /// Fast I/O (eMMC) / I/O OCR (SDIO)
    R4,
    /// Interrupt request (eMMC) / I/O RW (SDIO)
    R5,
    /// R5 with busy
    R5b,
    /// Published RCA
    R6,
    /// Interface condition
    R7,
}

impl ResponseShape {
    /// Shapes that hold the data line busy after the response
    pub const fn is_busy(self) -> bool {
        matches!(self, ResponseShape::R1b | ResponseShape::R5b)
    }

    /// Response type, CRC check and index check bits of the command register
    pub const fn register_bits(self) -> u16 {
        match self {
            ResponseShape::R1 | ResponseShape::R5 | ResponseShape::R6 | ResponseShape::R7 => 0x1A,
            ResponseShape::R2 => 0x09,
            ResponseShape::R3 | ResponseShape::R4 => 0x02,
            ResponseShape::R1b | ResponseShape::R5b => 0x1B,
        }
    }
}

/// Data present select bit of the command register
const DATA_PRESENT: u16 = 1 << 5;

/// Pack the command register value
///
/// Broadcast commands without response never carry response bits.
pub const fn command_register(
    index: u8,
    class: CommandClass,
    response: Option<ResponseShape>,
) -> u16 {
    let mut value = (index as u16 & 0x3F) << 8;
    if matches!(class, CommandClass::Adtc) {
        value |= DATA_PRESENT;
    }
    if !matches!(class, CommandClass::Bc) {
        if let Some(shape) = response {
            value |= shape.register_bits();
        }
    }
    value
}

// =============================================================================
// REQUEST
// =============================================================================

/// Data phase of a request
#[derive(Debug, Default)]
pub enum DataBuffer<'a> {
    /// No data phase
    #[default]
    None,
    /// Card to host
    Read(&'a mut [u8]),
    /// Host to card
    Write(&'a [u8]),
}

impl DataBuffer<'_> {
    /// Length of the data phase in bytes
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Read(buf) => buf.len(),
            DataBuffer::Write(buf) => buf.len(),
        }
    }

    /// True when there is no data phase
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host address of the buffer
    pub fn host_address(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Read(buf) => buf.as_ptr() as usize,
            DataBuffer::Write(buf) => buf.as_ptr() as usize,
        }
    }

    /// Card to host transfer
    pub fn is_read(&self) -> bool {
        matches!(self, DataBuffer::Read(_))
    }
}

/// One bus transaction
#[derive(Debug)]
pub struct CommandRequest<'a> {
    /// Command index (0..=63)
    pub index: u8,
    /// Command type
    pub class: CommandClass,
    /// Expected response (None for broadcast without response)
    pub response: Option<ResponseShape>,
    /// Argument word
    pub argument: u32,
    /// Data phase
    pub data: DataBuffer<'a>,
    /// Timeout budget in microseconds (0 = wait forever)
    pub timeout_us: u64,
}

impl<'a> CommandRequest<'a> {
    /// Create a request with a zero argument and no data
    pub fn new(index: u8, class: CommandClass, response: Option<ResponseShape>) -> Self {
        Self {
            index,
            class,
            response,
            argument: 0,
            data: DataBuffer::None,
            timeout_us: DEFAULT_COMMAND_TIMEOUT_US,
        }
    }

    /// Broadcast command without response
    pub fn bc(index: u8) -> Self {
        Self::new(index, CommandClass::Bc, None)
    }

    /// Broadcast command with response
    pub fn bcr(index: u8, response: ResponseShape) -> Self {
        Self::new(index, CommandClass::Bcr, Some(response))
    }

    /// Addressed command without data
    pub fn ac(index: u8, response: ResponseShape) -> Self {
        Self::new(index, CommandClass::Ac, Some(response))
    }

    /// Addressed data transfer command
    pub fn adtc(index: u8, response: ResponseShape) -> Self {
        Self::new(index, CommandClass::Adtc, Some(response))
    }

    /// Set the argument word
    pub fn with_argument(mut self, argument: u32) -> Self {
        self.argument = argument;
        self
    }

    /// Attach a card-to-host buffer
    pub fn with_read(mut self, buffer: &'a mut [u8]) -> Self {
        self.data = DataBuffer::Read(buffer);
        self
    }

    /// Attach a host-to-card buffer
    pub fn with_write(mut self, buffer: &'a [u8]) -> Self {
        self.data = DataBuffer::Write(buffer);
        self
    }

    /// Override the timeout budget
    pub fn with_timeout(mut self, timeout_us: u64) -> Self {
        self.timeout_us = timeout_us;
        self
    }

    /// Both the command and the data line must be idle before submission
    pub fn needs_data_line(&self) -> bool {
        self.class == CommandClass::Adtc || self.response.is_some_and(ResponseShape::is_busy)
    }

    /// Check class, response and data phase agree
    pub fn validate(&self) -> SdResult<()> {
        if self.index > 63 {
            return Err(SdError::InvalidArgument);
        }
        match (self.class, self.response) {
            (CommandClass::Bc, Some(_)) => return Err(SdError::InvalidArgument),
            (CommandClass::Bcr | CommandClass::Ac | CommandClass::Adtc, None) => {
                return Err(SdError::InvalidArgument)
            }
            _ => {}
        }
        let has_data = !matches!(self.data, DataBuffer::None);
        match self.class {
            CommandClass::Adtc if !has_data || self.data.is_empty() => {
                Err(SdError::InvalidArgument)
            }
            CommandClass::Bc | CommandClass::Bcr | CommandClass::Ac if has_data => {
                Err(SdError::InvalidArgument)
            }
            _ => Ok(()),
        }
    }

    /// Packed command register value
    pub fn register_value(&self) -> u16 {
        command_register(self.index, self.class, self.response)
    }
}

// =============================================================================
// RESPONSE
// =============================================================================

/// Decoded response, validated against its shape once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Broadcast command, nothing returned
    None,
    /// 48-bit response: one 32-bit payload word
    Short {
        /// Shape the word was decoded as
        shape: ResponseShape,
        /// Payload (bits 39:8 of the response token)
        word: u32,
    },
    /// 136-bit response: register bits 127:8 in four words
    Long([u32; 4]),
}

impl Response {
    /// Build from the four response registers
    pub const fn from_words(response: Option<ResponseShape>, words: [u32; 4]) -> Self {
        match response {
            None => Response::None,
            Some(ResponseShape::R2) => Response::Long(words),
            Some(shape) => Response::Short { shape, word: words[0] },
        }
    }

    /// Shape of this response
    pub const fn shape(&self) -> Option<ResponseShape> {
        match self {
            Response::None => None,
            Response::Short { shape, .. } => Some(*shape),
            Response::Long(_) => Some(ResponseShape::R2),
        }
    }

    fn short(&self, accepted: &[ResponseShape]) -> SdResult<u32> {
        match self {
            Response::Short { shape, word } if accepted.contains(shape) => Ok(*word),
            _ => Err(SdError::InvalidArgument),
        }
    }

    /// Card status from R1/R1b
    pub fn card_status(&self) -> SdResult<CardStatus> {
        self.short(&[ResponseShape::R1, ResponseShape::R1b]).map(CardStatus)
    }

    /// OCR from R3/R4
    pub fn ocr(&self) -> SdResult<u32> {
        self.short(&[ResponseShape::R3, ResponseShape::R4])
    }

    /// Relative card address published in R6
    pub fn published_rca(&self) -> SdResult<u16> {
        self.short(&[ResponseShape::R6]).map(|word| (word >> 16) as u16)
    }

    /// Interface condition echo from R7
    pub fn interface_condition(&self) -> SdResult<u32> {
        self.short(&[ResponseShape::R7])
    }

    /// Little-endian image of a CID/CSD register from R2
    ///
    /// Byte 0 (the CRC slot) is left zero.
    pub fn register_image(&self) -> SdResult<[u8; 16]> {
        match self {
            Response::Long(words) => {
                let mut bytes = [0u8; 16];
                for (i, word) in words.iter().enumerate() {
                    bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
                }
                let mut image = [0u8; 16];
                image[1..].copy_from_slice(&bytes[..15]);
                Ok(image)
            }
            _ => Err(SdError::InvalidArgument),
        }
    }
}
