// Licensed under the Apache-2.0 license

//! Token codec.
//!
//! Requests describe a transaction with a portable token vocabulary that is
//! independent of any controller. The list-processor hardware consumes a
//! packed list of 4-bit tokens: 16 slots split across two 32-bit registers,
//! plus 8 write-data lanes split the same way. This module translates between
//! the two, one hardware load ("chunk") at a time, and composes portable
//! streams for plain reads and writes.

/// Token-list slots available to one hardware load.
pub const TOKEN_SLOTS: usize = 16;
/// Data byte lanes available to one hardware load (either direction).
pub const DATA_LANES: usize = 8;

const TOKENS_PER_REG: usize = 8;
const LANES_PER_REG: usize = 4;

/// Portable token vocabulary, as it appears in request buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Token {
    End = 0x0,
    Start = 0x1,
    AddrWrite = 0x2,
    AddrRead = 0x3,
    Data = 0x4,
    DataEnd = 0x5,
    Stop = 0x6,
}

impl TryFrom<u8> for Token {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => Token::End,
            0x1 => Token::Start,
            0x2 => Token::AddrWrite,
            0x3 => Token::AddrRead,
            0x4 => Token::Data,
            0x5 => Token::DataEnd,
            0x6 => Token::Stop,
            other => return Err(DecodeError::InvalidToken(other)),
        })
    }
}

/// Hardware list-processor token encoding (4 bits).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HwToken {
    End = 0x0,
    Start = 0x1,
    SlaveAddrWrite = 0x2,
    SlaveAddrRead = 0x3,
    Data = 0x4,
    DataLast = 0x5,
    Stop = 0x6,
}

impl HwToken {
    /// Decode a 4-bit field; values the list processor never emits map to `None`.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & 0xF {
            0x0 => HwToken::End,
            0x1 => HwToken::Start,
            0x2 => HwToken::SlaveAddrWrite,
            0x3 => HwToken::SlaveAddrRead,
            0x4 => HwToken::Data,
            0x5 => HwToken::DataLast,
            0x6 => HwToken::Stop,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte in a token stream that is not a portable token.
    InvalidToken(u8),
    /// Write DATA token at the end of the stream without its data byte.
    MissingData,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// Composed stream would not fit the output buffer.
    TooLarge,
    /// Reads must transfer at least one byte.
    EmptyRead,
}

#[must_use]
pub const fn encode(token: Token) -> HwToken {
    match token {
        Token::End => HwToken::End,
        Token::Start => HwToken::Start,
        Token::AddrWrite => HwToken::SlaveAddrWrite,
        Token::AddrRead => HwToken::SlaveAddrRead,
        Token::Data => HwToken::Data,
        Token::DataEnd => HwToken::DataLast,
        Token::Stop => HwToken::Stop,
    }
}

#[must_use]
pub const fn decode(token: HwToken) -> Token {
    match token {
        HwToken::End => Token::End,
        HwToken::Start => Token::Start,
        HwToken::SlaveAddrWrite => Token::AddrWrite,
        HwToken::SlaveAddrRead => Token::AddrRead,
        HwToken::Data => Token::Data,
        HwToken::DataLast => Token::DataEnd,
        HwToken::Stop => Token::Stop,
    }
}

/// Transfer direction selected by the most recent address token.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Write,
    Read,
}

/// Contents of the two token-list registers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenList {
    words: [u32; 2],
}

impl TokenList {
    #[must_use]
    pub const fn from_words(low: u32, high: u32) -> Self {
        Self {
            words: [low, high],
        }
    }

    /// `(token_list0, token_list1)` register values.
    #[must_use]
    pub const fn words(&self) -> (u32, u32) {
        let [low, high] = self.words;
        (low, high)
    }

    pub fn set(&mut self, slot: usize, token: HwToken) {
        let shift = (slot % TOKENS_PER_REG) * 4;
        if let Some(word) = self.words.get_mut(slot / TOKENS_PER_REG) {
            *word = (*word & !(0xF << shift)) | (token.bits() << shift);
        }
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<HwToken> {
        let word = self.words.get(slot / TOKENS_PER_REG)?;
        HwToken::from_bits(word >> ((slot % TOKENS_PER_REG) * 4))
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<HwToken>> + '_ {
        (0..TOKEN_SLOTS).map(|slot| self.get(slot))
    }
}

/// Contents of a pair of data registers (write or read), byte lanes in
/// register order: lanes 0..4 in the low register, 4..8 in the high one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DataLanes {
    words: [u32; 2],
}

impl DataLanes {
    #[must_use]
    pub const fn from_words(low: u32, high: u32) -> Self {
        Self {
            words: [low, high],
        }
    }

    #[must_use]
    pub const fn words(&self) -> (u32, u32) {
        let [low, high] = self.words;
        (low, high)
    }

    pub fn set(&mut self, lane: usize, byte: u8) {
        let shift = (lane % LANES_PER_REG) * 8;
        if let Some(word) = self.words.get_mut(lane / LANES_PER_REG) {
            *word = (*word & !(0xFF << shift)) | (u32::from(byte) << shift);
        }
    }

    #[must_use]
    pub fn get(&self, lane: usize) -> Option<u8> {
        let word = self.words.get(lane / LANES_PER_REG)?;
        Some((word >> ((lane % LANES_PER_REG) * 8)) as u8)
    }

    /// Copy the first `out.len()` lanes into `out`.
    pub fn copy_to(&self, out: &mut [u8]) {
        for (lane, byte) in out.iter_mut().take(DATA_LANES).enumerate() {
            *byte = self.get(lane).unwrap_or(0);
        }
    }
}

/// One hardware load translated from a slice of a token stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub tokens: TokenList,
    pub write_data: DataLanes,
    /// Stream bytes (tokens plus inline data) this load consumed.
    pub consumed: usize,
    /// Direction in effect after the load; carried into the next chunk.
    pub direction: Direction,
}

/// Translate as much of `stream[start..]` as one hardware load can hold.
///
/// A load stops when all token slots are filled or all data lanes are used;
/// unused token slots are padded with [`HwToken::End`].
///
/// # Errors
///
/// Fails on a byte that is not a portable token, or on a write DATA token
/// whose inline byte is missing.
pub fn load_chunk(stream: &[u8], start: usize, direction: Direction) -> Result<Chunk, DecodeError> {
    let mut chunk = Chunk {
        direction,
        ..Chunk::default()
    };
    let mut pos = start;
    let mut slot = 0;
    let mut lanes = 0;

    while slot < TOKEN_SLOTS && lanes < DATA_LANES {
        let Some(&byte) = stream.get(pos) else {
            break;
        };
        let token = Token::try_from(byte)?;
        match token {
            Token::AddrWrite => chunk.direction = Direction::Write,
            Token::AddrRead => chunk.direction = Direction::Read,
            _ => {}
        }
        chunk.tokens.set(slot, encode(token));
        slot += 1;

        match (token, chunk.direction) {
            (Token::Data, Direction::Write) => {
                let data = *stream.get(pos + 1).ok_or(DecodeError::MissingData)?;
                chunk.write_data.set(lanes, data);
                lanes += 1;
                pos += 1;
            }
            (Token::Data | Token::DataEnd, Direction::Read) => lanes += 1,
            _ => {}
        }
        pos += 1;
    }

    while slot < TOKEN_SLOTS {
        chunk.tokens.set(slot, HwToken::End);
        slot += 1;
    }
    chunk.consumed = pos.min(stream.len()).saturating_sub(start);
    Ok(chunk)
}

/// A plain transfer a client asks for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transfer<'a> {
    Write(&'a [u8]),
    /// Read this many bytes.
    Read(usize),
}

/// Stream length [`compose_stream`] would produce.
#[must_use]
pub const fn stream_len(transfer: Transfer<'_>) -> usize {
    // Address token and terminator, plus DATA/byte pairs or one token per read byte.
    match transfer {
        Transfer::Write(data) => 2 + 2 * data.len(),
        Transfer::Read(len) => 2 + len,
    }
}

/// Compose the portable token stream for `transfer` into `out`.
///
/// Writes are `ADDRW (DATA byte)* STOP`; reads are
/// `ADDRR DATA* DATA_END STOP`. A continued transfer ends with `END`
/// instead of `STOP`, leaving the bus held for the request that follows.
///
/// # Errors
///
/// [`StreamError::EmptyRead`] for zero-length reads,
/// [`StreamError::TooLarge`] when `out` cannot hold the stream.
pub fn compose_stream(
    transfer: Transfer<'_>,
    continued: bool,
    out: &mut [u8],
) -> Result<usize, StreamError> {
    let len = match transfer {
        Transfer::Write(data) => return compose_write(core::iter::once(data), continued, out),
        Transfer::Read(0) => return Err(StreamError::EmptyRead),
        Transfer::Read(_) => stream_len(transfer),
    };
    let (first, body) = frame(out, len, continued)?;
    *first = Token::AddrRead as u8;
    body.fill(Token::Data as u8);
    if let Some(end) = body.last_mut() {
        *end = Token::DataEnd as u8;
    }
    Ok(len)
}

/// Compose one write whose payload is `parts` concatenated.
///
/// # Errors
///
/// [`StreamError::TooLarge`] when `out` cannot hold the stream.
pub fn compose_write<'a, I>(parts: I, continued: bool, out: &mut [u8]) -> Result<usize, StreamError>
where
    I: IntoIterator<Item = &'a [u8]>,
    I::IntoIter: Clone,
{
    let parts = parts.into_iter();
    let payload: usize = parts.clone().map(<[u8]>::len).sum();
    let len = stream_len(Transfer::Write(&[])) + 2 * payload;
    let (first, body) = frame(out, len, continued)?;
    *first = Token::AddrWrite as u8;
    for (pair, byte) in body.chunks_exact_mut(2).zip(parts.flatten()) {
        pair.copy_from_slice(&[Token::Data as u8, *byte]);
    }
    Ok(len)
}

/// Cut `len` bytes off `out` and write the terminator; returns the leading
/// address byte and the body between it and the terminator.
fn frame(out: &mut [u8], len: usize, continued: bool) -> Result<(&mut u8, &mut [u8]), StreamError> {
    let out = out.get_mut(..len).ok_or(StreamError::TooLarge)?;
    let (first, rest) = out.split_first_mut().ok_or(StreamError::TooLarge)?;
    let (last, body) = rest.split_last_mut().ok_or(StreamError::TooLarge)?;
    *last = if continued {
        Token::End as u8
    } else {
        Token::Stop as u8
    };
    Ok((first, body))
}

/// Bytes a stream reads from the bus: its DATA and DATA_END tokens in read
/// direction.
///
/// # Errors
///
/// As [`load_chunk`].
pub fn read_len(stream: &[u8]) -> Result<usize, DecodeError> {
    let mut direction = Direction::Write;
    let mut pos = 0;
    let mut count = 0;
    while let Some(&byte) = stream.get(pos) {
        match (Token::try_from(byte)?, direction) {
            (Token::AddrWrite, _) => direction = Direction::Write,
            (Token::AddrRead, _) => direction = Direction::Read,
            (Token::Data, Direction::Write) => {
                if pos + 1 >= stream.len() {
                    return Err(DecodeError::MissingData);
                }
                pos += 1;
            }
            (Token::Data | Token::DataEnd, Direction::Read) => count += 1,
            _ => {}
        }
        pos += 1;
    }
    Ok(count)
}
