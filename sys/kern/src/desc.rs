// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The guest descriptor ABI.
//!
//! EPOC strings are counted, not terminated: the first word of a descriptor
//! packs a type tag (top four bits) and the current length (low 28 bits);
//! modifiable variants add a maximum length, and pointer variants indirect
//! to their payload. Narrow descriptors count 8-bit characters and wide
//! ones 16-bit, with the same header layout either way, so everything here
//! takes the width as a parameter rather than duplicating per width.
//!
//! Marshalling code is expected to come through the facade at the bottom
//! (`read_str8`/`read_str16`/`write_str8`/`write_str16`/`max_length`) and
//! pick the width from the argument flag word.

use byteorder::{ByteOrder, LittleEndian};

use crate::umem::{GuestAddr, GuestFault, GuestMem};

/// The five descriptor layouts, as encoded in the header's top four bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DesType {
    /// Constant buffer: payload follows the length word.
    BufC = 0,
    /// Constant pointer: payload address follows the length word.
    PtrC = 1,
    /// Modifiable pointer: max length, then payload address.
    Ptr = 2,
    /// Modifiable buffer: max length, then inline payload.
    Buf = 3,
    /// Modifiable handle on a heap `BufC`: max length, then its address.
    BufCPtr = 4,
}

impl DesType {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::BufC,
            1 => Self::PtrC,
            2 => Self::Ptr,
            3 => Self::Buf,
            4 => Self::BufCPtr,
            _ => return None,
        })
    }

    pub fn is_modifiable(self) -> bool {
        matches!(self, Self::Ptr | Self::Buf | Self::BufCPtr)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DesError {
    /// The alleged descriptor lives in memory the guest can't access.
    Fault(GuestFault),
    /// The header's type bits don't name a descriptor, or name one that
    /// can't do what was asked (writing through a constant, probing the
    /// capacity of something that has none).
    BadType,
    /// The payload doesn't fit the target's declared maximum.
    Overflow,
}

impl From<GuestFault> for DesError {
    fn from(f: GuestFault) -> Self {
        Self::Fault(f)
    }
}

const LEN_MASK: u32 = 0x0FFF_FFFF;

fn read_word(mem: &dyn GuestMem, addr: GuestAddr) -> Result<u32, DesError> {
    let mut buf = [0u8; 4];
    mem.read(addr, &mut buf)?;
    Ok(LittleEndian::read_u32(&buf))
}

fn write_word(
    mem: &mut dyn GuestMem,
    addr: GuestAddr,
    val: u32,
) -> Result<(), DesError> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, val);
    mem.write(addr, &buf)?;
    Ok(())
}

/// Decoded descriptor header: where the payload lives and how big it may
/// grow. Lengths are in characters of the descriptor's width.
#[derive(Copy, Clone, Debug)]
pub struct DesHeader {
    pub kind: DesType,
    pub len: u32,
    pub data: GuestAddr,
}

/// Reads and validates the header at `addr`.
pub fn read_header(
    mem: &dyn GuestMem,
    addr: GuestAddr,
) -> Result<DesHeader, DesError> {
    let word = read_word(mem, addr)?;
    let kind = DesType::from_raw(word >> 28).ok_or(DesError::BadType)?;
    let len = word & LEN_MASK;
    let data = match kind {
        DesType::BufC => addr + 4,
        DesType::PtrC => read_word(mem, addr + 4)?,
        DesType::Ptr => read_word(mem, addr + 8)?,
        DesType::Buf => addr + 8,
        DesType::BufCPtr => {
            // Payload sits past the heap buffer's own length word.
            read_word(mem, addr + 8)? + 4
        }
    };
    Ok(DesHeader { kind, len, data })
}

/// Reports the declared capacity of a modifiable descriptor, in characters.
/// Constant descriptors have no capacity word and yield `BadType`.
pub fn max_length(
    mem: &dyn GuestMem,
    addr: GuestAddr,
) -> Result<i32, DesError> {
    let header = read_header(mem, addr)?;
    if !header.kind.is_modifiable() {
        return Err(DesError::BadType);
    }
    Ok(read_word(mem, addr + 4)? as i32)
}

/// Reads the contents of a narrow descriptor.
pub fn read_str8(
    mem: &dyn GuestMem,
    addr: GuestAddr,
) -> Result<Vec<u8>, DesError> {
    let header = read_header(mem, addr)?;
    let mut buf = vec![0u8; header.len as usize];
    mem.read(header.data, &mut buf)?;
    Ok(buf)
}

/// Reads the contents of a wide descriptor.
pub fn read_str16(
    mem: &dyn GuestMem,
    addr: GuestAddr,
) -> Result<Vec<u16>, DesError> {
    let header = read_header(mem, addr)?;
    let mut buf = vec![0u8; header.len as usize * 2];
    mem.read(header.data, &mut buf)?;
    let mut out = vec![0u16; header.len as usize];
    LittleEndian::read_u16_into(&buf, &mut out);
    Ok(out)
}

fn write_payload(
    mem: &mut dyn GuestMem,
    addr: GuestAddr,
    data: &[u8],
    chars: u32,
) -> Result<(), DesError> {
    let header = read_header(mem, addr)?;
    if !header.kind.is_modifiable() {
        return Err(DesError::BadType);
    }
    let max = read_word(mem, addr + 4)?;
    if chars > max {
        return Err(DesError::Overflow);
    }
    mem.write(header.data, data)?;
    write_word(mem, addr, (header.kind as u32) << 28 | chars)?;
    if header.kind == DesType::BufCPtr {
        // Keep the backing heap buffer's own header consistent.
        write_word(mem, header.data - 4, (DesType::BufC as u32) << 28 | chars)?;
    }
    Ok(())
}

/// Replaces the contents of a modifiable narrow descriptor.
pub fn write_str8(
    mem: &mut dyn GuestMem,
    addr: GuestAddr,
    data: &[u8],
) -> Result<(), DesError> {
    write_payload(mem, addr, data, data.len() as u32)
}

/// Replaces the contents of a modifiable wide descriptor.
pub fn write_str16(
    mem: &mut dyn GuestMem,
    addr: GuestAddr,
    data: &[u16],
) -> Result<(), DesError> {
    let mut bytes = vec![0u8; data.len() * 2];
    LittleEndian::write_u16_into(data, &mut bytes);
    write_payload(mem, addr, &bytes, data.len() as u32)
}

/// Reads a narrow descriptor as host text, for names and log output.
pub fn read_text8(
    mem: &dyn GuestMem,
    addr: GuestAddr,
) -> Result<String, DesError> {
    let bytes = read_str8(mem, addr)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
