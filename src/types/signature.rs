//! Compact signature encoding
//!
//! `[len][entry]*` where each entry is an optional `0x00 flags` escape
//! followed by a type index: one byte below 128, otherwise two bytes with
//! the high bit set carrying a 15-bit index.

use super::{ArgFlags, ModuleId, TypeRef};
use crate::error::CallError;

const ESCAPE: u8 = 0x00;
const WIDE: u8 = 0x80;
pub(crate) const MAX_INDEX: u16 = 0x7fff;

/// Forward-only reader over one signature blob
#[derive(Debug, Clone)]
pub struct SignatureCursor<'a> {
    module: ModuleId,
    bytes: &'a [u8],
    pos: usize,
    end: usize,
    entry: usize,
}

impl<'a> SignatureCursor<'a> {
    /// `blob` starts with the length byte
    pub fn new(module: ModuleId, blob: &'a [u8]) -> Result<Self, CallError> {
        let len = *blob
            .first()
            .ok_or_else(|| CallError::configuration("signature", "empty signature blob"))?
            as usize;
        if len + 1 > blob.len() {
            return Err(CallError::configuration(
                "signature",
                format!("length prefix {len} exceeds blob of {} bytes", blob.len()),
            ));
        }
        Ok(Self {
            module,
            bytes: blob,
            pos: 1,
            end: len + 1,
            entry: 0,
        })
    }

    /// Index of the entry the next `decode_next` returns; 0 is the return type
    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.end
    }

    /// Decode one entry and advance
    pub fn decode_next(&mut self) -> Result<Option<(TypeRef, ArgFlags)>, CallError> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let mut flags = ArgFlags::empty();
        let mut first = self.byte(self.pos)?;
        if first == ESCAPE {
            flags = ArgFlags::from_bits_retain(self.byte(self.pos + 1)?);
            self.pos += 2;
            first = self.byte(self.pos)?;
        }
        let index = if first & WIDE != 0 {
            let low = self.byte(self.pos + 1)?;
            self.pos += 2;
            (((first & !WIDE) as u16) << 8) | low as u16
        } else {
            self.pos += 1;
            first as u16
        };
        if index == 0 {
            return Err(CallError::configuration(
                "signature",
                format!("entry {} references reserved type index 0", self.entry),
            ));
        }
        self.entry += 1;
        Ok(Some((TypeRef::new(self.module, index), flags)))
    }

    fn byte(&self, at: usize) -> Result<u8, CallError> {
        if at >= self.end {
            return Err(CallError::configuration(
                "signature",
                format!("truncated at entry {}", self.entry),
            ));
        }
        Ok(self.bytes[at])
    }
}

/// Builds signature blobs
#[derive(Debug, Default, Clone)]
pub struct SignatureWriter {
    bytes: Vec<u8>,
}

impl SignatureWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u16, flags: ArgFlags) -> &mut Self {
        if !flags.is_empty() {
            self.bytes.push(ESCAPE);
            self.bytes.push(flags.bits());
        }
        if index < WIDE as u16 {
            self.bytes.push(index as u8);
        } else {
            self.bytes.push(WIDE | (index >> 8) as u8);
            self.bytes.push((index & 0xff) as u8);
        }
        self
    }

    /// Length-prefixed blob
    pub fn finish(&self) -> Result<Vec<u8>, CallError> {
        let len = u8::try_from(self.bytes.len()).map_err(|_| {
            CallError::configuration("signature", format!("{} bytes exceed 255", self.bytes.len()))
        })?;
        let mut blob = Vec::with_capacity(self.bytes.len() + 1);
        blob.push(len);
        blob.extend_from_slice(&self.bytes);
        Ok(blob)
    }
}
