//! Reference MessagePack codec.
//!
//! Implements the [`Encoder`]/[`Decoder`] collaborator traits over a byte
//! buffer. Integer encoding always picks the shortest representation
//! (matching what the `rmp` crate emits; the test suite uses `rmp` as an
//! independent oracle).

use crate::error::CodecError;
use crate::format::{Decoder, Encoder, WireKind};
use crate::value::Value;

pub struct MsgPackEncoder<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> MsgPackEncoder<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        MsgPackEncoder { out }
    }
}

impl Encoder for MsgPackEncoder<'_> {
    fn write_nil(&mut self) -> Result<(), CodecError> {
        self.out.push(0xc0);
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<(), CodecError> {
        self.out.push(if v { 0xc3 } else { 0xc2 });
        Ok(())
    }

    fn write_uint(&mut self, v: u64) -> Result<(), CodecError> {
        if v <= 0x7f {
            self.out.push(v as u8);
        } else if v <= u8::MAX as u64 {
            self.out.push(0xcc);
            self.out.push(v as u8);
        } else if v <= u16::MAX as u64 {
            self.out.push(0xcd);
            self.out.extend_from_slice(&(v as u16).to_be_bytes());
        } else if v <= u32::MAX as u64 {
            self.out.push(0xce);
            self.out.extend_from_slice(&(v as u32).to_be_bytes());
        } else {
            self.out.push(0xcf);
            self.out.extend_from_slice(&v.to_be_bytes());
        }
        Ok(())
    }

    fn write_int(&mut self, v: i64) -> Result<(), CodecError> {
        if v >= 0 {
            return self.write_uint(v as u64);
        }
        if v >= -32 {
            self.out.push(v as i8 as u8);
        } else if v >= i8::MIN as i64 {
            self.out.push(0xd0);
            self.out.push(v as i8 as u8);
        } else if v >= i16::MIN as i64 {
            self.out.push(0xd1);
            self.out.extend_from_slice(&(v as i16).to_be_bytes());
        } else if v >= i32::MIN as i64 {
            self.out.push(0xd2);
            self.out.extend_from_slice(&(v as i32).to_be_bytes());
        } else {
            self.out.push(0xd3);
            self.out.extend_from_slice(&v.to_be_bytes());
        }
        Ok(())
    }

    fn write_f32(&mut self, v: f32) -> Result<(), CodecError> {
        self.out.push(0xca);
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn write_f64(&mut self, v: f64) -> Result<(), CodecError> {
        self.out.push(0xcb);
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn write_str(&mut self, v: &str) -> Result<(), CodecError> {
        let len = v.len();
        if len <= 31 {
            self.out.push(0xa0 | len as u8);
        } else if len <= u8::MAX as usize {
            self.out.push(0xd9);
            self.out.push(len as u8);
        } else if len <= u16::MAX as usize {
            self.out.push(0xda);
            self.out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.out.push(0xdb);
            self.out.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.out.extend_from_slice(v.as_bytes());
        Ok(())
    }

    fn write_bin(&mut self, v: &[u8]) -> Result<(), CodecError> {
        let len = v.len();
        if len <= u8::MAX as usize {
            self.out.push(0xc4);
            self.out.push(len as u8);
        } else if len <= u16::MAX as usize {
            self.out.push(0xc5);
            self.out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.out.push(0xc6);
            self.out.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.out.extend_from_slice(v);
        Ok(())
    }

    fn write_array_header(&mut self, len: u32) -> Result<(), CodecError> {
        if len <= 15 {
            self.out.push(0x90 | len as u8);
        } else if len <= u16::MAX as u32 {
            self.out.push(0xdc);
            self.out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.out.push(0xdd);
            self.out.extend_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }

    fn write_map_header(&mut self, len: u32) -> Result<(), CodecError> {
        if len <= 15 {
            self.out.push(0x80 | len as u8);
        } else if len <= u16::MAX as u32 {
            self.out.push(0xde);
            self.out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.out.push(0xdf);
            self.out.extend_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }
}

pub struct MsgPackDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MsgPackDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        MsgPackDecoder { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Result<u8, CodecError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEof)
    }

    fn take(&mut self) -> Result<u8, CodecError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take_n(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take_n(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take_n(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take_n(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn str_len(&mut self, marker: u8) -> Result<Option<usize>, CodecError> {
        Ok(match marker {
            0xa0..=0xbf => Some((marker & 0x1f) as usize),
            0xd9 => Some(self.take()? as usize),
            0xda => Some(self.take_u16()? as usize),
            0xdb => Some(self.take_u32()? as usize),
            _ => None,
        })
    }

    /// Decode an integer item as i128 so both signed and unsigned reprs fit.
    fn read_integer(&mut self) -> Result<i128, CodecError> {
        let marker = self.take()?;
        Ok(match marker {
            0x00..=0x7f => marker as i128,
            0xe0..=0xff => marker as i8 as i128,
            0xcc => self.take()? as i128,
            0xcd => self.take_u16()? as i128,
            0xce => self.take_u32()? as i128,
            0xcf => self.take_u64()? as i128,
            0xd0 => self.take()? as i8 as i128,
            0xd1 => self.take_u16()? as i16 as i128,
            0xd2 => self.take_u32()? as i32 as i128,
            0xd3 => self.take_u64()? as i64 as i128,
            m => return Err(CodecError::InvalidMarker(m)),
        })
    }
}

impl Decoder for MsgPackDecoder<'_> {
    fn peek_kind(&mut self) -> Result<WireKind, CodecError> {
        Ok(match self.peek()? {
            0x90..=0x9f | 0xdc | 0xdd => WireKind::Array,
            0x80..=0x8f | 0xde | 0xdf => WireKind::Map,
            0xc0 => WireKind::Nil,
            _ => WireKind::Other,
        })
    }

    fn try_read_nil(&mut self) -> Result<bool, CodecError> {
        if self.peek()? == 0xc0 {
            self.pos += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.take()? {
            0xc2 => Ok(false),
            0xc3 => Ok(true),
            m => Err(CodecError::InvalidMarker(m)),
        }
    }

    fn read_int(&mut self) -> Result<i64, CodecError> {
        let v = self.read_integer()?;
        i64::try_from(v).map_err(|_| CodecError::NumberOutOfRange)
    }

    fn read_uint(&mut self) -> Result<u64, CodecError> {
        let v = self.read_integer()?;
        u64::try_from(v).map_err(|_| CodecError::NumberOutOfRange)
    }

    fn read_f32(&mut self) -> Result<f32, CodecError> {
        match self.take()? {
            0xca => {
                let b = self.take_n(4)?;
                Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            m => Err(CodecError::InvalidMarker(m)),
        }
    }

    fn read_f64(&mut self) -> Result<f64, CodecError> {
        match self.take()? {
            0xcb => {
                let b = self.take_n(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(f64::from_be_bytes(raw))
            }
            // Accept f32 where f64 was requested; the widening is lossless.
            0xca => {
                let b = self.take_n(4)?;
                Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64)
            }
            m => Err(CodecError::InvalidMarker(m)),
        }
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let marker = self.take()?;
        let len = self
            .str_len(marker)?
            .ok_or(CodecError::InvalidMarker(marker))?;
        let bytes = self.take_n(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_bin(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = match self.take()? {
            0xc4 => self.take()? as usize,
            0xc5 => self.take_u16()? as usize,
            0xc6 => self.take_u32()? as usize,
            m => return Err(CodecError::InvalidMarker(m)),
        };
        Ok(self.take_n(len)?.to_vec())
    }

    fn read_array_header(&mut self) -> Result<u32, CodecError> {
        match self.take()? {
            m @ 0x90..=0x9f => Ok((m & 0x0f) as u32),
            0xdc => Ok(self.take_u16()? as u32),
            0xdd => self.take_u32(),
            m => Err(CodecError::InvalidMarker(m)),
        }
    }

    fn read_map_header(&mut self) -> Result<u32, CodecError> {
        match self.take()? {
            m @ 0x80..=0x8f => Ok((m & 0x0f) as u32),
            0xde => Ok(self.take_u16()? as u32),
            0xdf => self.take_u32(),
            m => Err(CodecError::InvalidMarker(m)),
        }
    }

    fn read_value(&mut self) -> Result<Value, CodecError> {
        let marker = self.peek()?;
        Ok(match marker {
            0xc0 => {
                self.pos += 1;
                Value::Nil
            }
            0xc2 | 0xc3 => Value::Bool(self.read_bool()?),
            0x00..=0x7f | 0xcc..=0xcf => Value::Uint(self.read_uint()?),
            0xe0..=0xff | 0xd0..=0xd3 => Value::Int(self.read_int()?),
            0xca => Value::F32(self.read_f32()?),
            0xcb => Value::F64(self.read_f64()?),
            0xa0..=0xbf | 0xd9..=0xdb => Value::Str(self.read_str()?),
            0xc4..=0xc6 => Value::Bin(self.read_bin()?),
            0x90..=0x9f | 0xdc | 0xdd => {
                let len = self.read_array_header()? as usize;
                let mut items = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Value::Seq(items)
            }
            0x80..=0x8f | 0xde | 0xdf => {
                let len = self.read_map_header()? as usize;
                let mut pairs = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    let k = self.read_value()?;
                    let v = self.read_value()?;
                    pairs.push((k, v));
                }
                Value::Map(pairs)
            }
            m => return Err(CodecError::InvalidMarker(m)),
        })
    }
}
