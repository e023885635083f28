//! XDR decoding.
//!
//! Only the cache path reads XDR: a cached DataDDX's blob is decoded back into
//! the variable tree its DDX part describes. The decoder therefore walks a
//! declared tree and fills values in, rather than discovering structure from
//! the bytes.

use std::io::{Error, ErrorKind, Read};

use dap_types::variable::{ArrayData, ScalarType, Value, Variable};

use super::{END_OF_SEQUENCE, START_OF_INSTANCE};

/// Reads XDR values from a source.
#[derive(Debug)]
pub struct XdrDecoder<R: Read> {
    src: R,
}

impl<R: Read> XdrDecoder<R> {
    pub fn new(src: R) -> Self {
        Self { src }
    }

    fn get4(&mut self) -> std::io::Result<[u8; 4]> {
        let mut buf = [0u8; 4];
        self.src.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn get_byte(&mut self) -> std::io::Result<u8> {
        Ok(self.get4()?[0])
    }

    pub fn get_int16(&mut self) -> std::io::Result<i16> {
        Ok(i32::from_be_bytes(self.get4()?) as i16)
    }

    pub fn get_uint16(&mut self) -> std::io::Result<u16> {
        Ok(u32::from_be_bytes(self.get4()?) as u16)
    }

    pub fn get_int32(&mut self) -> std::io::Result<i32> {
        Ok(i32::from_be_bytes(self.get4()?))
    }

    pub fn get_uint32(&mut self) -> std::io::Result<u32> {
        Ok(u32::from_be_bytes(self.get4()?))
    }

    pub fn get_float32(&mut self) -> std::io::Result<f32> {
        Ok(f32::from_be_bytes(self.get4()?))
    }

    pub fn get_float64(&mut self) -> std::io::Result<f64> {
        let mut buf = [0u8; 8];
        self.src.read_exact(&mut buf)?;
        Ok(f64::from_be_bytes(buf))
    }

    pub fn get_opaque(&mut self) -> std::io::Result<Vec<u8>> {
        let len = self.get_uint32()? as usize;
        let mut bytes = vec![0u8; len];
        self.src.read_exact(&mut bytes)?;

        let pad = (4 - len % 4) % 4;
        if pad > 0 {
            let mut skip = [0u8; 3];
            self.src.read_exact(&mut skip[..pad])?;
        }

        Ok(bytes)
    }

    pub fn get_string(&mut self) -> std::io::Result<String> {
        String::from_utf8(self.get_opaque()?)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "string is not valid UTF-8"))
    }

    /// Fill `var`'s value from the stream and mark it read.
    pub fn deserialize_variable(&mut self, var: &mut Variable) -> std::io::Result<()> {
        let value = std::mem::replace(&mut var.value, Value::Byte(None));
        var.value = self.decode_value(value)?;
        var.read = true;
        Ok(())
    }

    fn decode_value(&mut self, value: Value) -> std::io::Result<Value> {
        Ok(match value {
            Value::Byte(_) => Value::Byte(Some(self.get_byte()?)),
            Value::Int16(_) => Value::Int16(Some(self.get_int16()?)),
            Value::UInt16(_) => Value::UInt16(Some(self.get_uint16()?)),
            Value::Int32(_) => Value::Int32(Some(self.get_int32()?)),
            Value::UInt32(_) => Value::UInt32(Some(self.get_uint32()?)),
            Value::Float32(_) => Value::Float32(Some(self.get_float32()?)),
            Value::Float64(_) => Value::Float64(Some(self.get_float64()?)),
            Value::Str(_) => Value::Str(Some(self.get_string()?)),
            Value::Url(_) => Value::Url(Some(self.get_string()?)),
            Value::Array(mut arr) => {
                let count = self.get_uint32()? as usize;
                arr.data = Some(self.decode_array_data(arr.elem, count)?);
                Value::Array(arr)
            }
            Value::Structure(mut children) => {
                for child in &mut children {
                    self.deserialize_variable(child)?;
                }
                Value::Structure(children)
            }
            Value::Sequence(mut seq) => {
                loop {
                    match self.get_uint32()? {
                        START_OF_INSTANCE => {
                            let mut row = Vec::with_capacity(seq.fields.len());
                            for field in &seq.fields {
                                row.push(self.decode_value(field.value.clone())?);
                            }
                            seq.rows.push(row);
                        }
                        END_OF_SEQUENCE => break,
                        marker => {
                            return Err(Error::new(
                                ErrorKind::InvalidData,
                                format!("unexpected sequence marker {marker:#010x}"),
                            ));
                        }
                    }
                }
                Value::Sequence(seq)
            }
            Value::Grid(mut grid) => {
                self.deserialize_variable(&mut grid.array)?;
                for map in &mut grid.maps {
                    self.deserialize_variable(map)?;
                }
                Value::Grid(grid)
            }
        })
    }

    fn decode_array_data(&mut self, elem: ScalarType, count: usize) -> std::io::Result<ArrayData> {
        Ok(match elem {
            ScalarType::Byte => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_byte()?);
                }
                ArrayData::Byte(v)
            }
            ScalarType::Int16 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_int16()?);
                }
                ArrayData::Int16(v)
            }
            ScalarType::UInt16 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_uint16()?);
                }
                ArrayData::UInt16(v)
            }
            ScalarType::Int32 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_int32()?);
                }
                ArrayData::Int32(v)
            }
            ScalarType::UInt32 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_uint32()?);
                }
                ArrayData::UInt32(v)
            }
            ScalarType::Float32 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_float32()?);
                }
                ArrayData::Float32(v)
            }
            ScalarType::Float64 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_float64()?);
                }
                ArrayData::Float64(v)
            }
            ScalarType::Str => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_string()?);
                }
                ArrayData::Str(v)
            }
            ScalarType::Url => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(self.get_string()?);
                }
                ArrayData::Url(v)
            }
        })
    }
}
