//! XDR encoding of typed values.
//!
//! Primitives are staged in a small buffer and written whole, so a failing
//! sink never leaves a partial primitive on the wire. Aggregates stream
//! element by element; nothing is buffered beyond one primitive.

use std::io::Write;

use dap_types::DapError;
use dap_types::variable::{ScalarValue, SequenceValue, Value, Variable};

use super::{END_OF_SEQUENCE, START_OF_INSTANCE};
use crate::ce::ConstraintEvaluator;

/// Streams values onto a sink in XDR form.
#[derive(Debug)]
pub struct XdrEncoder<W: Write> {
    sink: W,
}

impl<W: Write> XdrEncoder<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    /// One byte, padded out to the four-byte unit.
    pub fn put_byte(&mut self, value: u8) -> std::io::Result<()> {
        self.sink.write_all(&[value, 0, 0, 0])
    }

    pub fn put_int16(&mut self, value: i16) -> std::io::Result<()> {
        self.sink.write_all(&i32::from(value).to_be_bytes())
    }

    pub fn put_uint16(&mut self, value: u16) -> std::io::Result<()> {
        self.sink.write_all(&u32::from(value).to_be_bytes())
    }

    pub fn put_int32(&mut self, value: i32) -> std::io::Result<()> {
        self.sink.write_all(&value.to_be_bytes())
    }

    pub fn put_uint32(&mut self, value: u32) -> std::io::Result<()> {
        self.sink.write_all(&value.to_be_bytes())
    }

    pub fn put_float32(&mut self, value: f32) -> std::io::Result<()> {
        self.sink.write_all(&value.to_be_bytes())
    }

    pub fn put_float64(&mut self, value: f64) -> std::io::Result<()> {
        self.sink.write_all(&value.to_be_bytes())
    }

    /// Length-prefixed bytes, zero-padded to the four-byte unit.
    pub fn put_opaque(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.put_uint32(bytes.len() as u32)?;
        self.sink.write_all(bytes)?;

        let pad = (4 - bytes.len() % 4) % 4;
        if pad > 0 {
            self.sink.write_all(&[0u8; 3][..pad])?;
        }

        Ok(())
    }

    pub fn put_string(&mut self, value: &str) -> std::io::Result<()> {
        self.put_opaque(value.as_bytes())
    }

    pub fn put_scalar(&mut self, value: &ScalarValue) -> std::io::Result<()> {
        match value {
            ScalarValue::Byte(v) => self.put_byte(*v),
            ScalarValue::Int16(v) => self.put_int16(*v),
            ScalarValue::UInt16(v) => self.put_uint16(*v),
            ScalarValue::Int32(v) => self.put_int32(*v),
            ScalarValue::UInt32(v) => self.put_uint32(*v),
            ScalarValue::Float32(v) => self.put_float32(*v),
            ScalarValue::Float64(v) => self.put_float64(*v),
            ScalarValue::Str(v) | ScalarValue::Url(v) => self.put_string(v),
        }
    }
}

/// Serialize one variable's projected slice.
///
/// When `eval_selection` is set, sequence rows are filtered through the
/// evaluator's selection clauses before emission.
pub fn serialize_variable<W, E>(
    var: &Variable,
    eval: &E,
    enc: &mut XdrEncoder<W>,
    eval_selection: bool,
) -> Result<(), DapError>
where
    W: Write,
    E: ConstraintEvaluator + ?Sized,
{
    serialize_value(var.name.as_str(), &var.value, eval, enc, eval_selection)
}

fn serialize_value<W, E>(
    name: &str,
    value: &Value,
    eval: &E,
    enc: &mut XdrEncoder<W>,
    eval_selection: bool,
) -> Result<(), DapError>
where
    W: Write,
    E: ConstraintEvaluator + ?Sized,
{
    match value {
        Value::Array(arr) => {
            let data = arr
                .data
                .as_ref()
                .ok_or_else(|| DapError::Dataset(format!("`{name}` has not been read")))?;

            enc.put_uint32(arr.constrained_len() as u32)?;
            for index in arr.selected_flat_indices() {
                let element = data.get(index).ok_or_else(|| {
                    DapError::Dataset(format!("`{name}` is shorter than its declared extent"))
                })?;
                enc.put_scalar(&element)?;
            }

            Ok(())
        }
        Value::Structure(children) => {
            for child in children {
                if child.projected {
                    serialize_variable(child, eval, enc, eval_selection)?;
                }
            }
            Ok(())
        }
        Value::Sequence(seq) => serialize_sequence(name, seq, eval, enc, eval_selection),
        Value::Grid(grid) => {
            if grid.array.projected {
                serialize_variable(&grid.array, eval, enc, eval_selection)?;
            }
            for map in &grid.maps {
                if map.projected {
                    serialize_variable(map, eval, enc, eval_selection)?;
                }
            }
            Ok(())
        }
        value => {
            let scalar = value
                .scalar()
                .ok_or_else(|| DapError::Dataset(format!("`{name}` has not been read")))?;
            enc.put_scalar(&scalar)?;
            Ok(())
        }
    }
}

fn serialize_sequence<W, E>(
    name: &str,
    seq: &SequenceValue,
    eval: &E,
    enc: &mut XdrEncoder<W>,
    eval_selection: bool,
) -> Result<(), DapError>
where
    W: Write,
    E: ConstraintEvaluator + ?Sized,
{
    for row in &seq.rows {
        if row.len() != seq.fields.len() {
            return Err(DapError::Internal(format!(
                "sequence `{name}` has a row of {} cells for {} fields",
                row.len(),
                seq.fields.len(),
            )));
        }

        if eval_selection && !eval.row_matches(&seq.fields, row)? {
            continue;
        }

        enc.put_uint32(START_OF_INSTANCE)?;
        for (field, cell) in seq.fields.iter().zip(row) {
            if field.projected {
                serialize_value(field.name.as_str(), cell, eval, enc, eval_selection)?;
            }
        }
    }

    enc.put_uint32(END_OF_SEQUENCE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use dap_types::VarName;
    use dap_types::variable::{ArrayData, ArrayValue, Dimension, ScalarType, Slice};

    use super::*;
    use crate::ce::Evaluator;

    fn name(s: &str) -> VarName {
        VarName::try_from(s).unwrap()
    }

    #[test]
    fn test_primitives_are_padded() {
        let mut enc = XdrEncoder::new(Vec::new());
        enc.put_byte(0xAB).unwrap();
        enc.put_int16(-2).unwrap();
        enc.put_uint16(7).unwrap();

        assert_eq!(
            enc.into_inner(),
            [0xAB, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFE, 0, 0, 0, 7]
        );
    }

    #[test]
    fn test_float64_big_endian() {
        let mut enc = XdrEncoder::new(Vec::new());
        enc.put_float64(1.5).unwrap();

        assert_eq!(enc.into_inner(), 1.5f64.to_be_bytes());
    }

    #[test]
    fn test_string_length_prefix_and_pad() {
        let mut enc = XdrEncoder::new(Vec::new());
        enc.put_string("abcde").unwrap();

        assert_eq!(
            enc.into_inner(),
            [0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0]
        );

        // A multiple of four needs no padding.
        let mut enc = XdrEncoder::new(Vec::new());
        enc.put_string("abcd").unwrap();
        assert_eq!(enc.into_inner().len(), 8);
    }

    #[test]
    fn test_serialize_constrained_array() {
        let mut arr = ArrayValue::new(
            ScalarType::Int32,
            vec![Dimension::new(Some(name("time")), 6)],
        );
        arr.dims[0].constraint = Some(Slice::new(1, 2, Some(5)));
        arr.data = Some(ArrayData::Int32(vec![10, 11, 12, 13, 14, 15]));

        let mut var = Variable::new(name("x"), Value::Array(arr));
        var.projected = true;

        let eval = Evaluator::new();
        let mut enc = XdrEncoder::new(Vec::new());
        serialize_variable(&var, &eval, &mut enc, false).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&3u32.to_be_bytes());
        for v in [11i32, 13, 15] {
            expected.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(enc.into_inner(), expected);
    }

    #[test]
    fn test_unread_variable_is_a_dataset_error() {
        let var = Variable::new(name("t"), Value::Float64(None));
        let eval = Evaluator::new();
        let mut enc = XdrEncoder::new(Vec::new());

        let err = serialize_variable(&var, &eval, &mut enc, false).unwrap_err();
        assert!(matches!(err, DapError::Dataset(_)));
    }
}
