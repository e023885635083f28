//! The variable tree.
//!
//! The original protocol library models variables as a class hierarchy with
//! virtual dispatch; here a variable is a [`VarName`] plus a tagged [`Value`].
//! Composite kinds (structures, sequences, grids) own their children outright,
//! so the tree has no cycles and no back references.

use crate::attribute::AttrTable;
use crate::core::VarName;

/// The primitive type of an array element or scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    Str,
    Url,
}

impl ScalarType {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Byte => "Byte",
            Self::Int16 => "Int16",
            Self::UInt16 => "UInt16",
            Self::Int32 => "Int32",
            Self::UInt32 => "UInt32",
            Self::Float32 => "Float32",
            Self::Float64 => "Float64",
            Self::Str => "String",
            Self::Url => "Url",
        }
    }

    /// Bytes one element occupies on the wire. Sixteen-bit and byte values are
    /// padded out to the four-byte unit; strings report the length prefix only.
    pub fn xdr_width(&self) -> u64 {
        match self {
            Self::Float64 => 8,
            _ => 4,
        }
    }
}

/// A materialized scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    Float64(f64),
    Str(String),
    Url(String),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Byte(_) => ScalarType::Byte,
            Self::Int16(_) => ScalarType::Int16,
            Self::UInt16(_) => ScalarType::UInt16,
            Self::Int32(_) => ScalarType::Int32,
            Self::UInt32(_) => ScalarType::UInt32,
            Self::Float32(_) => ScalarType::Float32,
            Self::Float64(_) => ScalarType::Float64,
            Self::Str(_) => ScalarType::Str,
            Self::Url(_) => ScalarType::Url,
        }
    }

    /// Numeric view, for relational selection clauses.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Byte(v) => Some(f64::from(*v)),
            Self::Int16(v) => Some(f64::from(*v)),
            Self::UInt16(v) => Some(f64::from(*v)),
            Self::Int32(v) => Some(f64::from(*v)),
            Self::UInt32(v) => Some(f64::from(*v)),
            Self::Float32(v) => Some(f64::from(*v)),
            Self::Float64(v) => Some(*v),
            Self::Str(_) | Self::Url(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) | Self::Url(v) => Some(v),
            _ => None,
        }
    }
}

/// A hyperslab over one dimension: `start`, `stride`, and an optional `stop`.
///
/// A missing `stop` means "to the end of the dimension".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: u32,
    pub stride: u32,
    pub stop: Option<u32>,
}

impl Slice {
    pub fn new(start: u32, stride: u32, stop: Option<u32>) -> Self {
        Self { start, stride, stop }
    }

    /// Single-index slice `[i]`.
    pub fn index(i: u32) -> Self {
        Self::new(i, 1, Some(i))
    }

    /// Number of indices selected from a dimension of `size`.
    pub fn count(&self, size: u32) -> u32 {
        if size == 0 {
            return 0;
        }

        let stop = self.stop.unwrap_or(size - 1).min(size - 1);
        if self.start > stop || self.stride == 0 {
            return 0;
        }

        (stop - self.start) / self.stride + 1
    }

    /// The selected indices, ascending.
    pub fn indices(&self, size: u32) -> impl Iterator<Item = u32> + use<> {
        let stop = if size == 0 {
            0
        } else {
            self.stop.unwrap_or(size - 1).min(size - 1)
        };
        let start = self.start;
        let stride = self.stride.max(1);

        (start..=stop).step_by(stride as usize).take_while(move |_| size > 0)
    }
}

/// One array dimension, optionally named and optionally constrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: Option<VarName>,
    pub size: u32,
    pub constraint: Option<Slice>,
}

impl Dimension {
    pub fn new(name: Option<VarName>, size: u32) -> Self {
        Self {
            name,
            size,
            constraint: None,
        }
    }

    /// Number of indices the (possibly constrained) dimension contributes.
    pub fn constrained_count(&self) -> u32 {
        match &self.constraint {
            Some(slice) => slice.count(self.size),
            None => self.size,
        }
    }

    pub fn constrained_indices(&self) -> Vec<u32> {
        match &self.constraint {
            Some(slice) => slice.indices(self.size).collect(),
            None => (0..self.size).collect(),
        }
    }
}

/// Array element storage, one vector per primitive kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Byte(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Str(Vec<String>),
    Url(Vec<String>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            Self::Byte(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::UInt16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::UInt32(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Str(v) => v.len(),
            Self::Url(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Byte(_) => ScalarType::Byte,
            Self::Int16(_) => ScalarType::Int16,
            Self::UInt16(_) => ScalarType::UInt16,
            Self::Int32(_) => ScalarType::Int32,
            Self::UInt32(_) => ScalarType::UInt32,
            Self::Float32(_) => ScalarType::Float32,
            Self::Float64(_) => ScalarType::Float64,
            Self::Str(_) => ScalarType::Str,
            Self::Url(_) => ScalarType::Url,
        }
    }

    pub fn get(&self, i: usize) -> Option<ScalarValue> {
        match self {
            Self::Byte(v) => v.get(i).copied().map(ScalarValue::Byte),
            Self::Int16(v) => v.get(i).copied().map(ScalarValue::Int16),
            Self::UInt16(v) => v.get(i).copied().map(ScalarValue::UInt16),
            Self::Int32(v) => v.get(i).copied().map(ScalarValue::Int32),
            Self::UInt32(v) => v.get(i).copied().map(ScalarValue::UInt32),
            Self::Float32(v) => v.get(i).copied().map(ScalarValue::Float32),
            Self::Float64(v) => v.get(i).copied().map(ScalarValue::Float64),
            Self::Str(v) => v.get(i).cloned().map(ScalarValue::Str),
            Self::Url(v) => v.get(i).cloned().map(ScalarValue::Url),
        }
    }
}

/// An array: element type, ordered dimensions, and (once read) element data in
/// row-major order over the full extent.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub elem: ScalarType,
    pub dims: Vec<Dimension>,
    pub data: Option<ArrayData>,
}

impl ArrayValue {
    pub fn new(elem: ScalarType, dims: Vec<Dimension>) -> Self {
        Self {
            elem,
            dims,
            data: None,
        }
    }

    pub fn full_len(&self) -> u64 {
        self.dims.iter().map(|d| u64::from(d.size)).product()
    }

    pub fn constrained_len(&self) -> u64 {
        self.dims
            .iter()
            .map(|d| u64::from(d.constrained_count()))
            .product()
    }

    pub fn clear_constraints(&mut self) {
        for dim in &mut self.dims {
            dim.constraint = None;
        }
    }

    /// Row-major flat indices of the constrained extent.
    pub fn selected_flat_indices(&self) -> Vec<usize> {
        let per_dim: Vec<Vec<u32>> = self.dims.iter().map(|d| d.constrained_indices()).collect();

        if per_dim.iter().any(|ix| ix.is_empty()) {
            return Vec::new();
        }

        // Row-major strides over the full extent.
        let mut strides = vec![1u64; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * u64::from(self.dims[i + 1].size);
        }

        let mut flat = Vec::with_capacity(self.constrained_len() as usize);
        let mut odometer = vec![0usize; per_dim.len()];

        loop {
            let index: u64 = odometer
                .iter()
                .zip(&per_dim)
                .zip(&strides)
                .map(|((&pos, ix), &stride)| u64::from(ix[pos]) * stride)
                .sum();
            flat.push(index as usize);

            // Advance the odometer, last dimension fastest.
            let mut dim = per_dim.len();
            loop {
                if dim == 0 {
                    return flat;
                }
                dim -= 1;
                odometer[dim] += 1;
                if odometer[dim] < per_dim[dim].len() {
                    break;
                }
                odometer[dim] = 0;
            }
        }
    }
}

/// Parent/leaf marking for sequences, set by
/// [`Dataset::tag_nested_sequences`](crate::dataset::Dataset::tag_nested_sequences).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequenceTag {
    #[default]
    Untagged,
    Parent,
    Leaf,
}

/// A sequence: declared fields plus zero or more materialized rows.
///
/// Each row holds one [`Value`] per field, in field order; a nested sequence
/// field carries its own rows inside the cell.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceValue {
    pub fields: Vec<Variable>,
    pub rows: Vec<Vec<Value>>,
    pub tag: SequenceTag,
}

impl SequenceValue {
    pub fn new(fields: Vec<Variable>) -> Self {
        Self {
            fields,
            rows: Vec::new(),
            tag: SequenceTag::Untagged,
        }
    }
}

/// A grid: one data array plus one 1-D map per dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct GridValue {
    pub array: Box<Variable>,
    pub maps: Vec<Variable>,
}

/// A variable's type tag and (once read) its data.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(Option<u8>),
    Int16(Option<i16>),
    UInt16(Option<u16>),
    Int32(Option<i32>),
    UInt32(Option<u32>),
    Float32(Option<f32>),
    Float64(Option<f64>),
    Str(Option<String>),
    Url(Option<String>),
    Array(ArrayValue),
    Structure(Vec<Variable>),
    Sequence(SequenceValue),
    Grid(GridValue),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Byte(_) => "Byte",
            Self::Int16(_) => "Int16",
            Self::UInt16(_) => "UInt16",
            Self::Int32(_) => "Int32",
            Self::UInt32(_) => "UInt32",
            Self::Float32(_) => "Float32",
            Self::Float64(_) => "Float64",
            Self::Str(_) => "String",
            Self::Url(_) => "Url",
            Self::Array(_) => "Array",
            Self::Structure(_) => "Structure",
            Self::Sequence(_) => "Sequence",
            Self::Grid(_) => "Grid",
        }
    }

    /// True for types that own child variables.
    pub fn is_constructor(&self) -> bool {
        matches!(
            self,
            Self::Structure(_) | Self::Sequence(_) | Self::Grid(_)
        )
    }

    pub fn scalar(&self) -> Option<ScalarValue> {
        match self {
            Self::Byte(v) => v.map(ScalarValue::Byte),
            Self::Int16(v) => v.map(ScalarValue::Int16),
            Self::UInt16(v) => v.map(ScalarValue::UInt16),
            Self::Int32(v) => v.map(ScalarValue::Int32),
            Self::UInt32(v) => v.map(ScalarValue::UInt32),
            Self::Float32(v) => v.map(ScalarValue::Float32),
            Self::Float64(v) => v.map(ScalarValue::Float64),
            Self::Str(v) => v.clone().map(ScalarValue::Str),
            Self::Url(v) => v.clone().map(ScalarValue::Url),
            _ => None,
        }
    }

    pub fn children(&self) -> Vec<&Variable> {
        match self {
            Self::Structure(vars) => vars.iter().collect(),
            Self::Sequence(seq) => seq.fields.iter().collect(),
            Self::Grid(grid) => std::iter::once(&*grid.array).chain(grid.maps.iter()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Variable> {
        match self {
            Self::Structure(vars) => vars.iter_mut().collect(),
            Self::Sequence(seq) => seq.fields.iter_mut().collect(),
            Self::Grid(grid) => std::iter::once(grid.array.as_mut())
                .chain(grid.maps.iter_mut())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A named variable in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: VarName,
    pub value: Value,
    /// Selected for transmission by the current constraint.
    pub projected: bool,
    /// The value has been materialized.
    pub read: bool,
    pub attributes: AttrTable,
}

impl Variable {
    pub fn new(name: VarName, value: Value) -> Self {
        Self {
            name,
            value,
            projected: false,
            read: false,
            attributes: AttrTable::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&Variable> {
        self.value.children().into_iter().find(|v| v.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.value
            .children_mut()
            .into_iter()
            .find(|v| v.name == name)
    }

    pub fn set_projected_recursive(&mut self, projected: bool) {
        self.projected = projected;
        for child in self.value.children_mut() {
            child.set_projected_recursive(projected);
        }
    }

    pub fn set_read_recursive(&mut self, read: bool) {
        self.read = read;
        for child in self.value.children_mut() {
            child.set_read_recursive(read);
        }
    }

    /// Tag sequences as parent or leaf nodes. Returns true when this subtree
    /// contains a sequence.
    pub(crate) fn tag_sequences(&mut self) -> bool {
        match &mut self.value {
            Value::Sequence(seq) => {
                let mut nested = false;
                for field in &mut seq.fields {
                    nested |= field.tag_sequences();
                }
                seq.tag = if nested {
                    SequenceTag::Parent
                } else {
                    SequenceTag::Leaf
                };
                true
            }
            value => {
                let mut found = false;
                for child in value.children_mut() {
                    found |= child.tag_sequences();
                }
                found
            }
        }
    }

    /// Estimated bytes this variable's (optionally constrained) projection
    /// would put on the wire.
    pub fn request_size(&self, constrained: bool) -> u64 {
        if constrained && !self.projected {
            return 0;
        }

        match &self.value {
            Value::Str(v) | Value::Url(v) => {
                4 + v.as_ref().map_or(0, |s| padded4(s.len() as u64))
            }
            Value::Byte(_)
            | Value::Int16(_)
            | Value::UInt16(_)
            | Value::Int32(_)
            | Value::UInt32(_)
            | Value::Float32(_) => 4,
            Value::Float64(_) => 8,
            Value::Array(arr) => {
                let count = if constrained {
                    arr.constrained_len()
                } else {
                    arr.full_len()
                };
                match arr.elem {
                    ScalarType::Str | ScalarType::Url => {
                        // Length words plus the data we know about.
                        let body = match &arr.data {
                            Some(ArrayData::Str(v)) | Some(ArrayData::Url(v)) => {
                                v.iter().map(|s| padded4(s.len() as u64)).sum()
                            }
                            _ => 0,
                        };
                        4 + count * 4 + body
                    }
                    elem => 4 + count * elem.xdr_width(),
                }
            }
            Value::Structure(vars) => vars.iter().map(|v| v.request_size(constrained)).sum(),
            Value::Sequence(seq) => {
                let row_width: u64 = seq
                    .fields
                    .iter()
                    .map(|f| f.request_size(constrained))
                    .sum();
                // Instance markers bracket every row.
                (seq.rows.len() as u64) * (row_width + 4) + 4
            }
            Value::Grid(grid) => {
                grid.array.request_size(constrained)
                    + grid
                        .maps
                        .iter()
                        .map(|m| m.request_size(constrained))
                        .sum::<u64>()
            }
        }
    }
}

fn padded4(len: u64) -> u64 {
    len.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> VarName {
        VarName::try_from(s).unwrap()
    }

    #[test]
    fn test_slice_count() {
        // [0:1:0] selects exactly one element.
        assert_eq!(Slice::new(0, 1, Some(0)).count(10), 1);
        // [5:2:] runs from index 5 to the end with stride 2.
        assert_eq!(Slice::new(5, 2, None).count(10), 3);
        assert_eq!(
            Slice::new(5, 2, None).indices(10).collect::<Vec<_>>(),
            vec![5, 7, 9]
        );
        assert_eq!(Slice::new(3, 1, Some(2)).count(10), 0);
        assert_eq!(Slice::new(0, 1, None).count(0), 0);
    }

    #[test]
    fn test_selected_flat_indices_row_major() {
        let mut arr = ArrayValue::new(
            ScalarType::Int32,
            vec![
                Dimension::new(Some(name("row")), 3),
                Dimension::new(Some(name("col")), 4),
            ],
        );
        arr.dims[0].constraint = Some(Slice::new(1, 1, Some(2)));
        arr.dims[1].constraint = Some(Slice::new(0, 2, None));

        // Rows 1..2, columns {0, 2}.
        assert_eq!(arr.selected_flat_indices(), vec![4, 6, 8, 10]);
        assert_eq!(arr.constrained_len(), 4);
    }

    #[test]
    fn test_tag_sequences() {
        let inner = Variable::new(
            name("inner"),
            Value::Sequence(SequenceValue::new(vec![Variable::new(
                name("depth"),
                Value::Float64(None),
            )])),
        );
        let mut outer = Variable::new(
            name("outer"),
            Value::Sequence(SequenceValue::new(vec![
                Variable::new(name("t"), Value::Int32(None)),
                inner,
            ])),
        );

        outer.tag_sequences();

        let Value::Sequence(seq) = &outer.value else {
            unreachable!()
        };
        assert_eq!(seq.tag, SequenceTag::Parent);
        let Value::Sequence(inner) = &seq.fields[1].value else {
            unreachable!()
        };
        assert_eq!(inner.tag, SequenceTag::Leaf);
    }

    #[test]
    fn test_request_size_scalar_and_array() {
        let mut t = Variable::new(name("t"), Value::Float64(Some(1.5)));
        t.projected = true;
        assert_eq!(t.request_size(true), 8);

        let mut arr = ArrayValue::new(
            ScalarType::Int32,
            vec![Dimension::new(Some(name("time")), 10)],
        );
        arr.dims[0].constraint = Some(Slice::new(0, 1, Some(4)));
        let mut x = Variable::new(name("x"), Value::Array(arr));
        x.projected = true;

        assert_eq!(x.request_size(false), 4 + 10 * 4);
        assert_eq!(x.request_size(true), 4 + 5 * 4);

        x.projected = false;
        assert_eq!(x.request_size(true), 0);
    }
}
