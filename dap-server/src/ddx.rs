//! Reading a DDX document back into a variable tree.
//!
//! Cache entries store a DataDDX; reusing one means parsing the DDX part to
//! recover the tree's structure, then decoding the XDR blob against it. This
//! reader handles exactly the XML shape
//! [`Dataset::print_xml`](dap_types::Dataset::print_xml) emits.

use dap_types::attribute::{AttrTable, AttrType, Attribute};
use dap_types::core::VarName;
use dap_types::dataset::Dataset;
use dap_types::variable::{
    ArrayValue, Dimension, GridValue, ScalarType, SequenceValue, Value, Variable,
};
use dap_types::DapError;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// Parse a DDX document. Returns the (valueless) dataset and the `cid:` id of
/// the data blob, when the document references one.
pub fn parse_ddx(xml: &[u8]) -> Result<(Dataset, Option<String>), DapError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut parser = DdxParser::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => parser.open(&start, false)?,
            Ok(Event::Empty(start)) => parser.open(&start, true)?,
            Ok(Event::End(end)) => parser.close(end.name().as_ref())?,
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| malformed(format!("bad text content: {e}")))?;
                parser.text(&text);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(format!("XML error: {e}"))),
        }
        buf.clear();
    }

    parser.finish()
}

fn malformed(detail: String) -> DapError {
    DapError::Cache(format!("malformed DDX: {detail}"))
}

fn scalar_value_for_tag(tag: &str) -> Option<Value> {
    Some(match tag {
        "Byte" => Value::Byte(None),
        "Int16" => Value::Int16(None),
        "UInt16" => Value::UInt16(None),
        "Int32" => Value::Int32(None),
        "UInt32" => Value::UInt32(None),
        "Float32" => Value::Float32(None),
        "Float64" => Value::Float64(None),
        "String" => Value::Str(None),
        "Url" => Value::Url(None),
        _ => return None,
    })
}

fn scalar_type_for_tag(tag: &str) -> Option<ScalarType> {
    Some(match tag {
        "Byte" => ScalarType::Byte,
        "Int16" => ScalarType::Int16,
        "UInt16" => ScalarType::UInt16,
        "Int32" => ScalarType::Int32,
        "UInt32" => ScalarType::UInt32,
        "Float32" => ScalarType::Float32,
        "Float64" => ScalarType::Float64,
        "String" => ScalarType::Str,
        "Url" => ScalarType::Url,
        _ => return None,
    })
}

fn attr_type_for(value: &str) -> AttrType {
    match value {
        "Byte" => AttrType::Byte,
        "Int16" => AttrType::Int16,
        "UInt16" => AttrType::UInt16,
        "Int32" => AttrType::Int32,
        "UInt32" => AttrType::UInt32,
        "Float32" => AttrType::Float32,
        "Float64" => AttrType::Float64,
        "Url" => AttrType::Url,
        "Container" => AttrType::Container,
        _ => AttrType::String,
    }
}

/// One partially built element.
#[derive(Debug)]
enum Frame {
    Var(Variable),
    Array {
        name: VarName,
        attributes: AttrTable,
        elem: Option<ScalarType>,
        dims: Vec<Dimension>,
    },
    Grid {
        name: VarName,
        attributes: AttrTable,
        array: Option<Variable>,
        maps: Vec<Variable>,
    },
    Attr(Attribute),
}

#[derive(Debug, Default)]
struct DdxParser {
    dataset: Option<Dataset>,
    stack: Vec<Frame>,
    blob_cid: Option<String>,
    in_value: bool,
}

impl DdxParser {
    fn attr_of(start: &BytesStart, name: &str) -> Result<Option<String>, DapError> {
        let attr = start
            .try_get_attribute(name)
            .map_err(|e| malformed(format!("bad attribute: {e}")))?;

        match attr {
            Some(attr) => {
                let value = attr
                    .unescape_value()
                    .map_err(|e| malformed(format!("bad attribute value: {e}")))?;
                Ok(Some(value.into_owned()))
            }
            None => Ok(None),
        }
    }

    fn required_name(start: &BytesStart) -> Result<VarName, DapError> {
        let name = Self::attr_of(start, "name")?
            .ok_or_else(|| malformed("element is missing its name".to_owned()))?;
        VarName::try_from(name).map_err(|e| malformed(e.to_string()))
    }

    fn open(&mut self, start: &BytesStart, empty: bool) -> Result<(), DapError> {
        let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();

        match tag.as_str() {
            "Dataset" => {
                let mut dataset = Dataset::new(
                    Self::attr_of(start, "name")?.unwrap_or_default(),
                );
                if let Some(version) = Self::attr_of(start, "dapVersion")? {
                    dataset.dap_version = version;
                }
                self.dataset = Some(dataset);
            }
            "Attribute" => {
                let name = Self::required_name(start)?;
                let attr_type = attr_type_for(
                    Self::attr_of(start, "type")?.as_deref().unwrap_or("String"),
                );
                let attr = if attr_type == AttrType::Container {
                    Attribute::container(name, AttrTable::new())
                } else {
                    Attribute::new(name, attr_type, Vec::new())
                };

                if empty {
                    self.attach_attr(attr);
                } else {
                    self.stack.push(Frame::Attr(attr));
                }
            }
            "value" => self.in_value = true,
            "Array" | "Map" => {
                self.stack.push(Frame::Array {
                    name: Self::required_name(start)?,
                    attributes: AttrTable::new(),
                    elem: None,
                    dims: Vec::new(),
                });
            }
            "dimension" => {
                let size: u32 = Self::attr_of(start, "size")?
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| malformed("dimension is missing its size".to_owned()))?;
                let name = match Self::attr_of(start, "name")? {
                    Some(name) => {
                        Some(VarName::try_from(name).map_err(|e| malformed(e.to_string()))?)
                    }
                    None => None,
                };

                match self.stack.last_mut() {
                    Some(Frame::Array { dims, .. }) => dims.push(Dimension::new(name, size)),
                    _ => return Err(malformed("dimension outside an array".to_owned())),
                }
            }
            "Structure" => self.stack.push(Frame::Var(Variable::new(
                Self::required_name(start)?,
                Value::Structure(Vec::new()),
            ))),
            "Sequence" => self.stack.push(Frame::Var(Variable::new(
                Self::required_name(start)?,
                Value::Sequence(SequenceValue::new(Vec::new())),
            ))),
            "Grid" => self.stack.push(Frame::Grid {
                name: Self::required_name(start)?,
                attributes: AttrTable::new(),
                array: None,
                maps: Vec::new(),
            }),
            "blob" => {
                let href = Self::attr_of(start, "href")?
                    .ok_or_else(|| malformed("blob is missing its href".to_owned()))?;
                self.blob_cid = Some(href.strip_prefix("cid:").unwrap_or(&href).to_owned());
            }
            tag => {
                // The element type of an array is a bare scalar tag.
                if let (Some(scalar), Some(Frame::Array { elem, .. })) =
                    (scalar_type_for_tag(tag), self.stack.last_mut())
                {
                    if elem.is_none() && Self::attr_of(start, "name")?.is_none() {
                        *elem = Some(scalar);
                        return Ok(());
                    }
                }

                if let Some(value) = scalar_value_for_tag(tag) {
                    let var = Variable::new(Self::required_name(start)?, value);
                    if empty {
                        self.attach_var(var)?;
                    } else {
                        self.stack.push(Frame::Var(var));
                    }
                }
                // Unknown elements are skipped.
            }
        }

        Ok(())
    }

    fn text(&mut self, text: &str) {
        if !self.in_value {
            return;
        }
        if let Some(Frame::Attr(attr)) = self.stack.last_mut() {
            attr.values.push(text.to_owned());
        }
    }

    fn close(&mut self, tag: &[u8]) -> Result<(), DapError> {
        match tag {
            b"value" => {
                self.in_value = false;
                Ok(())
            }
            b"Dataset" | b"dimension" | b"blob" => Ok(()),
            b"Attribute" => match self.stack.pop() {
                Some(Frame::Attr(attr)) => {
                    self.attach_attr(attr);
                    Ok(())
                }
                _ => Err(malformed("unbalanced Attribute element".to_owned())),
            },
            b"Array" | b"Map" => match self.stack.pop() {
                Some(Frame::Array {
                    name,
                    attributes,
                    elem,
                    dims,
                }) => {
                    let elem = elem
                        .ok_or_else(|| malformed(format!("array `{name}` has no element type")))?;
                    let mut var = Variable::new(name, Value::Array(ArrayValue::new(elem, dims)));
                    var.attributes = attributes;
                    self.attach_var(var)
                }
                _ => Err(malformed("unbalanced Array element".to_owned())),
            },
            b"Grid" => match self.stack.pop() {
                Some(Frame::Grid {
                    name,
                    attributes,
                    array,
                    maps,
                }) => {
                    let array = array
                        .ok_or_else(|| malformed(format!("grid `{name}` has no data array")))?;
                    let mut var = Variable::new(
                        name,
                        Value::Grid(GridValue {
                            array: Box::new(array),
                            maps,
                        }),
                    );
                    var.attributes = attributes;
                    self.attach_var(var)
                }
                _ => Err(malformed("unbalanced Grid element".to_owned())),
            },
            _ => match self.stack.pop() {
                Some(Frame::Var(var)) => self.attach_var(var),
                // Ends of elements we never opened a frame for.
                None => Ok(()),
                Some(frame) => {
                    self.stack.push(frame);
                    Ok(())
                }
            },
        }
    }

    fn attach_attr(&mut self, attr: Attribute) {
        match self.stack.last_mut() {
            Some(Frame::Attr(parent)) => {
                if let Some(table) = &mut parent.table {
                    table.push(attr);
                }
            }
            Some(Frame::Var(var)) => var.attributes.push(attr),
            Some(Frame::Array { attributes, .. }) | Some(Frame::Grid { attributes, .. }) => {
                attributes.push(attr);
            }
            None => {
                if let Some(dataset) = &mut self.dataset {
                    dataset.global_attributes.push(attr);
                }
            }
        }
    }

    fn attach_var(&mut self, var: Variable) -> Result<(), DapError> {
        match self.stack.last_mut() {
            Some(Frame::Var(parent)) => match &mut parent.value {
                Value::Structure(children) => {
                    children.push(var);
                    Ok(())
                }
                Value::Sequence(seq) => {
                    seq.fields.push(var);
                    Ok(())
                }
                _ => Err(malformed(format!(
                    "`{}` cannot contain variables",
                    parent.name,
                ))),
            },
            Some(Frame::Grid { array, maps, .. }) => {
                // The first array is the data component, Maps follow.
                if array.is_none() {
                    *array = Some(var);
                } else {
                    maps.push(var);
                }
                Ok(())
            }
            Some(Frame::Array { .. }) | Some(Frame::Attr(_)) => {
                Err(malformed(format!("`{}` is nested incorrectly", var.name)))
            }
            None => match &mut self.dataset {
                Some(dataset) => dataset
                    .add_var(var)
                    .map_err(|e| malformed(e.to_string())),
                None => Err(malformed("variable outside a Dataset".to_owned())),
            },
        }
    }

    fn finish(self) -> Result<(Dataset, Option<String>), DapError> {
        if !self.stack.is_empty() {
            return Err(malformed("document ended with open elements".to_owned()));
        }

        let dataset = self
            .dataset
            .ok_or_else(|| malformed("no Dataset element".to_owned()))?;

        Ok((dataset, self.blob_cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_print_xml() {
        let mut ds = Dataset::new("Sample");
        ds.global_attributes.push(Attribute::new(
            VarName::try_from("history").unwrap(),
            AttrType::String,
            vec!["created by hand".into()],
        ));

        let mut t = Variable::new(
            VarName::try_from("t").unwrap(),
            Value::Float64(Some(1.5)),
        );
        t.attributes.push(Attribute::new(
            VarName::try_from("units").unwrap(),
            AttrType::String,
            vec!["seconds".into()],
        ));
        ds.add_var(t).unwrap();

        let arr = ArrayValue::new(
            ScalarType::Int32,
            vec![Dimension::new(
                Some(VarName::try_from("time").unwrap()),
                10,
            )],
        );
        ds.add_var(Variable::new(
            VarName::try_from("x").unwrap(),
            Value::Array(arr),
        ))
        .unwrap();

        let grid_arr = Variable::new(
            VarName::try_from("sst").unwrap(),
            Value::Array(ArrayValue::new(
                ScalarType::Float32,
                vec![Dimension::new(
                    Some(VarName::try_from("lat").unwrap()),
                    4,
                )],
            )),
        );
        let map = Variable::new(
            VarName::try_from("lat").unwrap(),
            Value::Array(ArrayValue::new(
                ScalarType::Float64,
                vec![Dimension::new(
                    Some(VarName::try_from("lat").unwrap()),
                    4,
                )],
            )),
        );
        ds.add_var(Variable::new(
            VarName::try_from("sst_grid").unwrap(),
            Value::Grid(GridValue {
                array: Box::new(grid_arr),
                maps: vec![map],
            }),
        ))
        .unwrap();

        ds.mark_all(true);

        let mut xml = Vec::new();
        ds.print_xml(&mut xml, false, "99@opendap.org").unwrap();

        let (parsed, cid) = parse_ddx(&xml).unwrap();

        assert_eq!(cid.as_deref(), Some("99@opendap.org"));
        assert_eq!(parsed.name, "Sample");
        assert_eq!(parsed.vars().len(), 3);
        assert_eq!(
            parsed
                .global_attributes
                .get("history")
                .unwrap()
                .values,
            vec!["created by hand"]
        );

        let t = parsed.var("t").unwrap();
        assert_eq!(t.value, Value::Float64(None));
        assert_eq!(t.attributes.get("units").unwrap().values, vec!["seconds"]);

        let Value::Array(x) = &parsed.var("x").unwrap().value else {
            panic!("x should be an array");
        };
        assert_eq!(x.elem, ScalarType::Int32);
        assert_eq!(x.dims[0].size, 10);

        let Value::Grid(grid) = &parsed.var("sst_grid").unwrap().value else {
            panic!("sst_grid should be a grid");
        };
        assert_eq!(grid.maps.len(), 1);
        assert_eq!(grid.maps[0].name.as_str(), "lat");
    }

    #[test]
    fn test_sequence_fields() {
        let xml = br#"<?xml version="1.0" encoding="ISO-8859-1"?>
<Dataset name="Casts" xmlns="http://xml.opendap.org/ns/DAP/3.2#" dapVersion="3.2">
    <Sequence name="cast">
        <String name="site"/>
        <Float64 name="depth"/>
    </Sequence>
</Dataset>
"#;

        let (parsed, cid) = parse_ddx(xml).unwrap();
        assert!(cid.is_none());

        let Value::Sequence(seq) = &parsed.var("cast").unwrap().value else {
            panic!("cast should be a sequence");
        };
        assert_eq!(seq.fields.len(), 2);
        assert_eq!(seq.fields[1].value, Value::Float64(None));
    }

    #[test]
    fn test_malformed_is_a_cache_error() {
        let err = parse_ddx(b"<Dataset name=\"x\"><Array name=\"a\"></Array></Dataset>")
            .unwrap_err();
        assert!(matches!(err, DapError::Cache(_)));
    }
}
