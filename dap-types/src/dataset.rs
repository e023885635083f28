//! The dataset: a named, rooted tree of variables.
//!
//! This is the structure the response pipeline walks. Text emission (DAS, DDS)
//! and the DDX XML form live here; the binary value encoding is the server
//! crate's concern.

use std::io::Write;

use crate::attribute::AttrTable;
use crate::core::VarName;
use crate::error::{ValidationError, ValidationErrorKind};
use crate::utils::escape_xml;
use crate::variable::{Value, Variable};

const DDX_NAMESPACE: &str = "http://xml.opendap.org/ns/DAP/3.2#";

/// A rooted variable tree plus dataset-level attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    /// Where the dataset lives on disk; empty for virtual datasets.
    pub filename: String,
    pub dap_version: String,
    pub global_attributes: AttrTable,
    vars: Vec<Variable>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: String::new(),
            dap_version: "3.2".to_owned(),
            global_attributes: AttrTable::new(),
            vars: Vec::new(),
        }
    }

    /// Append a top-level variable. Sibling names must be unique.
    pub fn add_var(&mut self, var: Variable) -> Result<(), ValidationError> {
        if self.vars.iter().any(|v| v.name == var.name) {
            return Err(ValidationError::new(ValidationErrorKind::Duplicate {
                name: var.name.as_str().to_owned(),
            }));
        }

        self.vars.push(var);
        Ok(())
    }

    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    pub fn into_vars(self) -> Vec<Variable> {
        self.vars
    }

    pub fn vars_mut(&mut self) -> &mut [Variable] {
        &mut self.vars
    }

    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }

    /// Look a variable up by dotted path, e.g. `station.temp`.
    pub fn var_by_path(&self, path: &[VarName]) -> Option<&Variable> {
        let (first, rest) = path.split_first()?;
        let mut var = self.vars.iter().find(|v| v.name == *first)?;

        for segment in rest {
            var = var.child(segment.as_str())?;
        }

        Some(var)
    }

    pub fn var_by_path_mut(&mut self, path: &[VarName]) -> Option<&mut Variable> {
        let (first, rest) = path.split_first()?;
        let mut var = self.vars.iter_mut().find(|v| v.name == *first)?;

        for segment in rest {
            var = var.child_mut(segment.as_str())?;
        }

        Some(var)
    }

    /// Set or clear the projection flag on every variable in the tree.
    pub fn mark_all(&mut self, projected: bool) {
        for var in &mut self.vars {
            var.set_projected_recursive(projected);
        }
    }

    /// Mark every variable as read.
    pub fn mark_all_read(&mut self) {
        for var in &mut self.vars {
            var.set_read_recursive(true);
        }
    }

    /// Tag sequences as parent or leaf nodes. Required before data emission.
    pub fn tag_nested_sequences(&mut self) {
        for var in &mut self.vars {
            var.tag_sequences();
        }
    }

    /// Estimated bytes the (optionally constrained) projection would emit.
    pub fn request_size(&self, constrained: bool) -> u64 {
        self.vars.iter().map(|v| v.request_size(constrained)).sum()
    }

    // ----- DAS ---------------------------------------------------------------

    /// Print the dataset attributes in DAS form.
    pub fn print_das(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Attributes {{")?;
        self.global_attributes.print(out, 4)?;
        for var in &self.vars {
            print_das_var(out, var, 4)?;
        }
        writeln!(out, "}}")
    }

    // ----- DDS ---------------------------------------------------------------

    /// Print the dataset structure in DDS form. When `constrained`, only
    /// projected variables appear and array dimensions show constrained sizes.
    pub fn print_dds(&self, out: &mut dyn Write, constrained: bool) -> std::io::Result<()> {
        writeln!(out, "Dataset {{")?;
        for var in &self.vars {
            print_dds_var(out, var, 4, constrained)?;
        }
        writeln!(out, "}} {};", self.name)
    }

    // ----- DDX ---------------------------------------------------------------

    /// Print the dataset as a DDX document. When `blob_cid` is nonempty, a
    /// `blob` element referencing the data part is appended.
    pub fn print_xml(
        &self,
        out: &mut dyn Write,
        constrained: bool,
        blob_cid: &str,
    ) -> std::io::Result<()> {
        writeln!(out, r#"<?xml version="1.0" encoding="ISO-8859-1"?>"#)?;
        writeln!(
            out,
            r#"<Dataset name="{}" xmlns="{}" dapVersion="{}">"#,
            escape_xml(&self.name),
            DDX_NAMESPACE,
            escape_xml(&self.dap_version),
        )?;

        print_xml_attr_table(out, &self.global_attributes, 4)?;
        for var in &self.vars {
            print_xml_var(out, var, 4, constrained)?;
        }

        if !blob_cid.is_empty() {
            writeln!(out, r#"    <blob href="cid:{}"/>"#, escape_xml(blob_cid))?;
        }

        writeln!(out, "</Dataset>")
    }
}

fn print_das_var(out: &mut dyn Write, var: &Variable, indent: usize) -> std::io::Result<()> {
    let pad = " ".repeat(indent);

    writeln!(out, "{pad}{} {{", var.name)?;
    var.attributes.print(out, indent + 4)?;
    for child in var.value.children() {
        print_das_var(out, child, indent + 4)?;
    }
    writeln!(out, "{pad}}}")
}

fn dims_decl(dims: &[crate::variable::Dimension], constrained: bool) -> String {
    let mut out = String::new();

    for dim in dims {
        let size = if constrained {
            dim.constrained_count()
        } else {
            dim.size
        };
        match &dim.name {
            Some(name) => out.push_str(&format!("[{name} = {size}]")),
            None => out.push_str(&format!("[{size}]")),
        }
    }

    out
}

fn print_dds_var(
    out: &mut dyn Write,
    var: &Variable,
    indent: usize,
    constrained: bool,
) -> std::io::Result<()> {
    if constrained && !var.projected {
        return Ok(());
    }

    let pad = " ".repeat(indent);

    match &var.value {
        Value::Array(arr) => writeln!(
            out,
            "{pad}{} {}{};",
            arr.elem.type_name(),
            var.name,
            dims_decl(&arr.dims, constrained),
        ),
        Value::Structure(children) => {
            writeln!(out, "{pad}Structure {{")?;
            for child in children {
                print_dds_var(out, child, indent + 4, constrained)?;
            }
            writeln!(out, "{pad}}} {};", var.name)
        }
        Value::Sequence(seq) => {
            writeln!(out, "{pad}Sequence {{")?;
            for field in &seq.fields {
                print_dds_var(out, field, indent + 4, constrained)?;
            }
            writeln!(out, "{pad}}} {};", var.name)
        }
        Value::Grid(grid) => {
            writeln!(out, "{pad}Grid {{")?;
            writeln!(out, "{pad}  Array:")?;
            print_dds_var(out, &grid.array, indent + 4, constrained)?;
            writeln!(out, "{pad}  Maps:")?;
            for map in &grid.maps {
                print_dds_var(out, map, indent + 4, constrained)?;
            }
            writeln!(out, "{pad}}} {};", var.name)
        }
        value => writeln!(out, "{pad}{} {};", value.type_name(), var.name),
    }
}

fn print_xml_attr_table(
    out: &mut dyn Write,
    table: &AttrTable,
    indent: usize,
) -> std::io::Result<()> {
    let pad = " ".repeat(indent);

    for attr in table.iter() {
        match &attr.table {
            Some(nested) => {
                writeln!(
                    out,
                    r#"{pad}<Attribute name="{}" type="Container">"#,
                    escape_xml(attr.name.as_str()),
                )?;
                print_xml_attr_table(out, nested, indent + 4)?;
                writeln!(out, "{pad}</Attribute>")?;
            }
            None => {
                writeln!(
                    out,
                    r#"{pad}<Attribute name="{}" type="{}">"#,
                    escape_xml(attr.name.as_str()),
                    attr.attr_type.as_str(),
                )?;
                for value in &attr.values {
                    writeln!(out, "{pad}    <value>{}</value>", escape_xml(value))?;
                }
                writeln!(out, "{pad}</Attribute>")?;
            }
        }
    }

    Ok(())
}

fn print_xml_array_body(
    out: &mut dyn Write,
    arr: &crate::variable::ArrayValue,
    indent: usize,
    constrained: bool,
) -> std::io::Result<()> {
    let pad = " ".repeat(indent);

    writeln!(out, "{pad}<{}/>", arr.elem.type_name())?;
    for dim in &arr.dims {
        let size = if constrained {
            dim.constrained_count()
        } else {
            dim.size
        };
        match &dim.name {
            Some(name) => writeln!(
                out,
                r#"{pad}<dimension name="{}" size="{size}"/>"#,
                escape_xml(name.as_str()),
            )?,
            None => writeln!(out, r#"{pad}<dimension size="{size}"/>"#)?,
        }
    }

    Ok(())
}

fn print_xml_var(
    out: &mut dyn Write,
    var: &Variable,
    indent: usize,
    constrained: bool,
) -> std::io::Result<()> {
    if constrained && !var.projected {
        return Ok(());
    }

    let pad = " ".repeat(indent);
    let name = escape_xml(var.name.as_str());

    match &var.value {
        Value::Array(arr) => {
            writeln!(out, r#"{pad}<Array name="{name}">"#)?;
            print_xml_attr_table(out, &var.attributes, indent + 4)?;
            print_xml_array_body(out, arr, indent + 4, constrained)?;
            writeln!(out, "{pad}</Array>")?;
        }
        Value::Structure(children) => {
            writeln!(out, r#"{pad}<Structure name="{name}">"#)?;
            print_xml_attr_table(out, &var.attributes, indent + 4)?;
            for child in children {
                print_xml_var(out, child, indent + 4, constrained)?;
            }
            writeln!(out, "{pad}</Structure>")?;
        }
        Value::Sequence(seq) => {
            writeln!(out, r#"{pad}<Sequence name="{name}">"#)?;
            print_xml_attr_table(out, &var.attributes, indent + 4)?;
            for field in &seq.fields {
                print_xml_var(out, field, indent + 4, constrained)?;
            }
            writeln!(out, "{pad}</Sequence>")?;
        }
        Value::Grid(grid) => {
            writeln!(out, r#"{pad}<Grid name="{name}">"#)?;
            print_xml_attr_table(out, &var.attributes, indent + 4)?;
            print_xml_var(out, &grid.array, indent + 4, constrained)?;
            for map in &grid.maps {
                let map_pad = " ".repeat(indent + 4);
                let Value::Array(arr) = &map.value else {
                    continue;
                };
                if constrained && !map.projected {
                    continue;
                }
                writeln!(
                    out,
                    r#"{map_pad}<Map name="{}">"#,
                    escape_xml(map.name.as_str()),
                )?;
                print_xml_attr_table(out, &map.attributes, indent + 8)?;
                print_xml_array_body(out, arr, indent + 8, constrained)?;
                writeln!(out, "{map_pad}</Map>")?;
            }
            writeln!(out, "{pad}</Grid>")?;
        }
        value => {
            if var.attributes.is_empty() {
                writeln!(out, "{pad}<{} name=\"{name}\"/>", value.type_name())?;
            } else {
                writeln!(out, "{pad}<{} name=\"{name}\">", value.type_name())?;
                print_xml_attr_table(out, &var.attributes, indent + 4)?;
                writeln!(out, "{pad}</{}>", value.type_name())?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttrType, Attribute};
    use crate::variable::{ArrayValue, Dimension, ScalarType, Slice};

    fn name(s: &str) -> VarName {
        VarName::try_from(s).unwrap()
    }

    fn sample() -> Dataset {
        let mut ds = Dataset::new("Sample");

        let mut t = Variable::new(name("t"), Value::Float64(Some(1.5)));
        t.attributes.push(Attribute::new(
            name("units"),
            AttrType::String,
            vec!["seconds".into()],
        ));
        ds.add_var(t).unwrap();

        let arr = ArrayValue::new(
            ScalarType::Int32,
            vec![Dimension::new(Some(name("time")), 10)],
        );
        ds.add_var(Variable::new(name("x"), Value::Array(arr)))
            .unwrap();

        ds
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut ds = sample();
        assert!(
            ds.add_var(Variable::new(name("t"), Value::Int32(None)))
                .is_err()
        );
    }

    #[test]
    fn test_print_dds_full() {
        let ds = sample();
        let mut out = Vec::new();
        ds.print_dds(&mut out, false).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Dataset {\n    Float64 t;\n    Int32 x[time = 10];\n} Sample;\n"
        );
    }

    #[test]
    fn test_print_dds_constrained() {
        let mut ds = sample();
        ds.mark_all(false);
        ds.vars_mut()[1].projected = true;
        if let Value::Array(arr) = &mut ds.vars_mut()[1].value {
            arr.dims[0].constraint = Some(Slice::new(0, 2, Some(8)));
        }

        let mut out = Vec::new();
        ds.print_dds(&mut out, true).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Dataset {\n    Int32 x[time = 5];\n} Sample;\n"
        );
    }

    #[test]
    fn test_print_das() {
        let ds = sample();
        let mut out = Vec::new();
        ds.print_das(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Attributes {\n    t {\n        String units \"seconds\";\n    }\n    x {\n    }\n}\n"
        );
    }

    #[test]
    fn test_print_xml_with_blob() {
        let mut ds = sample();
        ds.mark_all(true);

        let mut out = Vec::new();
        ds.print_xml(&mut out, true, "1234@opendap.org").unwrap();
        let xml = String::from_utf8(out).unwrap();

        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="ISO-8859-1"?>"#));
        assert!(xml.contains(r#"<Dataset name="Sample""#));
        assert!(xml.contains(r#"<Float64 name="t">"#));
        assert!(xml.contains(r#"<dimension name="time" size="10"/>"#));
        assert!(xml.contains(r#"<blob href="cid:1234@opendap.org"/>"#));
        assert!(xml.trim_end().ends_with("</Dataset>"));
    }

    #[test]
    fn test_var_by_path() {
        let mut ds = sample();
        let inner = Variable::new(name("temp"), Value::Float32(None));
        ds.add_var(Variable::new(
            name("station"),
            Value::Structure(vec![inner]),
        ))
        .unwrap();

        let path = [name("station"), name("temp")];
        assert!(ds.var_by_path(&path).is_some());
        assert!(ds.var_by_path(&[name("station"), name("none")]).is_none());
    }
}
