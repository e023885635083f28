//! Attribute tables.
//!
//! Every variable (and the dataset itself) carries an [`AttrTable`]: an ordered
//! list of typed attributes. A container attribute nests a further table, so a
//! table is a tree that parallels the variable tree without referencing it.

use std::io::Write;

use crate::core::VarName;
use crate::utils::escape_quoted;

/// The type of an attribute's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    String,
    Url,
    Container,
}

impl AttrType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Byte => "Byte",
            Self::Int16 => "Int16",
            Self::UInt16 => "UInt16",
            Self::Int32 => "Int32",
            Self::UInt32 => "UInt32",
            Self::Float32 => "Float32",
            Self::Float64 => "Float64",
            Self::String => "String",
            Self::Url => "Url",
            Self::Container => "Container",
        }
    }

    /// String and Url values are printed (and XML-emitted) quoted.
    pub fn is_quoted(&self) -> bool {
        matches!(self, Self::String | Self::Url)
    }
}

/// One attribute: a name, a type, and one or more values.
///
/// Values are kept in their external text form; the type tag says how clients
/// should interpret them.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: VarName,
    pub attr_type: AttrType,
    pub values: Vec<String>,
    /// Nested table; only used when `attr_type` is [`AttrType::Container`].
    pub table: Option<AttrTable>,
}

impl Attribute {
    pub fn new(name: VarName, attr_type: AttrType, values: Vec<String>) -> Self {
        Self {
            name,
            attr_type,
            values,
            table: None,
        }
    }

    pub fn container(name: VarName, table: AttrTable) -> Self {
        Self {
            name,
            attr_type: AttrType::Container,
            values: Vec::new(),
            table: Some(table),
        }
    }
}

/// An ordered attribute table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrTable {
    attrs: Vec<Attribute>,
}

impl AttrTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, attr: Attribute) {
        self.attrs.push(attr);
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    /// Print this table's entries in DAS form at the given indent level.
    pub fn print(&self, out: &mut dyn Write, indent: usize) -> std::io::Result<()> {
        let pad = " ".repeat(indent);

        for attr in &self.attrs {
            match (&attr.table, attr.attr_type) {
                (Some(table), AttrType::Container) => {
                    writeln!(out, "{pad}{} {{", attr.name)?;
                    table.print(out, indent + 4)?;
                    writeln!(out, "{pad}}}")?;
                }
                _ => {
                    let values = attr
                        .values
                        .iter()
                        .map(|v| {
                            if attr.attr_type.is_quoted() {
                                format!("\"{}\"", escape_quoted(v))
                            } else {
                                v.clone()
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(", ");

                    writeln!(out, "{pad}{} {} {values};", attr.attr_type.as_str(), attr.name)?;
                }
            }
        }

        Ok(())
    }
}

impl FromIterator<Attribute> for AttrTable {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        Self {
            attrs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> VarName {
        VarName::try_from(s).unwrap()
    }

    #[test]
    fn test_print_scalar_attributes() {
        let mut table = AttrTable::new();
        table.push(Attribute::new(
            name("units"),
            AttrType::String,
            vec!["seconds".into()],
        ));
        table.push(Attribute::new(
            name("valid_range"),
            AttrType::Int32,
            vec!["0".into(), "86400".into()],
        ));

        let mut out = Vec::new();
        table.print(&mut out, 4).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "    String units \"seconds\";\n    Int32 valid_range 0, 86400;\n"
        );
    }

    #[test]
    fn test_print_container() {
        let mut inner = AttrTable::new();
        inner.push(Attribute::new(
            name("title"),
            AttrType::String,
            vec!["Sample".into()],
        ));

        let mut table = AttrTable::new();
        table.push(Attribute::container(name("NC_GLOBAL"), inner));

        let mut out = Vec::new();
        table.print(&mut out, 0).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "NC_GLOBAL {\n    String title \"Sample\";\n}\n"
        );
    }
}
