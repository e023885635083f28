//! Core data types.
//!
//! Variable and attribute names share one lexical rule, enforced by [`VarName`]:
//! the first byte is a letter or underscore, the rest are letters, digits, or
//! underscores. Constructing a `VarName` through `TryFrom` validates the input,
//! so everything downstream can rely on a well-formed identifier.

use std::borrow::Cow;
use std::fmt::{Display, Formatter};

use crate::error::{ValidationError, ValidationErrorKind};

pub(crate) fn is_name_start_char(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

pub(crate) fn is_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// A variable (or attribute) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct VarName(pub(crate) String);

impl VarName {
    pub fn verify(value: impl AsRef<[u8]>) -> Result<(), ValidationError> {
        let value = value.as_ref();

        match value.first() {
            None => return Err(ValidationError::new(ValidationErrorKind::Empty)),
            Some(byte) if !is_name_start_char(*byte) => {
                return Err(ValidationError::new(ValidationErrorKind::InvalidByteAt {
                    byte: *byte,
                    at: 0,
                }));
            }
            Some(_) => {}
        }

        if let Some(at) = value.iter().position(|b| !is_name_char(*b)) {
            return Err(ValidationError::new(ValidationErrorKind::InvalidByteAt {
                byte: value[at],
                at,
            }));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for VarName {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for VarName {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::verify(value)?;

        Ok(Self(value.to_owned()))
    }
}

impl TryFrom<String> for VarName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::verify(&value)?;

        Ok(Self(value))
    }
}

impl<'a> TryFrom<Cow<'a, str>> for VarName {
    type Error = ValidationError;

    fn try_from(value: Cow<'a, str>) -> Result<Self, Self::Error> {
        Self::verify(value.as_bytes())?;

        Ok(Self(value.into_owned()))
    }
}

impl AsRef<str> for VarName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<&str> for VarName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A recognized request keyword.
///
/// Keywords lead the constraint expression (`dap4.0,u,v`). Tokens outside this
/// set are not keywords and fall through into the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub enum Keyword {
    Dap2,
    Dap2_0,
    Dap3_2,
    Dap4,
    Dap4_0,
}

impl Keyword {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "dap2" => Some(Self::Dap2),
            "dap2.0" => Some(Self::Dap2_0),
            "dap3.2" => Some(Self::Dap3_2),
            "dap4" => Some(Self::Dap4),
            "dap4.0" => Some(Self::Dap4_0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dap2 => "dap2",
            Self::Dap2_0 => "dap2.0",
            Self::Dap3_2 => "dap3.2",
            Self::Dap4 => "dap4",
            Self::Dap4_0 => "dap4.0",
        }
    }

    /// The protocol version a keyword selects.
    pub fn dap_version(&self) -> &'static str {
        match self {
            Self::Dap2 | Self::Dap2_0 => "2.0",
            Self::Dap3_2 => "3.2",
            Self::Dap4 | Self::Dap4_0 => "4.0",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_name_verify() {
        assert!(VarName::verify("t").is_ok());
        assert!(VarName::verify("_sst_4km").is_ok());
        assert!(VarName::verify("").is_err());
        assert!(VarName::verify("4km").is_err());
        assert!(VarName::verify("u-v").is_err());
        assert!(VarName::verify("u v").is_err());
    }

    #[test]
    fn test_keyword_parse() {
        assert_eq!(Keyword::parse("dap4.0"), Some(Keyword::Dap4_0));
        assert_eq!(Keyword::parse("dap4"), Some(Keyword::Dap4));
        assert_eq!(Keyword::Dap4.dap_version(), "4.0");
        assert_eq!(Keyword::Dap3_2.dap_version(), "3.2");
        // Not keywords; these stay in the projection.
        assert_eq!(Keyword::parse("dap5"), None);
        assert_eq!(Keyword::parse("DAP4"), None);
    }
}
