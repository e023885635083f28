//! Response-kind and content-encoding tags.
//!
//! The string forms are wire values; they appear verbatim in the
//! `Content-Description` and `Content-Encoding` headers.

/// What a response carries, as advertised by `Content-Description`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Unknown,
    DodsDas,
    DodsDds,
    DodsData,
    DodsError,
    WebError,
    Dap4Ddx,
    Dap4Data,
    Dap4Error,
    Dap4DataDdx,
    DodsDdx,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::DodsDas => "dods_das",
            Self::DodsDds => "dods_dds",
            Self::DodsData => "dods_data",
            Self::DodsError => "dods_error",
            Self::WebError => "web_error",
            Self::Dap4Ddx => "dap4-ddx",
            Self::Dap4Data => "dap4-data",
            Self::Dap4Error => "dap4-error",
            Self::Dap4DataDdx => "dap4-data-ddx",
            Self::DodsDdx => "dods_ddx",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(Self::Unknown),
            "dods_das" => Some(Self::DodsDas),
            "dods_dds" => Some(Self::DodsDds),
            "dods_data" => Some(Self::DodsData),
            "dods_error" => Some(Self::DodsError),
            "web_error" => Some(Self::WebError),
            "dap4-ddx" => Some(Self::Dap4Ddx),
            "dap4-data" => Some(Self::Dap4Data),
            "dap4-error" => Some(Self::Dap4Error),
            "dap4-data-ddx" => Some(Self::Dap4DataDdx),
            "dods_ddx" => Some(Self::DodsDdx),
            _ => None,
        }
    }
}

/// How the payload is encoded, as advertised by `Content-Encoding`.
///
/// `x-plain` is the "no encoding" marker and is never written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingType {
    Unknown,
    Deflate,
    XPlain,
    Gzip,
    Binary,
}

impl EncodingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Deflate => "deflate",
            Self::XPlain => "x-plain",
            Self::Gzip => "gzip",
            Self::Binary => "binary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_round_trip() {
        for ty in [
            ObjectType::Unknown,
            ObjectType::DodsDas,
            ObjectType::DodsDds,
            ObjectType::DodsData,
            ObjectType::DodsError,
            ObjectType::WebError,
            ObjectType::Dap4Ddx,
            ObjectType::Dap4Data,
            ObjectType::Dap4Error,
            ObjectType::Dap4DataDdx,
            ObjectType::DodsDdx,
        ] {
            assert_eq!(ObjectType::parse(ty.as_str()), Some(ty));
        }
    }
}
