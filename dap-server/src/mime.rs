//! MIME response framing.
//!
//! Every response opens with an HTTP/1.0 status line and a fixed header
//! sequence; multipart responses additionally frame their parts with boundary
//! lines and `Content-Id` headers. The byte layout here is load-bearing:
//! clients key off the exact header order and CRLF terminators.
//!
//! The reading half (`get_next_mime_header`, `read_multipart_*`) exists for
//! one consumer: pulling a cached DataDDX back off disk.

use std::io::{BufRead, Write};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use dap_types::DapError;
use dap_types::response::{EncodingType, ObjectType};

pub const CRLF: &str = "\r\n";

/// Server identity, sent in `XDODS-Server` and `XOPeNDAP-Server`.
const DVR: &str = concat!("dap-server/", env!("CARGO_PKG_VERSION"));

/// RFC-822 date string, always GMT.
pub fn rfc822_date(t: SystemTime) -> String {
    DateTime::<Utc>::from(t)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// A file's mtime, or the current time when the file cannot be stat'd
/// (virtual datasets).
pub fn last_modified_time(name: &str) -> SystemTime {
    std::fs::metadata(name)
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now())
}

/// Build a Content-Id value: a random UUID at this host, falling back to the
/// well-known domain when the host name is unusable.
pub fn generate_cid() -> String {
    let domain = gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "opendap.org".to_owned());

    format!("{}@{}", uuid::Uuid::new_v4(), domain)
}

/// Turn a `cid:` URI into the bracketed form used by the `Content-Id` header.
pub fn cid_to_header_value(cid: &str) -> String {
    format!("<{}>", cid.strip_prefix("cid:").unwrap_or(cid))
}

fn common_headers(
    out: &mut dyn Write,
    protocol: &str,
    last_modified: SystemTime,
) -> std::io::Result<()> {
    write!(out, "HTTP/1.0 200 OK{CRLF}")?;
    write!(out, "XDODS-Server: {DVR}{CRLF}")?;
    write!(out, "XOPeNDAP-Server: {DVR}{CRLF}")?;
    write!(out, "XDAP: {protocol}{CRLF}")?;
    write!(out, "Date: {}{CRLF}", rfc822_date(SystemTime::now()))?;
    write!(out, "Last-Modified: {}{CRLF}", rfc822_date(last_modified))
}

fn content_encoding(out: &mut dyn Write, enc: EncodingType) -> std::io::Result<()> {
    // x-plain is the "no encoding" marker; it never goes on the wire.
    if enc != EncodingType::XPlain {
        write!(out, "Content-Encoding: {}{CRLF}", enc.as_str())?;
    }
    Ok(())
}

/// Headers for a text response (DAS, DDS, DDX).
pub fn set_mime_text(
    out: &mut dyn Write,
    object_type: ObjectType,
    enc: EncodingType,
    last_modified: SystemTime,
    protocol: &str,
) -> std::io::Result<()> {
    common_headers(out, protocol, last_modified)?;

    if object_type == ObjectType::Dap4Ddx {
        write!(out, "Content-Type: text/xml{CRLF}")?;
    } else {
        write!(out, "Content-Type: text/plain{CRLF}")?;
    }

    write!(out, "Content-Description: {}{CRLF}", object_type.as_str())?;
    if object_type == ObjectType::DodsError {
        write!(out, "Cache-Control: no-cache{CRLF}")?;
    }
    content_encoding(out, enc)?;
    write!(out, "{CRLF}")
}

/// Headers for an HTML response (error pages and the like).
pub fn set_mime_html(
    out: &mut dyn Write,
    object_type: ObjectType,
    enc: EncodingType,
    last_modified: SystemTime,
    protocol: &str,
) -> std::io::Result<()> {
    common_headers(out, protocol, last_modified)?;

    write!(out, "Content-Type: text/html{CRLF}")?;
    write!(out, "Content-Description: {}{CRLF}", object_type.as_str())?;
    if object_type == ObjectType::DodsError {
        write!(out, "Cache-Control: no-cache{CRLF}")?;
    }
    content_encoding(out, enc)?;
    write!(out, "{CRLF}")
}

/// Headers for the binary DataDDS response.
pub fn set_mime_binary(
    out: &mut dyn Write,
    object_type: ObjectType,
    enc: EncodingType,
    last_modified: SystemTime,
    protocol: &str,
) -> std::io::Result<()> {
    common_headers(out, protocol, last_modified)?;

    write!(out, "Content-Type: application/octet-stream{CRLF}")?;
    write!(out, "Content-Description: {}{CRLF}", object_type.as_str())?;
    content_encoding(out, enc)?;
    write!(out, "{CRLF}")
}

/// Headers for the multipart DataDDX response.
pub fn set_mime_multipart(
    out: &mut dyn Write,
    boundary: &str,
    start: &str,
    object_type: ObjectType,
    enc: EncodingType,
    last_modified: SystemTime,
    protocol: &str,
) -> std::io::Result<()> {
    common_headers(out, protocol, last_modified)?;

    write!(
        out,
        "Content-Type: Multipart/Related; boundary={boundary}; \
         start=\"<{start}>\"; type=\"Text/xml\"{CRLF}"
    )?;
    write!(out, "Content-Description: {}{CRLF}", object_type.as_str())?;
    content_encoding(out, enc)?;
    write!(out, "{CRLF}")
}

/// Part headers for the DDX (XML) part of a multipart response.
pub fn set_mime_ddx_boundary(
    out: &mut dyn Write,
    boundary: &str,
    cid: &str,
    object_type: ObjectType,
    enc: EncodingType,
) -> std::io::Result<()> {
    write!(out, "--{boundary}{CRLF}")?;
    write!(out, "Content-Type: Text/xml; charset=iso-8859-1{CRLF}")?;
    write!(out, "Content-Id: <{cid}>{CRLF}")?;
    write!(out, "Content-Description: {}{CRLF}", object_type.as_str())?;
    content_encoding(out, enc)?;
    write!(out, "{CRLF}")
}

/// Part headers for the binary (blob) part of a multipart response.
pub fn set_mime_data_boundary(
    out: &mut dyn Write,
    boundary: &str,
    cid: &str,
    object_type: ObjectType,
    enc: EncodingType,
) -> std::io::Result<()> {
    write!(out, "--{boundary}{CRLF}")?;
    write!(out, "Content-Type: application/octet-stream{CRLF}")?;
    write!(out, "Content-Id: <{cid}>{CRLF}")?;
    write!(out, "Content-Description: {}{CRLF}", object_type.as_str())?;
    content_encoding(out, enc)?;
    write!(out, "{CRLF}")
}

/// Headers for an error response. No content type; never cached.
pub fn set_mime_error(
    out: &mut dyn Write,
    code: u16,
    reason: &str,
    protocol: &str,
) -> std::io::Result<()> {
    write!(out, "HTTP/1.0 {code} {reason}{CRLF}")?;
    write!(out, "XDODS-Server: {DVR}{CRLF}")?;
    write!(out, "XOPeNDAP-Server: {DVR}{CRLF}")?;
    write!(out, "XDAP: {protocol}{CRLF}")?;
    write!(out, "Date: {}{CRLF}", rfc822_date(SystemTime::now()))?;
    write!(out, "Cache-Control: no-cache{CRLF}")?;
    write!(out, "{CRLF}")
}

// ----- Reading (cache entries) -------------------------------------------------------------------

/// Read one line, tolerating both CRLF and bare LF. `None` at end of input.
pub fn read_line<R: BufRead>(input: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }

    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }

    Ok(Some(line))
}

/// Read one MIME header line; an empty string marks the end of the header
/// block.
pub fn get_next_mime_header<R: BufRead>(input: &mut R) -> std::io::Result<String> {
    Ok(read_line(input)?.unwrap_or_default())
}

/// True when `line` is the boundary (or closing boundary) named `boundary`.
pub fn is_boundary(line: &str, boundary: &str) -> bool {
    line.strip_prefix("--")
        .is_some_and(|rest| rest.trim_end_matches('-') == boundary)
}

/// Read up to the next `--boundary` line and return the boundary token.
pub fn read_multipart_boundary<R: BufRead>(input: &mut R) -> Result<String, DapError> {
    loop {
        let line = get_next_mime_header(input).map_err(|e| DapError::Cache(e.to_string()))?;
        if let Some(boundary) = line.strip_prefix("--") {
            if boundary.is_empty() {
                return Err(DapError::Cache("empty multipart boundary".to_owned()));
            }
            return Ok(boundary.trim_end_matches('-').to_owned());
        }
        if line.is_empty() {
            return Err(DapError::Cache(
                "multipart boundary not found".to_owned(),
            ));
        }
    }
}

/// Read a part's header block and check it announces the expected content
/// type, description, and (when given) Content-Id.
pub fn read_multipart_headers<R: BufRead>(
    input: &mut R,
    content_type: &str,
    object_type: ObjectType,
    cid: Option<&str>,
) -> Result<(), DapError> {
    let mut type_ok = false;
    let mut description_ok = false;
    let mut cid_ok = cid.is_none();

    loop {
        let line = get_next_mime_header(input).map_err(|e| DapError::Cache(e.to_string()))?;
        if line.is_empty() {
            break;
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match name.to_ascii_lowercase().as_str() {
            "content-type" => {
                type_ok = value.to_ascii_lowercase().starts_with(&content_type.to_ascii_lowercase());
            }
            "content-description" => {
                description_ok = ObjectType::parse(value) == Some(object_type);
            }
            "content-id" => {
                if let Some(expected) = cid {
                    cid_ok = value == expected;
                }
            }
            _ => {}
        }
    }

    if !(type_ok && description_ok && cid_ok) {
        return Err(DapError::Cache(format!(
            "malformed part headers; expected {content_type} / {}",
            object_type.as_str(),
        )));
    }

    Ok(())
}
