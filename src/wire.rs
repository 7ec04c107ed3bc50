//! Little-endian primitives shared by the index (de)serialisation code.
//!
//! The index envelope, the IBF and HIBF payloads and the threshold cache all
//! use the same fixed-width little-endian encoding; strings are length
//! prefixed UTF-8.

use std::io::{self, Read, Write};

pub(crate) fn write_u8(w: &mut impl Write, value: u8) -> io::Result<()> {
    w.write_all(&[value])
}

pub(crate) fn write_u32(w: &mut impl Write, value: u32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub(crate) fn write_u64(w: &mut impl Write, value: u64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub(crate) fn write_i64(w: &mut impl Write, value: i64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub(crate) fn write_f64(w: &mut impl Write, value: f64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub(crate) fn write_str(w: &mut impl Write, value: &str) -> io::Result<()> {
    write_u64(w, value.len() as u64)?;
    w.write_all(value.as_bytes())
}

pub(crate) fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_i64(r: &mut impl Read) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Reads a length-prefixed UTF-8 string; `limit` guards against reading an
/// absurd length from a corrupt stream.
pub(crate) fn read_str(r: &mut impl Read, limit: usize) -> io::Result<String> {
    let len = read_u64(r)? as usize;
    if len > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string length {} exceeds limit {}", len, limit),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
