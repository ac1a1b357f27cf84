//! Little-endian primitives shared by the basis cache and coefficient
//! history files.

use std::io::{self, Read, Write};

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("length {len} exceeds u32")))?;
    write_u32(w, len)
}

pub fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_len(w, s.len())?;
    w.write_all(s.as_bytes())
}

pub fn write_f64_slice<W: Write>(w: &mut W, values: &[f64]) -> io::Result<()> {
    write_len(w, values.len())?;
    for &v in values {
        write_f64(w, v)?;
    }
    Ok(())
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_f64<R: Read>(r: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Strings longer than this are treated as corruption rather than
/// allocated.
const MAX_STR_LEN: u32 = 1 << 16;

pub fn read_str<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u32(r)?;
    if len > MAX_STR_LEN {
        return Err(invalid(format!("string length {len} is implausible")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| invalid(format!("string is not UTF-8: {e}")))
}

/// Reads a length-prefixed `f64` array whose length must equal `expected`.
pub fn read_f64_array<R: Read>(r: &mut R, expected: usize) -> io::Result<Vec<f64>> {
    let len = read_u32(r)? as usize;
    if len != expected {
        return Err(invalid(format!("array holds {len} values, expected {expected}")));
    }
    let mut bytes = vec![0u8; len * 8];
    r.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Succeeds only when the reader is exhausted.
pub fn expect_eof<R: Read>(r: &mut R) -> io::Result<()> {
    let mut buf = [0u8; 1];
    match r.read(&mut buf)? {
        0 => Ok(()),
        _ => Err(invalid("trailing bytes after last record".to_string())),
    }
}

pub fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
