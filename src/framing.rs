//! Wire framing for the tracker protocol (spec.md §6).
//!
//! Integers are 4 raw little-endian bytes; strings and byte blobs are a
//! `u32` little-endian length prefix followed by the payload. This framing
//! is only used on the tracker connection — worker-to-worker channels carry
//! raw payloads with sizes fixed by the collective schedule (spec.md §4.2).

use crate::error::Result;
use std::io::{Read, Write};

pub fn write_u32(w: &mut impl Write, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_i32(w: &mut impl Write, value: i32) -> Result<()> {
    write_u32(w, value as u32)
}

pub fn read_i32(r: &mut impl Read) -> Result<i32> {
    Ok(read_u32(r)? as i32)
}

pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> Result<()> {
    write_u32(w, data.len() as u32)?;
    w.write_all(data)?;
    Ok(())
}

pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_str(w: &mut impl Write, s: &str) -> Result<()> {
    write_bytes(w, s.as_bytes())
}

pub fn read_str(r: &mut impl Read) -> Result<String> {
    let bytes = read_bytes(r)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_int() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -7).unwrap();
        assert_eq!(buf.len(), 4);
        let mut cur = Cursor::new(buf);
        assert_eq!(read_i32(&mut cur).unwrap(), -7);
    }

    #[test]
    fn roundtrip_str() {
        let mut buf = Vec::new();
        write_str(&mut buf, "hello world").unwrap();
        assert_eq!(buf.len(), 4 + 11);
        let mut cur = Cursor::new(buf);
        assert_eq!(read_str(&mut cur).unwrap(), "hello world");
    }

    #[test]
    fn roundtrip_bytes_empty() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[]).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_bytes(&mut cur).unwrap(), Vec::<u8>::new());
    }
}
