//! Record codec (spec §4.B): a compact variable-length integer encoding for
//! `GUTA`s and directory child-name lists, plus the on-disk key format.
use crate::error::DgutaError;

/// A single aggregation cell for one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guta {
    pub gid: u32,
    pub uid: u32,
    pub ft: u16,
    pub age: u8,
    pub count: u64,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
}

/// The terminator byte appended to a materialised directory path to form a
/// GUTA-map key. `0x00` cannot appear in a POSIX path and sorts below every
/// other path byte, so a directory's own record key always sorts before its
/// children's keys (a `0xFF` terminator would sort the other way: it's the
/// maximum byte value, so comparison falls through to the children's extra
/// path bytes, which always beat it).
pub const KEY_TERMINATOR: u8 = 0x00;

/// Build the GUTA-map key for a directory path (trailing `/` expected).
pub fn guta_key(dir: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(dir.len() + 1);
    key.extend_from_slice(dir.as_bytes());
    key.push(KEY_TERMINATOR);
    key
}

/// Build the Children-map key for a directory path (trailing `/` expected).
pub fn children_key(dir: &str) -> Vec<u8> {
    dir.as_bytes().to_vec()
}

#[inline]
fn push_varint_u64(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint_u64(buf: &[u8], pos: &mut usize) -> Result<u64, DgutaError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| DgutaError::StoreIntegrity("truncated varint".to_string()))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(DgutaError::StoreIntegrity("varint too long".to_string()));
        }
    }
    Ok(result)
}

#[inline]
fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn push_signed(out: &mut Vec<u8>, v: i64) {
    push_varint_u64(out, zigzag_encode(v));
}

fn read_signed(buf: &[u8], pos: &mut usize) -> Result<i64, DgutaError> {
    Ok(zigzag_decode(read_varint_u64(buf, pos)?))
}

/// Encode one GUTA: `GID, UID, FT (16-bit fixed), Age (8-bit fixed), Count,
/// Size, Atime, Mtime` in that fixed field order.
pub fn encode_guta(out: &mut Vec<u8>, g: &Guta) {
    push_varint_u64(out, g.gid as u64);
    push_varint_u64(out, g.uid as u64);
    out.extend_from_slice(&g.ft.to_le_bytes());
    out.push(g.age);
    push_varint_u64(out, g.count);
    push_varint_u64(out, g.size);
    push_signed(out, g.atime);
    push_signed(out, g.mtime);
}

fn decode_guta(buf: &[u8], pos: &mut usize) -> Result<Guta, DgutaError> {
    let gid = read_varint_u64(buf, pos)? as u32;
    let uid = read_varint_u64(buf, pos)? as u32;
    let ft_bytes = buf
        .get(*pos..*pos + 2)
        .ok_or_else(|| DgutaError::StoreIntegrity("truncated FT field".to_string()))?;
    let ft = u16::from_le_bytes([ft_bytes[0], ft_bytes[1]]);
    *pos += 2;
    let age = *buf
        .get(*pos)
        .ok_or_else(|| DgutaError::StoreIntegrity("truncated Age field".to_string()))?;
    *pos += 1;
    let count = read_varint_u64(buf, pos)?;
    let size = read_varint_u64(buf, pos)?;
    let atime = read_signed(buf, pos)?;
    let mtime = read_signed(buf, pos)?;
    Ok(Guta {
        gid,
        uid,
        ft,
        age,
        count,
        size,
        atime,
        mtime,
    })
}

/// Encode a length-prefixed sequence of GUTAs.
pub fn encode_gutas(gutas: &[Guta]) -> Vec<u8> {
    let mut out = Vec::new();
    push_varint_u64(&mut out, gutas.len() as u64);
    for g in gutas {
        encode_guta(&mut out, g);
    }
    out
}

/// Decode a length-prefixed sequence of GUTAs.
pub fn decode_gutas(buf: &[u8]) -> Result<Vec<Guta>, DgutaError> {
    let mut pos = 0usize;
    let n = read_varint_u64(buf, &mut pos)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(decode_guta(buf, &mut pos)?);
    }
    Ok(out)
}

/// Encode a length-prefixed list of child segment names.
pub fn encode_children(children: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    push_varint_u64(&mut out, children.len() as u64);
    for name in children {
        let bytes = name.as_bytes();
        push_varint_u64(&mut out, bytes.len() as u64);
        out.extend_from_slice(bytes);
    }
    out
}

/// Decode a length-prefixed list of child segment names.
pub fn decode_children(buf: &[u8]) -> Result<Vec<String>, DgutaError> {
    let mut pos = 0usize;
    let n = read_varint_u64(buf, &mut pos)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let len = read_varint_u64(buf, &mut pos)? as usize;
        let bytes = buf
            .get(pos..pos + len)
            .ok_or_else(|| DgutaError::StoreIntegrity("truncated child name".to_string()))?;
        out.push(String::from_utf8_lossy(bytes).into_owned());
        pos += len;
    }
    Ok(out)
}
