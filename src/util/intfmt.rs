//! Fast integer formatting/parsing helpers used by the stats line codec.
use itoa::Buffer;

thread_local! {
    static U32BUF: std::cell::RefCell<Buffer> = std::cell::RefCell::new(Buffer::new());
    static U64BUF: std::cell::RefCell<Buffer> = std::cell::RefCell::new(Buffer::new());
    static I64BUF: std::cell::RefCell<Buffer> = std::cell::RefCell::new(Buffer::new());
}

#[inline]
pub fn push_u32(out: &mut Vec<u8>, v: u32) {
    U32BUF.with(|b| {
        let mut b = b.borrow_mut();
        out.extend_from_slice(b.format(v).as_bytes());
    });
}

#[inline]
pub fn push_u64(out: &mut Vec<u8>, v: u64) {
    U64BUF.with(|b| {
        let mut b = b.borrow_mut();
        out.extend_from_slice(b.format(v).as_bytes());
    });
}

#[inline]
pub fn push_i64(out: &mut Vec<u8>, v: i64) {
    I64BUF.with(|b| {
        let mut b = b.borrow_mut();
        out.extend_from_slice(b.format(v).as_bytes());
    });
}

#[inline]
pub fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while !s.is_empty() && s[0].is_ascii_whitespace() {
        s = &s[1..];
    }
    while !s.is_empty() && s[s.len() - 1].is_ascii_whitespace() {
        s = &s[..s.len() - 1];
    }
    s
}

#[inline]
pub fn parse_int<T>(b: Option<&[u8]>) -> T
where
    T: atoi::FromRadix10SignedChecked + Default,
{
    let s = trim_ascii(b.unwrap_or(b"0"));
    atoi::atoi::<T>(s).unwrap_or_default()
}
