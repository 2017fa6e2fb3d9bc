//! CDR decoding trait

use crate::reader::CdrReader;
use crate::Result;

/// Trait for types with a canonical CDR form, decoding side.
pub trait CdrDecode: Sized {
    fn cdr_decode(r: &mut CdrReader) -> Result<Self>;
}

// Primitive impls live next to their encode halves in encode.rs.

impl CdrDecode for u8 {
    fn cdr_decode(r: &mut CdrReader) -> Result<Self> {
        r.read_octet()
    }
}

impl CdrDecode for String {
    fn cdr_decode(r: &mut CdrReader) -> Result<Self> {
        r.read_string()
    }
}

impl<T: CdrDecode> CdrDecode for Vec<T> {
    fn cdr_decode(r: &mut CdrReader) -> Result<Self> {
        let count = r.read_seq_len(1)?;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(T::cdr_decode(r)?);
        }
        Ok(items)
    }
}
