//! CDR encoding trait

use crate::writer::CdrWriter;
use crate::Result;

/// Trait for types with a canonical CDR form.
///
/// Alignment is handled by the writer, so implementations only state the
/// order of their parts. Sequences encode as a u32 element count followed
/// by the elements.
pub trait CdrEncode {
    fn cdr_encode(&self, w: &mut CdrWriter) -> Result<()>;
}

// Primitives map onto the writer directly.
macro_rules! impl_cdr_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl CdrEncode for $ty {
            fn cdr_encode(&self, w: &mut CdrWriter) -> Result<()> {
                w.$write(*self);
                Ok(())
            }
        }

        impl crate::decode::CdrDecode for $ty {
            fn cdr_decode(r: &mut crate::reader::CdrReader) -> Result<Self> {
                r.$read()
            }
        }
    };
}

impl_cdr_primitive!(bool, write_bool, read_bool);
impl_cdr_primitive!(u16, write_u16, read_u16);
impl_cdr_primitive!(i16, write_i16, read_i16);
impl_cdr_primitive!(u32, write_u32, read_u32);
impl_cdr_primitive!(i32, write_i32, read_i32);
impl_cdr_primitive!(u64, write_u64, read_u64);
impl_cdr_primitive!(i64, write_i64, read_i64);
impl_cdr_primitive!(f32, write_f32, read_f32);
impl_cdr_primitive!(f64, write_f64, read_f64);

impl CdrEncode for u8 {
    fn cdr_encode(&self, w: &mut CdrWriter) -> Result<()> {
        w.write_octet(*self);
        Ok(())
    }
}

impl CdrEncode for String {
    fn cdr_encode(&self, w: &mut CdrWriter) -> Result<()> {
        w.write_string(self);
        Ok(())
    }
}

impl CdrEncode for &str {
    fn cdr_encode(&self, w: &mut CdrWriter) -> Result<()> {
        w.write_string(self);
        Ok(())
    }
}

impl<T: CdrEncode> CdrEncode for Vec<T> {
    fn cdr_encode(&self, w: &mut CdrWriter) -> Result<()> {
        w.write_u32(self.len() as u32);
        for item in self {
            item.cdr_encode(w)?;
        }
        Ok(())
    }
}
