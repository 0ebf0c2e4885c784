//! Little-endian element encoding for moving tensor data between clients.

/// Fixed-width little-endian encoding of one element. Decoding an encoded element returns
/// the same bits, including NaN payloads and infinities.
pub trait ElemBytes: Sized {
    const WIDTH: usize;

    fn write_le(&self, out: &mut Vec<u8>);

    /// Decodes from exactly [`Self::WIDTH`] bytes; returns `None` for any other length.
    fn read_le(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_elem_bytes {
    ($($ty:ty),*) => {
        $(
            impl ElemBytes for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Option<Self> {
                    Some(<$ty>::from_le_bytes(bytes.try_into().ok()?))
                }
            }
        )*
    };
}

impl_elem_bytes!(f32, f64, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// Encodes `values` back to back.
pub fn encode_le<T: ElemBytes>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::WIDTH);
    for v in values {
        v.write_le(&mut out);
    }
    out
}

/// Decodes a buffer written by [`encode_le`]; `None` if its length is not a whole number of
/// elements.
pub fn decode_le<T: ElemBytes>(bytes: &[u8]) -> Option<Vec<T>> {
    if T::WIDTH == 0 || bytes.len() % T::WIDTH != 0 {
        return None;
    }
    bytes.chunks_exact(T::WIDTH).map(T::read_le).collect()
}
