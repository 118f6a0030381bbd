use std::mem::size_of;

use anyhow::anyhow;


//TODO `bytes` has fallible getters in recent versions - switch once we pin a version

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow: {} bytes remaining, {} required", self.remaining(), size_of::<$ty>()));
            }
            Ok(self.$getter())
        }
    }
}

/// Reading fixed size numbers (network byte order) from a buffer with an error instead of a
///  panic if the buffer is too short
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_read_u8, u8, get_u8);
    get_try_impl!(try_read_u32, u32, get_u32);
    get_try_impl!(try_read_u64, u64, get_u64);
}

impl <T: bytes::Buf> BufExt for T {
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::exact(b"\0\0\0\x05", Some(5), b"")]
    #[case::remainder(b"\x01\0\0\x02\x03", Some(0x01000002), b"\x03")]
    #[case::too_short(b"\0\0\x01", None, b"\0\0\x01")]
    #[case::empty(b"", None, b"")]
    fn test_try_read_u32(#[case] mut buf: &[u8], #[case] expected: Option<u32>, #[case] buf_after: &[u8]) {
        match buf.try_read_u32() {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(_) => assert!(expected.is_none()),
        }
        assert_eq!(buf, buf_after);
    }

    #[test]
    fn test_try_read_sequence() {
        let mut buf: &[u8] = b"\x07\0\0\0\0\0\0\0\x09";
        assert_eq!(buf.try_read_u8().unwrap(), 7);
        assert_eq!(buf.try_read_u64().unwrap(), 9);
        assert!(buf.try_read_u8().is_err());
    }
}
