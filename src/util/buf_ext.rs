use anyhow::bail;
use bytes::Bytes;


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow");
            }
            Ok(self.$getter())
        }
    }
}


/// Bounds-checked reads for parsing untrusted datagrams: [bytes::Buf]'s getters panic on
///  underflow.
pub trait BufExt: bytes::Buf {
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_u16, u16, get_u16);

    fn checked_copy_to_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            bail!("buffer underflow: {} bytes required, {} remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }
}

impl <T: bytes::Buf> BufExt for T {
}
