use bytes::BufMut;
use uuid::Uuid;

/// Integer signess on the wire is awful.
pub trait UsizeExt {
    /// length is usize in rust, while the protocol want i32,
    /// this will panic when overflow instead of wrapping
    fn to_i32(self) -> i32;
    /// length is usize in rust, while sometime the protocol want u16,
    /// this will panic when overflow instead of wrapping
    fn to_u16(self) -> u16;
}

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        match i32::try_from(self) {
            Ok(ok) => ok,
            Err(err) => panic!("message size too large for protocol: {err}"),
        }
    }

    fn to_u16(self) -> u16 {
        match u16::try_from(self) {
            Ok(ok) => ok,
            Err(err) => panic!("message size too large for protocol: {err}"),
        }
    }
}

pub trait BufMutExt {
    /// protocol byte string is `i32` length prefixed
    fn put_len_bytes(&mut self, bytes: &[u8]);

    /// protocol String is `i32` length prefixed utf8
    fn put_len_str(&mut self, string: &str);

    /// uuids are raw 16 bytes
    fn put_uuid(&mut self, id: Uuid);
}

impl<B: BufMut> BufMutExt for B {
    fn put_len_bytes(&mut self, bytes: &[u8]) {
        self.put_i32(bytes.len().to_i32());
        self.put(bytes);
    }

    fn put_len_str(&mut self, string: &str) {
        self.put_len_bytes(string.as_bytes());
    }

    fn put_uuid(&mut self, id: Uuid) {
        self.put_slice(id.as_bytes());
    }
}
