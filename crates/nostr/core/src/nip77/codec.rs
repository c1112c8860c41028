use super::error::{Nip77Error, Result};

/// Encode a varint (variable-length unsigned integer)
///
/// Varints are represented as base-128 digits, most significant digit first.
/// Bit 7 (high bit) is set on each byte except the last.
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    put_varint(&mut bytes, value);
    bytes
}

/// Append the varint encoding of `value` to `out`.
pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut digits = [0u8; 10];
    let mut len = 0;
    loop {
        digits[len] = (value & 0x7F) as u8;
        len += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }

    for i in (0..len).rev() {
        let high = if i == 0 { 0 } else { 0x80 };
        out.push(digits[i] | high);
    }
}

/// Decode a varint from a byte slice
///
/// Returns (value, bytes_consumed)
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    if data.is_empty() {
        return Err(Nip77Error::VarintDecode("empty data".to_string()));
    }

    let mut value: u64 = 0;
    for (index, &byte) in data.iter().enumerate() {
        if index >= 10 || value > (u64::MAX >> 7) {
            return Err(Nip77Error::VarintDecode("varint overflow".to_string()));
        }

        value = (value << 7) | u64::from(byte & 0x7F);
        if (byte & 0x80) == 0 {
            return Ok((value, index + 1));
        }
    }

    Err(Nip77Error::VarintDecode("incomplete varint".to_string()))
}

/// Forward-only cursor over an incoming message.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn byte(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn varint(&mut self) -> Result<u64> {
        let (value, consumed) = decode_varint(self.data)?;
        self.data = &self.data[consumed..];
        Ok(value)
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() < len {
            return Err(Nip77Error::Truncated {
                needed: len,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }
}
