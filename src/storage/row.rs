//! Fixed-width row codec.
//!
//! A row never crosses a page boundary, and every column reserves its full
//! width plus one terminator byte, so the encoded size is a compile-time
//! constant and cell offsets are plain multiplications.

use crate::errors::Error;
use std::fmt;

pub const ID_SIZE: usize = 4;
/// varchar(32) column plus a terminator byte.
pub const USERNAME_SIZE: usize = 32;
const USERNAME_FIELD_SIZE: usize = USERNAME_SIZE + 1;
/// varchar(255) column plus a terminator byte.
pub const EMAIL_SIZE: usize = 255;
const EMAIL_FIELD_SIZE: usize = EMAIL_SIZE + 1;

const USERNAME_OFFSET: usize = ID_SIZE;
const EMAIL_OFFSET: usize = USERNAME_OFFSET + USERNAME_FIELD_SIZE;
pub const ROW_SIZE: usize = ID_SIZE + USERNAME_FIELD_SIZE + EMAIL_FIELD_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: u32,
    pub username: String,
    pub email: String,
}

impl Row {
    pub fn new(id: u32, username: &str, email: &str) -> Self {
        Row {
            id,
            username: username.to_owned(),
            email: email.to_owned(),
        }
    }

    pub fn serialize(&self) -> Result<[u8; ROW_SIZE], Error> {
        if self.username.len() > USERNAME_SIZE {
            return Err(err!(
                Encoding,
                "username exceeds max length: {} > {}",
                self.username.len(),
                USERNAME_SIZE
            ));
        }
        if self.email.len() > EMAIL_SIZE {
            return Err(err!(
                Encoding,
                "email exceeds max length: {} > {}",
                self.email.len(),
                EMAIL_SIZE
            ));
        }

        let mut buf = [0u8; ROW_SIZE];
        buf[..ID_SIZE].copy_from_slice(&self.id.to_le_bytes());
        write_padded(&mut buf[USERNAME_OFFSET..EMAIL_OFFSET], &self.username);
        write_padded(&mut buf[EMAIL_OFFSET..], &self.email);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Row, Error> {
        if buf.len() != ROW_SIZE {
            return Err(err!(
                Encoding,
                "row size mismatch (expected={}, got={})",
                ROW_SIZE,
                buf.len()
            ));
        }
        let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let username = read_padded(&buf[USERNAME_OFFSET..EMAIL_OFFSET]);
        let email = read_padded(&buf[EMAIL_OFFSET..]);
        Ok(Row {
            id,
            username,
            email,
        })
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.id, self.username, self.email)
    }
}

fn write_padded(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    for b in buf[bytes.len()..].iter_mut() {
        *b = 0;
    }
}

fn read_padded(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_size() {
        assert_eq!(ROW_SIZE, 293);
    }

    #[test]
    fn test_roundtrip() {
        let row = Row::new(42, "user42", "person42@example.com");
        let buf = row.serialize().unwrap();
        assert_eq!(Row::deserialize(&buf).unwrap(), row);
    }

    #[test]
    fn test_max_length_fields() {
        let row = Row::new(1, &"a".repeat(32), &"b".repeat(255));
        let buf = row.serialize().unwrap();
        let back = Row::deserialize(&buf).unwrap();
        assert_eq!(back.username.len(), 32);
        assert_eq!(back.email.len(), 255);
    }

    #[test]
    fn test_oversize_rejected() {
        assert!(Row::new(1, &"a".repeat(33), "x").serialize().is_err());
        assert!(Row::new(1, "x", &"b".repeat(256)).serialize().is_err());
    }

    #[test]
    fn test_display() {
        let row = Row::new(1, "user1", "person1@example.com");
        assert_eq!(row.to_string(), "(1, user1, person1@example.com)");
    }

    #[test]
    fn test_padding_is_nul() {
        let row = Row::new(7, "ab", "c");
        let buf = row.serialize().unwrap();
        assert_eq!(&buf[USERNAME_OFFSET..USERNAME_OFFSET + 2], b"ab");
        assert!(buf[USERNAME_OFFSET + 2..EMAIL_OFFSET].iter().all(|b| *b == 0));
    }
}
