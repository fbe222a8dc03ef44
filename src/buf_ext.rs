use std::collections::BTreeMap;

use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::wal::Lsn;

/// Microseconds between the unix epoch (1970-01-01) and the postgres epoch
/// (2000-01-01). Wire timestamps count from the latter.
pub(crate) const POSTGRES_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Checked big-endian reads over a frame buffer. Every read fails with
/// [`Error::Truncated`] instead of panicking when the frame is short.
pub trait BufExt: Buf {
  fn pg_get_u8(&mut self) -> Result<u8> {
    if self.remaining() < 1 {
      return Err(Error::Truncated("u8"));
    }
    Ok(self.get_u8())
  }

  fn pg_get_i8(&mut self) -> Result<i8> {
    if self.remaining() < 1 {
      return Err(Error::Truncated("i8"));
    }
    Ok(self.get_i8())
  }

  fn pg_get_u16(&mut self) -> Result<u16> {
    if self.remaining() < 2 {
      return Err(Error::Truncated("u16"));
    }
    Ok(self.get_u16())
  }

  fn pg_get_i16(&mut self) -> Result<i16> {
    if self.remaining() < 2 {
      return Err(Error::Truncated("i16"));
    }
    Ok(self.get_i16())
  }

  fn pg_get_u32(&mut self) -> Result<u32> {
    if self.remaining() < 4 {
      return Err(Error::Truncated("u32"));
    }
    Ok(self.get_u32())
  }

  fn pg_get_i32(&mut self) -> Result<i32> {
    if self.remaining() < 4 {
      return Err(Error::Truncated("i32"));
    }
    Ok(self.get_i32())
  }

  fn pg_get_u64(&mut self) -> Result<u64> {
    if self.remaining() < 8 {
      return Err(Error::Truncated("u64"));
    }
    Ok(self.get_u64())
  }

  fn pg_get_i64(&mut self) -> Result<i64> {
    if self.remaining() < 8 {
      return Err(Error::Truncated("i64"));
    }
    Ok(self.get_i64())
  }

  fn pg_get_bytes(&mut self, len: usize) -> Result<Bytes> {
    if self.remaining() < len {
      return Err(Error::Truncated("bytes"));
    }
    Ok(self.copy_to_bytes(len))
  }

  /// Bytes up to (not including) the next NUL, terminator consumed.
  fn pg_get_cstr(&mut self) -> Result<String> {
    match self.chunk().iter().position(|b| *b == 0x00) {
      Some(len) => {
        let mut buffer = vec![0; len];
        self.copy_to_slice(buffer.as_mut_slice());
        self.advance(1);
        String::from_utf8(buffer).map_err(|_| Error::protocol("string is not valid utf-8"))
      }
      None => Err(Error::Truncated("cstring")),
    }
  }

  fn pg_get_str(&mut self, len: usize) -> Result<String> {
    if self.remaining() < len {
      return Err(Error::Truncated("string"));
    }
    let mut buffer = vec![0; len];
    self.copy_to_slice(buffer.as_mut_slice());
    String::from_utf8(buffer).map_err(|_| Error::protocol("string is not valid utf-8"))
  }

  /// 32-bit length followed by that many utf-8 bytes.
  fn pg_get_prefixed_str(&mut self) -> Result<String> {
    let len = self.pg_get_i32()?;
    let len = usize::try_from(len).map_err(|_| Error::protocol(format!("negative string length {len}")))?;
    self.pg_get_str(len)
  }

  fn pg_get_lsn(&mut self) -> Result<Lsn> {
    let hi = self.pg_get_u32()?;
    let lo = self.pg_get_u32()?;
    Ok(Lsn::from_parts(hi, lo))
  }

  /// Microseconds since the postgres epoch, as calendar time.
  fn pg_get_timestamp(&mut self) -> Result<DateTime<Utc>> {
    let micros = self.pg_get_i64()?;
    DateTime::from_timestamp_micros(micros + POSTGRES_EPOCH_MICROS)
      .ok_or_else(|| Error::protocol(format!("timestamp {micros} is out of range")))
  }

  /// Identified fields of an ErrorResponse/NoticeResponse, keyed by field
  /// type, up to the zero terminator.
  fn pg_get_fields(&mut self) -> Result<BTreeMap<char, String>> {
    let mut fields = BTreeMap::new();
    loop {
      match self.pg_get_u8()? {
        0 => break,
        token => {
          let value = self.pg_get_cstr()?;
          fields.insert(char::from(token), value);
        }
      }
    }
    Ok(fields)
  }

  fn pg_get_backend_error(&mut self) -> Error {
    match self.pg_get_fields() {
      Ok(fields) => match (fields.get(&'C'), fields.get(&'M')) {
        (Some(code), Some(message)) => Error::Backend {
          code: code.clone(),
          message: message.clone(),
        },
        (_, _) => Error::protocol("error response is missing code or message fields"),
      },
      Err(err) => err,
    }
  }

  fn pg_get_backend_notice(&mut self) -> Option<String> {
    let fields = self.pg_get_fields().ok()?;
    match (fields.get(&'S'), fields.get(&'M')) {
      (Some(severity), Some(message)) => Some(format!("{severity}: {message}")),
      (_, _) => None,
    }
  }
}

impl<T> BufExt for T where T: Buf {}
