use std::{fmt, io, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::buf_ext::{BufExt, POSTGRES_EPOCH_MICROS};
use crate::error::{Error, Result};
use crate::pgoutput::{ChangeEvent, Decoder, Relation};
use crate::stream::Stream;

/// A log sequence number: a byte offset into the write-ahead log. The
/// textual form is `H/L`, both halves uppercase hex with at least one digit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
  /// Starts streaming from the slot's restart point.
  pub const ZERO: Lsn = Lsn(0);

  pub fn from_parts(hi: u32, lo: u32) -> Self {
    Self((u64::from(hi) << 32) | u64::from(lo))
  }

  pub fn hi(self) -> u32 {
    (self.0 >> 32) as u32
  }

  pub fn lo(self) -> u32 {
    self.0 as u32
  }

  /// The position after the last acknowledged byte. Incrementing the low
  /// half carries into the high half, which is plain u64 arithmetic here.
  pub(crate) fn advance(self) -> Self {
    Self(self.0.wrapping_add(1))
  }
}

impl fmt::Display for Lsn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:X}/{:X}", self.hi(), self.lo())
  }
}

impl fmt::Debug for Lsn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

impl Serialize for Lsn {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl FromStr for Lsn {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let (hi, lo) = s.split_once('/').ok_or_else(|| Error::InvalidLsn(s.to_string()))?;
    let hi = u32::from_str_radix(hi, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
    Ok(Self::from_parts(hi, lo))
  }
}

/// One frame pulled off the replication stream: either a primary keepalive
/// or a wal message decoded through pgoutput.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalEvent {
  Keepalive {
    current_lsn: Lsn,
    system_time: DateTime<Utc>,
    /// The server would like a standby status update soon. Whether to send
    /// one is the caller's policy.
    must_reply: bool,
  },
  Data {
    message_lsn: Lsn,
    current_lsn: Lsn,
    system_time: DateTime<Utc>,
    change: ChangeEvent,
  },
}

/// Standby status update payload: all three wal positions set to the byte
/// after `lsn`, client clock on the postgres epoch, no reply requested.
pub(crate) fn encode_status_update(lsn: Lsn, clock: DateTime<Utc>) -> [u8; 34] {
  let confirmed = lsn.advance().0.to_be_bytes();
  let micros = (clock.timestamp_micros() - POSTGRES_EPOCH_MICROS).to_be_bytes();

  let mut payload = [0u8; 34];
  payload[0] = b'r';
  payload[1..9].copy_from_slice(&confirmed); // received + written
  payload[9..17].copy_from_slice(&confirmed); // flushed
  payload[17..25].copy_from_slice(&confirmed); // applied
  payload[25..33].copy_from_slice(&micros);
  payload[33] = 0;
  payload
}

/// The outer CopyData envelope: dispatch keepalive vs. wal data, delegating
/// wal payloads to the pgoutput decoder.
fn decode_wal_frame(decoder: &mut Decoder, buffer: &mut Bytes) -> Result<WalEvent> {
  match buffer.pg_get_u8()? {
    b'k' => Ok(WalEvent::Keepalive {
      current_lsn: buffer.pg_get_lsn()?,
      system_time: buffer.pg_get_timestamp()?,
      must_reply: buffer.pg_get_u8()? == 1,
    }),
    b'w' => Ok(WalEvent::Data {
      message_lsn: buffer.pg_get_lsn()?,
      current_lsn: buffer.pg_get_lsn()?,
      system_time: buffer.pg_get_timestamp()?,
      change: decoder.decode(buffer)?,
    }),
    tag => Err(Error::protocol(format!(
      "unexpected wal frame tag {:?}",
      char::from(tag)
    ))),
  }
}

/// A CopyBoth replication session after `START_REPLICATION`.
///
/// The stream is pull-driven: the socket is only read inside [`recv`], one
/// CopyData frame per call, so the server sees TCP backpressure whenever the
/// consumer stops pulling. Acknowledgements go out on the writable half at
/// any time and do not interact with pulls.
///
/// [`recv`]: ReplicationStream::recv
#[derive(Debug)]
pub struct ReplicationStream {
  stream: Stream,
  decoder: Decoder,
  done: bool,
}

impl ReplicationStream {
  pub(crate) fn new(stream: Stream, decoder: Decoder) -> Self {
    Self {
      stream,
      decoder,
      done: false,
    }
  }

  /// The decoder's cached snapshot for a relation oid.
  pub fn relation(&self, oid: u32) -> Option<&std::sync::Arc<Relation>> {
    self.decoder.relation(oid)
  }

  /// Pull the next frame. `None` means the stream ended cleanly: the server
  /// finished the copy, the connection closed, or an earlier error already
  /// ended the session.
  pub async fn recv(&mut self) -> Option<Result<WalEvent>> {
    if self.done {
      return None;
    }

    loop {
      let (op, mut buffer) = match self.stream.read_packet().await {
        Ok(packet) => packet,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
          // The server hung up without an error: a clean end.
          self.done = true;
          return None;
        }
        Err(err) => {
          self.done = true;
          return Some(Err(err.into()));
        }
      };

      match op {
        b'd' => match decode_wal_frame(&mut self.decoder, &mut buffer) {
          Ok(event) => return Some(Ok(event)),
          Err(err) => {
            self.done = true;
            return Some(Err(err));
          }
        },
        b'c' => {
          // Server-side CopyDone. Reply in kind so the command can finish,
          // then end the stream without surfacing the command tail.
          self.done = true;
          if let Err(err) = self.write_copy_done().await {
            return Some(Err(err.into()));
          }
          return None;
        }
        b'E' => {
          self.done = true;
          return Some(Err(buffer.pg_get_backend_error()));
        }
        b'N' => {
          if let Some(notice) = buffer.pg_get_backend_notice() {
            debug!(%notice, "backend notice");
          }
        }
        b'C' | b'Z' | b'S' => {
          // Command tail after CopyDone, or a runtime parameter report.
        }
        code => {
          self.done = true;
          return Some(Err(Error::protocol(format!(
            "unexpected message {:?} on replication stream",
            char::from(code)
          ))));
        }
      }
    }
  }

  /// Report `lsn` as received, flushed and applied, advancing the slot's
  /// confirmed position to the byte after it. Acknowledging `lsn` implies
  /// every position before it; skipping acknowledgements is always safe.
  pub async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
    let payload = encode_status_update(lsn, Utc::now());
    debug!(%lsn, "standby status update");

    self.stream.write_u8(b'd').await?;
    self.stream.write_i32((4 + payload.len()) as i32).await?;
    self.stream.write_all(&payload).await?;
    self.stream.flush().await?;
    Ok(())
  }

  async fn write_copy_done(&mut self) -> io::Result<()> {
    self.stream.write_u8(b'c').await?;
    self.stream.write_i32(4).await?;
    self.stream.flush().await
  }

  /// End the session: leave copy mode, terminate the connection, close the
  /// socket. Ownership makes disposal one-shot, and transport failures on
  /// the way out are not surfaced.
  pub async fn close(mut self) -> Result<()> {
    let _ = self.write_copy_done().await;
    let _ = async {
      self.stream.write_u8(b'X').await?;
      self.stream.write_i32(4).await?;
      self.stream.flush().await
    }
    .await;
    let _ = self.stream.shutdown().await;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::Value;

  #[test]
  fn lsn_parses_and_formats_hex_halves() {
    let lsn: Lsn = "16/B374D848".parse().unwrap();
    assert_eq!(lsn.hi(), 0x16);
    assert_eq!(lsn.lo(), 0xB374_D848);
    assert_eq!(lsn.to_string(), "16/B374D848");
    assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::ZERO);
  }

  #[test]
  fn lsn_rejects_malformed_input() {
    assert!(matches!("16B3748".parse::<Lsn>(), Err(Error::InvalidLsn(_))));
    assert!(matches!("x/1".parse::<Lsn>(), Err(Error::InvalidLsn(_))));
    assert!(matches!("1/".parse::<Lsn>(), Err(Error::InvalidLsn(_))));
  }

  #[test]
  fn lsn_orders_by_high_then_low_half() {
    let low: Lsn = "0/FFFFFFFF".parse().unwrap();
    let high: Lsn = "1/0".parse().unwrap();
    assert!(low < high);
  }

  #[test]
  fn status_update_layout() {
    let payload = encode_status_update(Lsn::from_parts(0x16, 0xB374_D848), Utc::now());

    assert_eq!(payload.len(), 34);
    assert_eq!(payload[0], 0x72);
    assert_eq!(payload[33], 0x00);

    let expected = Lsn::from_parts(0x16, 0xB374_D849).0.to_be_bytes();
    assert_eq!(&payload[1..9], &expected);
    assert_eq!(&payload[9..17], &expected);
    assert_eq!(&payload[17..25], &expected);
  }

  #[test]
  fn status_update_carries_into_the_high_half() {
    let payload = encode_status_update(Lsn::from_parts(0x16, 0xFFFF_FFFF), Utc::now());
    let expected = Lsn::from_parts(0x17, 0).0.to_be_bytes();
    assert_eq!(&payload[1..9], &expected);
  }

  #[test]
  fn status_update_clock_is_on_the_postgres_epoch() {
    let clock = Utc::now();
    let payload = encode_status_update(Lsn::ZERO, clock);
    let micros = i64::from_be_bytes(payload[25..33].try_into().unwrap());
    assert_eq!(micros, clock.timestamp_micros() - POSTGRES_EPOCH_MICROS);
  }

  fn keepalive_frame(must_reply: u8) -> Bytes {
    let mut frame = vec![b'k'];
    frame.extend_from_slice(&0x16B_3748u64.to_be_bytes());
    frame.extend_from_slice(&1_000_000i64.to_be_bytes());
    frame.push(must_reply);
    Bytes::from(frame)
  }

  #[test]
  fn keepalive_envelope() {
    let mut decoder = Decoder::new();
    let mut buffer = keepalive_frame(1);

    match decode_wal_frame(&mut decoder, &mut buffer).unwrap() {
      WalEvent::Keepalive {
        current_lsn,
        must_reply,
        ..
      } => {
        assert_eq!(current_lsn.to_string(), "0/16B3748");
        assert!(must_reply);
      }
      event => panic!("expected keepalive, got {:?}", event),
    }
    assert!(buffer.is_empty());
  }

  #[test]
  fn waldata_envelope_delegates_to_pgoutput() {
    let mut decoder = Decoder::new();

    let mut frame = vec![b'w'];
    frame.extend_from_slice(&0x10u64.to_be_bytes());
    frame.extend_from_slice(&0x20u64.to_be_bytes());
    frame.extend_from_slice(&2_000_000i64.to_be_bytes());
    frame.push(b'B');
    frame.extend_from_slice(&0x30u64.to_be_bytes());
    frame.extend_from_slice(&3_000_000i64.to_be_bytes());
    frame.extend_from_slice(&7u32.to_be_bytes());
    let mut buffer = Bytes::from(frame);

    match decode_wal_frame(&mut decoder, &mut buffer).unwrap() {
      WalEvent::Data {
        message_lsn,
        current_lsn,
        change,
        ..
      } => {
        assert_eq!(message_lsn, Lsn(0x10));
        assert_eq!(current_lsn, Lsn(0x20));
        assert!(matches!(change, ChangeEvent::Begin { xid: 7, .. }));
      }
      event => panic!("expected data, got {:?}", event),
    }
    assert!(buffer.is_empty());
  }

  #[test]
  fn unknown_envelope_tag_fails() {
    let mut decoder = Decoder::new();
    let mut buffer = Bytes::from_static(b"x123");
    assert!(matches!(
      decode_wal_frame(&mut decoder, &mut buffer),
      Err(Error::Protocol(_))
    ));
  }

  #[test]
  fn events_serialize_with_textual_lsns() {
    let event = WalEvent::Keepalive {
      current_lsn: Lsn::from_parts(1, 0x16B_3748),
      system_time: DateTime::from_timestamp_micros(0).unwrap(),
      must_reply: false,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "keepalive");
    assert_eq!(json["current_lsn"], "1/16B3748");

    let value = serde_json::to_value(Value::Int(42)).unwrap();
    assert_eq!(value, serde_json::json!(42));
  }
}
