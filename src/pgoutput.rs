use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::buf_ext::BufExt;
use crate::error::{Error, Result};
use crate::types::{self, TextParser, TypeParserFn, Value};
use crate::wal::Lsn;

/// Column name to value. Fields encoded as unchanged toast with no fallback
/// are absent from the map.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaIdentity {
  Default,
  Nothing,
  Full,
  Index,
}

impl TryFrom<u8> for ReplicaIdentity {
  type Error = Error;

  fn try_from(code: u8) -> Result<Self> {
    match code {
      b'd' => Ok(Self::Default),
      b'n' => Ok(Self::Nothing),
      b'f' => Ok(Self::Full),
      b'i' => Ok(Self::Index),
      code => Err(Error::protocol(format!(
        "unknown replica identity {:?}",
        char::from(code)
      ))),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Column {
  pub flags: u8,
  pub name: String,
  pub type_oid: u32,
  pub type_modifier: i32,
  /// Populated when a `Y` message for `type_oid` preceded the relation.
  pub type_schema: Option<String>,
  pub type_name: Option<String>,
  #[serde(skip)]
  pub(crate) parse: TextParser,
}

impl Column {
  /// Bit 0 of the flags marks the column as part of the replica identity key.
  pub fn is_key(&self) -> bool {
    self.flags & 1 == 1
  }
}

/// Schema-qualified table description as announced by the stream. Events
/// carry the snapshot that was current when they were decoded; a re-announced
/// relation replaces the cache entry without touching older events.
#[derive(Debug, Clone, Serialize)]
pub struct Relation {
  pub oid: u32,
  pub schema: String,
  pub name: String,
  pub replica_identity: ReplicaIdentity,
  pub columns: Vec<Column>,
  pub key_columns: Vec<String>,
}

/// A `Y` message: a non-builtin type referenced by later relations.
#[derive(Debug, Clone, Serialize)]
pub struct CustomType {
  pub oid: u32,
  pub schema: String,
  pub name: String,
}

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct TruncateFlags: u8 {
    const CASCADE = 0b01;
    const RESTART_IDENTITY = 0b10;
  }
}

/// One decoded pgoutput message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEvent {
  Begin {
    commit_lsn: Lsn,
    commit_time: DateTime<Utc>,
    xid: u32,
  },
  Commit {
    flags: u8,
    commit_lsn: Lsn,
    commit_end_lsn: Lsn,
    commit_time: DateTime<Utc>,
  },
  Origin {
    origin_lsn: Lsn,
    origin_name: String,
  },
  Relation {
    relation: Arc<Relation>,
  },
  Type {
    custom_type: CustomType,
  },
  Insert {
    relation: Arc<Relation>,
    new: Row,
  },
  Update {
    relation: Arc<Relation>,
    key: Option<Row>,
    old: Option<Row>,
    new: Row,
  },
  Delete {
    relation: Arc<Relation>,
    key: Option<Row>,
    old: Option<Row>,
  },
  Truncate {
    relations: Vec<Arc<Relation>>,
    cascade: bool,
    restart_identity: bool,
  },
  Message {
    transactional: bool,
    message_lsn: Lsn,
    prefix: String,
    content: Vec<u8>,
  },
}

/// Stateful decoder for pgoutput protocol version 1.
///
/// Relations and custom types are cached by oid for the lifetime of the
/// decoder; the server announces a relation before the first tuple that
/// references it, so a lookup miss is a protocol error.
#[derive(Debug)]
pub struct Decoder {
  relations: HashMap<u32, Arc<Relation>>,
  types: HashMap<u32, CustomType>,
  parsers: TypeParserFn,
}

impl Default for Decoder {
  fn default() -> Self {
    Self::new()
  }
}

impl Decoder {
  pub fn new() -> Self {
    Self::with_parsers(types::default_parser)
  }

  pub fn with_parsers(parsers: TypeParserFn) -> Self {
    Self {
      relations: HashMap::new(),
      types: HashMap::new(),
      parsers,
    }
  }

  /// The cached snapshot for a relation oid, if one was announced.
  pub fn relation(&self, oid: u32) -> Option<&Arc<Relation>> {
    self.relations.get(&oid)
  }

  /// Decode one pgoutput message. The first byte is the message tag, the
  /// rest follows that tag's grammar; tags from protocol versions past 1
  /// (streaming, two-phase) land in the unknown arm.
  pub fn decode(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    match buffer.pg_get_u8()? {
      b'B' => Ok(ChangeEvent::Begin {
        commit_lsn: buffer.pg_get_lsn()?,
        commit_time: buffer.pg_get_timestamp()?,
        xid: buffer.pg_get_u32()?,
      }),
      b'C' => Ok(ChangeEvent::Commit {
        flags: buffer.pg_get_u8()?,
        commit_lsn: buffer.pg_get_lsn()?,
        commit_end_lsn: buffer.pg_get_lsn()?,
        commit_time: buffer.pg_get_timestamp()?,
      }),
      b'O' => Ok(ChangeEvent::Origin {
        origin_lsn: buffer.pg_get_lsn()?,
        origin_name: buffer.pg_get_cstr()?,
      }),
      b'Y' => self.decode_type(buffer),
      b'R' => self.decode_relation(buffer),
      b'I' => self.decode_insert(buffer),
      b'U' => self.decode_update(buffer),
      b'D' => self.decode_delete(buffer),
      b'T' => self.decode_truncate(buffer),
      b'M' => self.decode_message(buffer),
      tag => Err(Error::protocol(format!(
        "unexpected pgoutput message tag {:?}",
        char::from(tag)
      ))),
    }
  }

  fn decode_type(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    let custom_type = CustomType {
      oid: buffer.pg_get_u32()?,
      schema: buffer.pg_get_cstr()?,
      name: buffer.pg_get_cstr()?,
    };
    self.types.insert(custom_type.oid, custom_type.clone());
    Ok(ChangeEvent::Type { custom_type })
  }

  fn decode_relation(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    let oid = buffer.pg_get_u32()?;
    let schema = buffer.pg_get_cstr()?;
    let name = buffer.pg_get_cstr()?;
    let replica_identity = buffer.pg_get_u8()?.try_into()?;
    let num_columns = buffer.pg_get_i16()?;

    let mut columns = Vec::with_capacity(num_columns.max(0) as usize);
    for _ in 0..num_columns {
      let flags = buffer.pg_get_u8()?;
      let name = buffer.pg_get_cstr()?;
      let type_oid = buffer.pg_get_u32()?;
      let type_modifier = buffer.pg_get_i32()?;

      // Enrichment happens here, once: a Y message seen after this relation
      // does not rewrite it.
      let custom_type = self.types.get(&type_oid);

      columns.push(Column {
        flags,
        name,
        type_oid,
        type_modifier,
        type_schema: custom_type.map(|t| t.schema.clone()),
        type_name: custom_type.map(|t| t.name.clone()),
        parse: (self.parsers)(type_oid),
      });
    }

    let key_columns = columns
      .iter()
      .filter(|c| c.is_key())
      .map(|c| c.name.clone())
      .collect();

    let relation = Arc::new(Relation {
      oid,
      schema,
      name,
      replica_identity,
      columns,
      key_columns,
    });

    debug!(oid, schema = %relation.schema, name = %relation.name, "caching relation");
    self.relations.insert(oid, Arc::clone(&relation));
    Ok(ChangeEvent::Relation { relation })
  }

  fn decode_insert(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    let relation = self.required_relation(buffer.pg_get_u32()?)?;
    expect_submessage(buffer, b'N')?;
    let new = read_tuple(&relation, buffer, None)?;
    Ok(ChangeEvent::Insert { relation, new })
  }

  fn decode_update(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    let relation = self.required_relation(buffer.pg_get_u32()?)?;

    match buffer.pg_get_u8()? {
      b'K' => {
        let key = read_tuple(&relation, buffer, None)?;
        expect_submessage(buffer, b'N')?;
        let new = read_tuple(&relation, buffer, None)?;
        Ok(ChangeEvent::Update {
          key: Some(project_key(&relation, key)),
          old: None,
          new,
          relation,
        })
      }
      b'O' => {
        let old = read_tuple(&relation, buffer, None)?;
        expect_submessage(buffer, b'N')?;
        let new = read_tuple(&relation, buffer, Some(&old))?;
        Ok(ChangeEvent::Update {
          key: None,
          old: Some(old),
          new,
          relation,
        })
      }
      b'N' => {
        let new = read_tuple(&relation, buffer, None)?;
        Ok(ChangeEvent::Update {
          key: None,
          old: None,
          new,
          relation,
        })
      }
      submessage => Err(Error::protocol(format!(
        "unexpected update submessage {:?}",
        char::from(submessage)
      ))),
    }
  }

  fn decode_delete(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    let relation = self.required_relation(buffer.pg_get_u32()?)?;

    match buffer.pg_get_u8()? {
      b'K' => {
        let key = read_tuple(&relation, buffer, None)?;
        Ok(ChangeEvent::Delete {
          key: Some(project_key(&relation, key)),
          old: None,
          relation,
        })
      }
      b'O' => {
        let old = read_tuple(&relation, buffer, None)?;
        Ok(ChangeEvent::Delete {
          key: None,
          old: Some(old),
          relation,
        })
      }
      submessage => Err(Error::protocol(format!(
        "unexpected delete submessage {:?}",
        char::from(submessage)
      ))),
    }
  }

  fn decode_truncate(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    let num_relations = buffer.pg_get_i32()?;
    let flags = TruncateFlags::from_bits_truncate(buffer.pg_get_u8()?);

    let mut relations = Vec::with_capacity(num_relations.max(0) as usize);
    for _ in 0..num_relations {
      relations.push(self.required_relation(buffer.pg_get_i32()? as u32)?);
    }

    Ok(ChangeEvent::Truncate {
      relations,
      cascade: flags.contains(TruncateFlags::CASCADE),
      restart_identity: flags.contains(TruncateFlags::RESTART_IDENTITY),
    })
  }

  fn decode_message(&mut self, buffer: &mut Bytes) -> Result<ChangeEvent> {
    let flags = buffer.pg_get_u8()?;
    let message_lsn = buffer.pg_get_lsn()?;
    let prefix = buffer.pg_get_cstr()?;
    let len = buffer.pg_get_i32()?;
    let len = usize::try_from(len).map_err(|_| Error::protocol(format!("negative message length {len}")))?;
    let content = buffer.pg_get_bytes(len)?.to_vec();

    Ok(ChangeEvent::Message {
      transactional: flags & 1 == 1,
      message_lsn,
      prefix,
      content,
    })
  }

  fn required_relation(&self, oid: u32) -> Result<Arc<Relation>> {
    self
      .relations
      .get(&oid)
      .cloned()
      .ok_or(Error::UnknownRelation(oid))
  }
}

fn expect_submessage(buffer: &mut Bytes, expected: u8) -> Result<()> {
  match buffer.pg_get_u8()? {
    submessage if submessage == expected => Ok(()),
    submessage => Err(Error::protocol(format!(
      "expected {:?} submessage, got {:?}",
      char::from(expected),
      char::from(submessage)
    ))),
  }
}

/// One TupleData block. `fallback` supplies values for unchanged-toast
/// fields; without it those fields stay absent from the row.
fn read_tuple(relation: &Relation, buffer: &mut Bytes, fallback: Option<&Row>) -> Result<Row> {
  let num_fields = buffer.pg_get_i16()?;
  if num_fields as usize != relation.columns.len() {
    return Err(Error::protocol(format!(
      "tuple has {} fields but relation {} has {} columns",
      num_fields,
      relation.name,
      relation.columns.len()
    )));
  }

  let mut row = Row::new();
  for column in &relation.columns {
    match buffer.pg_get_u8()? {
      b'n' => {
        row.insert(column.name.clone(), Value::Null);
      }
      b't' => {
        let text = buffer.pg_get_prefixed_str()?;
        row.insert(column.name.clone(), (column.parse)(&text));
      }
      b'b' => {
        let len = buffer.pg_get_i32()?;
        let len = usize::try_from(len).map_err(|_| Error::protocol(format!("negative field length {len}")))?;
        row.insert(column.name.clone(), Value::Bytes(buffer.pg_get_bytes(len)?.to_vec()));
      }
      b'u' => {
        if let Some(value) = fallback.and_then(|row| row.get(&column.name)) {
          row.insert(column.name.clone(), value.clone());
        }
      }
      kind => {
        return Err(Error::protocol(format!(
          "unknown tuple field kind {:?}",
          char::from(kind)
        )))
      }
    }
  }
  Ok(row)
}

/// Keep only genuine key values: non-key columns arrive as null placeholders
/// in key tuples and are dropped along with any null key position.
fn project_key(relation: &Relation, row: Row) -> Row {
  row
    .into_iter()
    .filter(|(name, value)| relation.key_columns.contains(name) && *value != Value::Null)
    .collect()
}
