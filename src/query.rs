use std::{collections::VecDeque, slice::ChunksExact};

use crate::error::Error;
use crate::wal::Lsn;

/// Row of `IDENTIFY_SYSTEM`.
#[derive(Debug)]
pub struct IdentifySystem {
  pub systemid: String,
  pub timeline: u64,
  pub wal_position: Lsn,
  pub dbname: Option<String>,
}

/// Row of `CREATE_REPLICATION_SLOT`.
#[derive(Debug)]
pub struct CreateReplicationSlot {
  pub slot_name: String,
  pub consistent_point: Lsn,
  pub snapshot_name: Option<String>,
  pub output_plugin: Option<String>,
}

/// RowDescription entry for a simple-query result.
#[derive(Debug)]
pub struct Column {
  pub name: String,
  pub table_oid: i32,
  pub attr_number: i16,
  pub type_oid: i32,
  pub type_size: i16,
  pub type_modifier: i32,
  pub format: i16,
}

pub type RowValue = Option<String>;

/// Everything a single simple-query round trip produced: one result per
/// statement, notices on the side.
#[derive(Debug)]
pub struct QueryResults {
  pub notices: Vec<String>,
  pub results: VecDeque<QueryResult>,
}

#[derive(Debug)]
pub enum QueryResult {
  Success,
  Selected(RowSet),
  BackendError(Error),
}

impl QueryResult {
  pub fn is_successful(&self) -> bool {
    matches!(self, Self::Success)
  }

  pub fn into_row_set(self) -> Option<RowSet> {
    match self {
      Self::Selected(v) => Some(v),
      _ => None,
    }
  }

  pub fn into_backend_error(self) -> Option<Error> {
    match self {
      Self::BackendError(v) => Some(v),
      _ => None,
    }
  }
}

/// Column descriptions plus row values in row-major order.
#[derive(Debug, Default)]
pub struct RowSet {
  pub columns: Vec<Column>,
  pub values: Vec<RowValue>,
}

impl RowSet {
  pub fn columns_len(&self) -> usize {
    self.columns.len()
  }

  pub fn rows_len(&self) -> usize {
    if self.columns.is_empty() {
      0
    } else {
      self.values.len() / self.columns.len()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn row(&self, i: usize) -> &[RowValue] {
    let len = self.columns.len();
    &self.values[i * len..(i + 1) * len]
  }

  pub fn rows(&self) -> Option<ChunksExact<'_, RowValue>> {
    if self.columns.is_empty() {
      None
    } else {
      Some(self.values.chunks_exact(self.columns.len()))
    }
  }
}
