//! Pull-driven PostgreSQL logical replication consumer.
//!
//! A [`Connection`] speaks the wire protocol in `replication=database` mode:
//! it authenticates, runs simple queries and the replication command set,
//! and [`Connection::start_replication`] turns it into a CopyBoth
//! [`ReplicationStream`]. Each `recv` pulls exactly one frame — a keepalive
//! or a pgoutput change decoded against the session's relation cache — and
//! [`ReplicationStream::acknowledge`] moves the slot's confirmed position
//! forward.

#[cfg(feature = "ssl")]
pub use openssl;

mod buf_ext;
pub mod conn;
pub mod error;
pub mod pgoutput;
pub mod query;
mod stream;
pub mod types;
pub mod wal;

pub use conn::{Connection, ConnectionOptions, ReplicationOptions};
pub use error::{Error, Result};
pub use pgoutput::{ChangeEvent, Column, CustomType, Decoder, Relation, ReplicaIdentity, Row};
pub use types::{TextParser, TypeParserFn, Value};
pub use wal::{Lsn, ReplicationStream, WalEvent};
