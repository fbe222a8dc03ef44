use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, Bytes};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha2::digest::FixedOutput;
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio::net;
use tracing::debug;
use url::Url;

use crate::buf_ext::BufExt;
use crate::error::{Error, Result};
use crate::pgoutput::Decoder;
use crate::query::{Column, CreateReplicationSlot, IdentifySystem, QueryResult, QueryResults, RowSet};
use crate::stream::Stream;
use crate::types::TypeParserFn;
use crate::wal::{Lsn, ReplicationStream};

const PROTOCOL_VERSION: i32 = 196608;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
  pub user: String,
  pub password: Option<String>,
  pub database: Option<String>,
  pub application_name: String,
  pub connect_timeout: Option<Duration>,
  pub read_timeout: Option<Duration>,
  pub write_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
  fn default() -> Self {
    Self {
      user: "postgres".to_string(),
      password: None,
      database: None,
      application_name: "walpull".to_string(),
      connect_timeout: None,
      read_timeout: None,
      write_timeout: None,
    }
  }
}

impl TryFrom<&Url> for ConnectionOptions {
  type Error = Error;

  fn try_from(url: &Url) -> Result<Self> {
    let user = match url.username() {
      "" => "postgres".to_string(),
      user => user.to_string(),
    };
    let password = url.password().map(ToString::to_string);

    let database = match url.path().trim_start_matches('/') {
      "" => None,
      database => Some(database.to_string()),
    };

    let query_pairs = url.query_pairs().collect::<BTreeMap<_, _>>();

    let application_name = query_pairs
      .get("application_name")
      .map(|v| v.to_string())
      .unwrap_or_else(|| "walpull".to_string());

    let connect_timeout = query_pairs
      .get("connect_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    let read_timeout = query_pairs
      .get("read_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    let write_timeout = query_pairs
      .get("write_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    Ok(Self {
      user,
      password,
      database,
      application_name,
      connect_timeout,
      read_timeout,
      write_timeout,
    })
  }
}

/// Options of `START_REPLICATION`. The slot is assumed to exist and to use
/// the pgoutput plugin; slot and publication names are interpolated into the
/// command and must be validated by the caller.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
  pub slot: String,
  pub publication: String,
  /// pgoutput protocol version. Only version 1 message grammars are decoded.
  pub protocol_version: u8,
  /// Where to start streaming. [`Lsn::ZERO`] means the slot's restart point.
  pub start_lsn: Lsn,
  /// Pass `messages 'true'` so `pg_logical_emit_message` events are streamed.
  pub messages: bool,
  /// Text parser lookup used to build column descriptors.
  pub parsers: TypeParserFn,
}

impl ReplicationOptions {
  pub fn new(slot: impl Into<String>, publication: impl Into<String>) -> Self {
    Self {
      slot: slot.into(),
      publication: publication.into(),
      protocol_version: 1,
      start_lsn: Lsn::ZERO,
      messages: false,
      parsers: crate::types::default_parser,
    }
  }
}

/// A replication-mode connection: startup handshake, authentication, simple
/// queries and the replication command set. `start_replication` turns it
/// into a [`ReplicationStream`].
#[derive(Debug)]
pub struct Connection {
  stream: Stream,
  options: ConnectionOptions,
  parameters: BTreeMap<String, String>,
}

impl Connection {
  pub async fn connect_from_url(url: &Url) -> Result<Self> {
    match url.scheme() {
      "postgres" | "postgresql" => {
        let port = url.port().unwrap_or(5432);
        let addrs = match url.host() {
          Some(url::Host::Domain(domain)) => net::lookup_host(format!("{}:{}", domain, port))
            .await
            .map(|v| v.collect::<Vec<_>>())
            .map_err(Error::Io)?,
          Some(url::Host::Ipv4(ip)) => vec![SocketAddrV4::new(ip, port).into()],
          Some(url::Host::Ipv6(ip)) => vec![SocketAddrV6::new(ip, port, 0, 0).into()],
          None => vec![format!("[::]:{port}").parse().unwrap()],
        };
        Self::connect_tcp(addrs, url.try_into()?).await
      }
      "unix" => Self::connect_unix(url.path(), url.try_into()?).await,
      scheme => Err(Error::unsupported(format!("{} scheme", scheme))),
    }
  }

  pub async fn connect_tcp(addrs: impl Into<Vec<SocketAddr>>, options: ConnectionOptions) -> Result<Self> {
    let stream = Self::with_timeout(options.connect_timeout, Stream::connect_tcp(addrs)).await?;
    Self::connect(stream, options).await
  }

  pub async fn connect_unix(path: impl Into<PathBuf>, options: ConnectionOptions) -> Result<Self> {
    let stream = Self::with_timeout(options.connect_timeout, Stream::connect_unix(path)).await?;
    Self::connect(stream, options).await
  }

  #[cfg(feature = "ssl")]
  pub async fn connect_ssl(
    addrs: impl Into<Vec<SocketAddr>>,
    domain: impl Into<String>,
    options: ConnectionOptions,
    ssl_connector: openssl::ssl::SslConnector,
  ) -> Result<Self> {
    let stream = Self::with_timeout(options.connect_timeout, Stream::connect_ssl(addrs, domain, ssl_connector)).await?;
    Self::connect(stream, options).await
  }

  async fn with_timeout<T>(
    timeout: Option<Duration>,
    future: impl std::future::Future<Output = io::Result<T>>,
  ) -> Result<T> {
    let result = match timeout {
      Some(timeout) => tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))
        .and_then(|r| r),
      None => future.await,
    };
    result.map_err(Error::Io)
  }

  async fn connect(stream: Stream, options: ConnectionOptions) -> Result<Self> {
    let mut connection = Self {
      stream,
      options,
      parameters: BTreeMap::new(),
    };
    connection.startup().await?;
    Ok(connection)
  }

  /// Run-time parameters reported by the server during startup.
  pub fn parameter(&self, name: &str) -> Option<&str> {
    self.parameters.get(name).map(String::as_str)
  }

  async fn read_packet(&mut self) -> Result<(u8, Bytes)> {
    Self::with_timeout(self.options.read_timeout, self.stream.read_packet()).await
  }

  async fn flush(&mut self) -> Result<()> {
    Self::with_timeout(self.options.write_timeout, self.stream.flush()).await
  }

  // https://www.postgresql.org/docs/current/protocol-flow.html
  //
  // The connection always starts in `replication=database` mode: the same
  // session runs both the catalog queries and START_REPLICATION.
  async fn startup(&mut self) -> Result<()> {
    let mut params = Vec::new();
    params.push("user");
    params.push(self.options.user.as_str());
    if let Some(database) = self.options.database.as_ref() {
      params.push("database");
      params.push(database.as_str());
    }
    params.push("application_name");
    params.push(self.options.application_name.as_str());
    params.push("replication");
    params.push("database");

    let mut len = 4 + 4 + 1;
    for p in &params {
      len += p.as_bytes().len() + 1;
    }

    self.stream.write_i32(len as i32).await?;
    self.stream.write_i32(PROTOCOL_VERSION).await?;
    for p in &params {
      self.stream.write_all(p.as_bytes()).await?;
      self.stream.write_u8(0).await?;
    }
    self.stream.write_u8(0).await?;
    self.flush().await?;

    self.authenticate().await?;

    loop {
      let (op, mut buffer) = self.read_packet().await?;

      match op {
        b'K' => {
          // BackendKeyData. Query cancellation is not part of this client,
          // so the pid/secret pair is dropped.
        }
        b'S' => {
          let name = buffer.pg_get_cstr()?;
          let value = buffer.pg_get_cstr()?;
          debug!(%name, %value, "parameter status");
          self.parameters.insert(name, value);
        }
        b'Z' => break,
        b'E' => return Err(buffer.pg_get_backend_error()),
        b'N' => {
          if let Some(notice) = buffer.pg_get_backend_notice() {
            debug!(%notice, "backend notice");
          }
        }
        code => {
          return Err(Error::protocol(format!(
            "unexpected message {:?} during startup",
            char::from(code)
          )))
        }
      }
    }
    Ok(())
  }

  async fn authenticate(&mut self) -> Result<()> {
    loop {
      let (op, mut buffer) = self.read_packet().await?;

      match op {
        b'R' => match buffer.pg_get_i32()? {
          0 => break,
          3 => {
            // AuthenticationCleartextPassword
            let password = self.required_password()?.to_vec();
            self.write_password_message(&password).await?;
          }
          5 => {
            // AuthenticationMD5Password
            let password = self.required_password()?;

            let mut salt = vec![0; 4];
            if buffer.remaining() < 4 {
              return Err(Error::Truncated("md5 salt"));
            }
            buffer.copy_to_slice(&mut salt);

            let mut md5 = Md5::new();
            md5.update(password);
            md5.update(self.options.user.as_bytes());
            let inner = md5.finalize_reset();
            md5.update(format!("{:x}", inner));
            md5.update(salt);
            let password = format!("md5{:x}", md5.finalize());

            self.write_password_message(password.as_bytes()).await?;
          }
          10 => {
            // AuthenticationSASL
            let mut mechanisms = Vec::new();
            loop {
              match buffer.pg_get_cstr()? {
                m if m.is_empty() => break,
                m => mechanisms.push(m),
              }
            }
            self.authenticate_scram(mechanisms).await?;
          }
          2 => return Err(Error::unsupported("AuthenticationKerberosV5")),
          6 => return Err(Error::unsupported("AuthenticationSCMCredential")),
          7 => return Err(Error::unsupported("AuthenticationGSS")),
          9 => return Err(Error::unsupported("AuthenticationSSPI")),
          code => return Err(Error::unsupported(format!("authentication code {}", code))),
        },
        b'E' => return Err(buffer.pg_get_backend_error()),
        code => {
          return Err(Error::protocol(format!(
            "unexpected message {:?} during authentication",
            char::from(code)
          )))
        }
      }
    }
    Ok(())
  }

  fn required_password(&self) -> Result<&[u8]> {
    self
      .options
      .password
      .as_ref()
      .map(|v| v.as_bytes())
      .ok_or_else(|| Error::protocol("server requested a password but none was configured"))
  }

  async fn write_password_message(&mut self, password: &[u8]) -> Result<()> {
    let len = password.len() + 4 + 1;
    self.stream.write_u8(b'p').await?;
    self.stream.write_i32(len as i32).await?;
    self.stream.write_all(password).await?;
    self.stream.write_u8(0).await?;
    self.flush().await
  }

  // https://datatracker.ietf.org/doc/html/rfc5802
  async fn authenticate_scram(&mut self, mechanisms: Vec<String>) -> Result<()> {
    let mechanism = "SCRAM-SHA-256".to_string();
    if !mechanisms.contains(&mechanism) {
      return Err(Error::unsupported(format!("SASL mechanisms {:?}", mechanisms)));
    }

    let password = self.required_password()?.to_vec();

    let client_nonce = thread_rng()
      .sample_iter(&Alphanumeric)
      .take(24)
      .map(char::from)
      .collect::<String>();

    // SASLInitialResponse; channel binding is not offered.
    let gs2_header = "n,,";
    let client_first_message = format!("{}n=,r={}", gs2_header, client_nonce);
    let len = 4 + mechanism.len() + 1 + 4 + client_first_message.len();
    self.stream.write_u8(b'p').await?;
    self.stream.write_i32(len as i32).await?;
    self.stream.write_all(mechanism.as_bytes()).await?;
    self.stream.write_u8(0).await?;
    self.stream.write_i32(client_first_message.len() as i32).await?;
    self.stream.write_all(client_first_message.as_bytes()).await?;
    self.flush().await?;

    let server_first_message = self.read_sasl_response().await?;

    let mut chunks = server_first_message.splitn(3, ',');
    let server_nonce = chunks
      .next()
      .and_then(|v| v.strip_prefix("r="))
      .ok_or_else(|| Error::protocol("invalid SCRAM nonce"))?;
    let salt: Vec<u8> = chunks
      .next()
      .and_then(|v| v.strip_prefix("s="))
      .and_then(|v| base64::decode(v).ok())
      .ok_or_else(|| Error::protocol("invalid SCRAM salt"))?;
    let iteration_count = chunks
      .next()
      .and_then(|v| v.strip_prefix("i="))
      .and_then(|v| v.parse::<usize>().ok())
      .ok_or_else(|| Error::protocol("invalid SCRAM iteration count"))?;

    fn sasl_hi(password: &[u8], salt: &[u8], iterations: usize) -> [u8; 32] {
      let mut prev = Hmac::<Sha256>::new_from_slice(password)
        .unwrap()
        .chain_update(salt)
        .chain_update([0, 0, 0, 1])
        .finalize()
        .into_bytes();
      let mut hi = prev;

      for _ in 1..iterations {
        prev = Hmac::<Sha256>::new_from_slice(password)
          .unwrap()
          .chain_update(prev)
          .finalize()
          .into_bytes();
        for (hi, prev) in hi.iter_mut().zip(prev) {
          *hi ^= prev;
        }
      }

      hi.into()
    }

    let salted_password = sasl_hi(&password, &salt, iteration_count);

    let client_key = Hmac::<Sha256>::new_from_slice(&salted_password)
      .unwrap()
      .chain_update(b"Client Key")
      .finalize()
      .into_bytes();

    let stored_key = Sha256::default().chain_update(client_key.as_slice()).finalize_fixed();

    let encoded_channel_binding = base64::encode(gs2_header);

    let auth_message = format!(
      "n=,r={},{},c={},r={}",
      client_nonce, server_first_message, encoded_channel_binding, server_nonce
    );

    let client_signature = Hmac::<Sha256>::new_from_slice(&stored_key)
      .unwrap()
      .chain_update(auth_message.as_bytes())
      .finalize()
      .into_bytes();

    let mut client_proof = client_key;
    for (proof, signature) in client_proof.iter_mut().zip(client_signature) {
      *proof ^= signature;
    }

    let client_final_message = format!(
      "c={},r={},p={}",
      encoded_channel_binding,
      server_nonce,
      base64::encode(client_proof)
    );

    // SASLResponse
    let len = 4 + client_final_message.len();
    self.stream.write_u8(b'p').await?;
    self.stream.write_i32(len as i32).await?;
    self.stream.write_all(client_final_message.as_bytes()).await?;
    self.flush().await?;

    let sasl_final_response = self.read_sasl_response().await?;

    if let Some(err) = sasl_final_response.strip_prefix("e=") {
      return Err(Error::protocol(err.to_string()));
    }

    let verifier = sasl_final_response
      .strip_prefix("v=")
      .and_then(|v| base64::decode(v).ok())
      .ok_or_else(|| Error::protocol("unexpected SASL outcome payload"))?;

    let server_key = Hmac::<Sha256>::new_from_slice(&salted_password)
      .unwrap()
      .chain_update(b"Server Key")
      .finalize()
      .into_bytes();

    Hmac::<Sha256>::new_from_slice(&server_key)
      .unwrap()
      .chain_update(auth_message.as_bytes())
      .verify_slice(&verifier)
      .map_err(|_| Error::protocol("SASL server signature verification failed"))
  }

  async fn read_sasl_response(&mut self) -> Result<String> {
    let (op, mut buffer) = self.read_packet().await?;

    match op {
      b'R' => {
        // AuthenticationSASLContinue / AuthenticationSASLFinal; skip the
        // status code, the rest is mechanism data.
        buffer.pg_get_i32()?;
        String::from_utf8(buffer.to_vec()).map_err(|_| Error::protocol("SASL payload is not valid utf-8"))
      }
      b'E' => Err(buffer.pg_get_backend_error()),
      code => Err(Error::protocol(format!(
        "unexpected message {:?} during SASL exchange",
        char::from(code)
      ))),
    }
  }

  pub async fn ping(&mut self) -> Result<()> {
    self.query_first("SELECT 1").await.map(|_| ())
  }

  async fn write_query_command(&mut self, query: impl AsRef<str>) -> Result<()> {
    let len = query.as_ref().as_bytes().len() + 1 + 4;
    self.stream.write_u8(b'Q').await?;
    self.stream.write_i32(len as i32).await?;
    self.stream.write_all(query.as_ref().as_bytes()).await?;
    self.stream.write_u8(0).await?;
    self.flush().await
  }

  pub async fn query_first(&mut self, query: impl AsRef<str>) -> Result<QueryResult> {
    let QueryResults { mut results, .. } = self.query(query.as_ref()).await?;
    results
      .pop_front()
      .ok_or_else(|| Error::protocol("missing query result"))
  }

  // https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-SIMPLE-QUERY
  pub async fn query(&mut self, query: impl AsRef<str>) -> Result<QueryResults> {
    self.write_query_command(query).await?;

    let mut notices = Vec::new();
    let mut results: VecDeque<QueryResult> = VecDeque::new();
    let mut current: Option<RowSet> = None;

    loop {
      let (op, mut buffer) = self.read_packet().await?;

      match op {
        b'C' => {
          // CommandComplete; the tag itself is not interesting here.
          buffer.pg_get_cstr()?;
          match current.take() {
            Some(row_set) => results.push_back(QueryResult::Selected(row_set)),
            None => results.push_back(QueryResult::Success),
          }
        }
        b'T' => {
          // RowDescription
          let mut columns = Vec::new();
          let num_columns = buffer.pg_get_i16()?;
          for _ in 0..num_columns {
            let name = buffer.pg_get_cstr()?;
            let table_oid = buffer.pg_get_i32()?;
            let attr_number = buffer.pg_get_i16()?;
            let type_oid = buffer.pg_get_i32()?;
            let type_size = buffer.pg_get_i16()?;
            let type_modifier = buffer.pg_get_i32()?;
            let format = buffer.pg_get_i16()?;

            columns.push(Column {
              name,
              table_oid,
              attr_number,
              type_oid,
              type_size,
              type_modifier,
              format,
            });
          }
          current = Some(RowSet {
            columns,
            values: Vec::new(),
          });
        }
        b'D' => {
          // DataRow; -1 lengths are nulls.
          let row_set = current
            .as_mut()
            .ok_or_else(|| Error::protocol("DataRow without RowDescription"))?;
          let num_values = buffer.pg_get_i16()?;
          for _ in 0..num_values {
            match buffer.pg_get_i32()? {
              -1 => row_set.values.push(None),
              len if len >= 0 => row_set.values.push(Some(buffer.pg_get_str(len as usize)?)),
              len => return Err(Error::protocol(format!("invalid column value length {}", len))),
            }
          }
        }
        b'I' => {
          // EmptyQueryResponse
          results.push_back(QueryResult::Success);
        }
        b'Z' => break,
        b'E' => match buffer.pg_get_backend_error() {
          err @ Error::Backend { .. } => results.push_back(QueryResult::BackendError(err)),
          err => return Err(err),
        },
        b'N' => {
          if let Some(notice) = buffer.pg_get_backend_notice() {
            notices.push(notice);
          }
        }
        b'G' | b'H' => return Err(Error::unsupported("COPY via simple query")),
        code => {
          return Err(Error::protocol(format!(
            "unexpected message {:?} in query response",
            char::from(code)
          )))
        }
      }
    }

    Ok(QueryResults { notices, results })
  }

  pub async fn identify_system(&mut self) -> Result<IdentifySystem> {
    let result = self.query_first("IDENTIFY_SYSTEM").await?;
    let row = first_row(result, "IDENTIFY_SYSTEM")?;
    let systemid = required_field(&row, 0, "systemid")?;
    let timeline = required_field(&row, 1, "timeline")?
      .parse()
      .map_err(|_| Error::protocol("IDENTIFY_SYSTEM timeline is not an integer"))?;
    let wal_position = required_field(&row, 2, "xlogpos")?.parse()?;
    let dbname = row.get(3).cloned().flatten();

    Ok(IdentifySystem {
      systemid,
      timeline,
      wal_position,
      dbname,
    })
  }

  pub async fn create_replication_slot(&mut self, slot: impl AsRef<str>) -> Result<CreateReplicationSlot> {
    let result = self
      .query_first(format!("CREATE_REPLICATION_SLOT \"{}\" LOGICAL pgoutput", slot.as_ref()))
      .await?;
    let row = first_row(result, "CREATE_REPLICATION_SLOT")?;
    let slot_name = required_field(&row, 0, "slot_name")?;
    let consistent_point = required_field(&row, 1, "consistent_point")?.parse()?;
    let snapshot_name = row.get(2).cloned().flatten();
    let output_plugin = row.get(3).cloned().flatten();

    Ok(CreateReplicationSlot {
      slot_name,
      consistent_point,
      snapshot_name,
      output_plugin,
    })
  }

  pub async fn drop_replication_slot(&mut self, slot: impl AsRef<str>) -> Result<()> {
    match self
      .query_first(format!("DROP_REPLICATION_SLOT \"{}\"", slot.as_ref()))
      .await?
    {
      QueryResult::BackendError(err) => Err(err),
      _ => Ok(()),
    }
  }

  pub async fn replication_slot_exists(&mut self, slot: impl AsRef<str>) -> Result<bool> {
    let result = self
      .query_first(format!(
        "SELECT 1 FROM pg_replication_slots WHERE slot_name = '{}'",
        slot.as_ref()
      ))
      .await?;

    match result {
      QueryResult::Selected(row_set) => Ok(!row_set.is_empty()),
      QueryResult::BackendError(err) => Err(err),
      QueryResult::Success => Err(Error::protocol("slot probe returned no row set")),
    }
  }

  /// Issue `START_REPLICATION` and hand the connection over to a pull-driven
  /// [`ReplicationStream`]. The server answers with CopyBothResponse and the
  /// socket is not read again until the first `recv`.
  pub async fn start_replication(mut self, options: ReplicationOptions) -> Result<ReplicationStream> {
    let command = format!(
      "START_REPLICATION SLOT \"{}\" LOGICAL {} (proto_version '{}', publication_names '{}', messages '{}')",
      options.slot, options.start_lsn, options.protocol_version, options.publication, options.messages
    );
    debug!(%command, "starting replication");
    self.write_query_command(command).await?;

    let (op, mut buffer) = self.read_packet().await?;

    match op {
      b'W' => {
        // CopyBothResponse: overall format plus per-column formats, all of
        // which are zero for a replication stream.
        let format = buffer.pg_get_i8()?;
        let num_columns = buffer.pg_get_i16()?;
        if format != 0 || num_columns != 0 {
          return Err(Error::protocol("CopyBothResponse advertised a non-empty row format"));
        }
      }
      b'E' => return Err(buffer.pg_get_backend_error()),
      code => {
        return Err(Error::protocol(format!(
          "unexpected message {:?} in response to START_REPLICATION",
          char::from(code)
        )))
      }
    }

    Ok(ReplicationStream::new(self.stream, Decoder::with_parsers(options.parsers)))
  }

  pub async fn close(mut self) -> Result<()> {
    self.stream.write_u8(b'X').await?;
    self.stream.write_i32(4).await?;
    self.stream.flush().await?;
    self.stream.shutdown().await.map_err(Into::into)
  }
}

fn first_row(result: QueryResult, command: &str) -> Result<Vec<Option<String>>> {
  match result {
    QueryResult::Selected(row_set) if row_set.rows_len() > 0 => Ok(row_set.row(0).to_vec()),
    QueryResult::BackendError(err) => Err(err),
    _ => Err(Error::protocol(format!("{} returned no rows", command))),
  }
}

fn required_field(row: &[Option<String>], i: usize, name: &str) -> Result<String> {
  row
    .get(i)
    .cloned()
    .flatten()
    .ok_or_else(|| Error::protocol(format!("missing {} field", name)))
}
