use std::{net::SocketAddr, time::Duration};

use walpull::query::QueryResult;
use walpull::{
  ChangeEvent, Connection, ConnectionOptions, Error, Lsn, Relation, ReplicaIdentity, ReplicationOptions,
  ReplicationStream, Value, WalEvent,
};

#[tokio::test]
async fn test_ping() {
  let mut conn = connect().await;
  assert!(conn.ping().await.is_ok());
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_simple_query() {
  let mut conn = connect().await;
  let result = conn
    .query_first("SELECT 1,2,3 UNION ALL SELECT 4,5,6;")
    .await
    .unwrap()
    .into_row_set()
    .unwrap();

  assert_eq!(result.columns_len(), 3);
  assert_eq!(result.rows_len(), 2);
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_query_backend_error() {
  let mut conn = connect().await;
  let err = conn
    .query_first("SELECT 1/0;")
    .await
    .unwrap()
    .into_backend_error()
    .unwrap();
  assert_eq!("server error 22012: division by zero", err.to_string());
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_identify_system() {
  let mut conn = connect().await;
  let system = conn.identify_system().await.unwrap();
  assert_eq!(system.dbname, Some("test".to_string()));
  assert!(system.timeline >= 1);
  assert!(system.wal_position > Lsn::ZERO);
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_replication_slot_management() {
  let mut conn = connect().await;
  if conn.replication_slot_exists("walpull_mgmt").await.unwrap() {
    conn.drop_replication_slot("walpull_mgmt").await.unwrap();
  }

  let slot = conn.create_replication_slot("walpull_mgmt").await.unwrap();
  assert_eq!(slot.slot_name, "walpull_mgmt");
  assert_eq!(slot.output_plugin, Some("pgoutput".to_string()));
  assert!(slot.consistent_point > Lsn::ZERO);
  assert!(conn.replication_slot_exists("walpull_mgmt").await.unwrap());

  conn.drop_replication_slot("walpull_mgmt").await.unwrap();
  assert!(!conn.replication_slot_exists("walpull_mgmt").await.unwrap());

  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_keepalive_reports_server_position() {
  let (conn, mut stream) = setup_stream("walpull_s1", false).await;

  // On an idle slot the server opens with a keepalive; other suites share
  // this cluster, so scan past any of their traffic.
  let (current_lsn, must_reply, system_time) = next_keepalive(&mut stream).await;
  assert!(current_lsn > Lsn::ZERO);
  assert!(!must_reply);
  let age = chrono::Utc::now().signed_duration_since(system_time);
  assert!(age.num_seconds().abs() < 60);

  stream.close().await.unwrap();
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_insert_update_delete_with_default_identity() {
  let (mut conn, mut stream) = setup_stream("walpull_s2", false).await;

  conn.query_first("DROP TABLE IF EXISTS walpull_t;").await.unwrap();
  conn
    .query_first("CREATE TABLE walpull_t (id SERIAL PRIMARY KEY, value TEXT NOT NULL);")
    .await
    .unwrap();
  conn
    .query_first("INSERT INTO walpull_t(value) VALUES('v1');")
    .await
    .unwrap();

  match next_change_for(&mut stream, "walpull_t").await {
    ChangeEvent::Insert { relation, new } => {
      assert_eq!(relation.replica_identity, ReplicaIdentity::Default);
      assert_eq!(relation.key_columns, vec!["id"]);
      assert_eq!(new["id"], Value::Int(1));
      assert_eq!(new["value"], Value::String("v1".to_string()));
    }
    change => panic!("expected an insert, got {:?}", change),
  }

  conn.query_first("UPDATE walpull_t SET value = 'v2';").await.unwrap();

  match next_change_for(&mut stream, "walpull_t").await {
    ChangeEvent::Update { key, old, new, .. } => {
      assert!(key.is_none());
      assert!(old.is_none());
      assert_eq!(new["id"], Value::Int(1));
      assert_eq!(new["value"], Value::String("v2".to_string()));
    }
    change => panic!("expected an update, got {:?}", change),
  }

  conn.query_first("DELETE FROM walpull_t;").await.unwrap();

  match next_change_for(&mut stream, "walpull_t").await {
    ChangeEvent::Delete { key, old, .. } => {
      let key = key.unwrap();
      assert_eq!(key["id"], Value::Int(1));
      assert_eq!(key.len(), 1);
      assert!(old.is_none());
    }
    change => panic!("expected a delete, got {:?}", change),
  }

  stream.close().await.unwrap();
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_update_with_replica_identity_full() {
  let (mut conn, mut stream) = setup_stream("walpull_s5", false).await;

  conn.query_first("DROP TABLE IF EXISTS walpull_u;").await.unwrap();
  conn
    .query_first("CREATE TABLE walpull_u (id SERIAL PRIMARY KEY, value TEXT NOT NULL);")
    .await
    .unwrap();
  conn
    .query_first("ALTER TABLE walpull_u REPLICA IDENTITY FULL;")
    .await
    .unwrap();
  conn
    .query_first("INSERT INTO walpull_u(value) VALUES('a');")
    .await
    .unwrap();
  conn.query_first("UPDATE walpull_u SET value = 'b';").await.unwrap();

  loop {
    match next_change_for(&mut stream, "walpull_u").await {
      ChangeEvent::Insert { .. } => {}
      ChangeEvent::Update { relation, key, old, new } => {
        assert_eq!(relation.replica_identity, ReplicaIdentity::Full);
        assert_eq!(relation.key_columns, vec!["id", "value"]);
        assert!(key.is_none());
        let old = old.unwrap();
        assert_eq!(old["id"], Value::Int(1));
        assert_eq!(old["value"], Value::String("a".to_string()));
        assert_eq!(new["id"], Value::Int(1));
        assert_eq!(new["value"], Value::String("b".to_string()));
        break;
      }
      change => panic!("expected insert then update, got {:?}", change),
    }
  }

  stream.close().await.unwrap();
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_custom_message() {
  let (mut conn, mut stream) = setup_stream("walpull_s6", true).await;

  conn
    .query_first("SELECT pg_logical_emit_message(false, 'walpull-audit', '\\x00ff10'::bytea);")
    .await
    .unwrap();

  loop {
    match next_event(&mut stream).await {
      WalEvent::Data {
        change:
          ChangeEvent::Message {
            transactional,
            prefix,
            content,
            ..
          },
        ..
      } if prefix == "walpull-audit" => {
        assert!(!transactional);
        assert_eq!(content, vec![0x00, 0xFF, 0x10]);
        break;
      }
      _ => {}
    }
  }

  stream.close().await.unwrap();
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_acknowledge_is_idempotent_and_non_blocking() {
  let (conn, mut stream) = setup_stream("walpull_s7", false).await;

  stream.acknowledge("0/0".parse().unwrap()).await.unwrap();
  stream.acknowledge("0/0".parse().unwrap()).await.unwrap();

  // The acks produced no inbound traffic and did not upset the stream:
  // frames keep flowing, ending in an ordinary keepalive.
  next_keepalive(&mut stream).await;

  stream.close().await.unwrap();
  conn.close().await.unwrap();
}

#[tokio::test]
async fn test_clean_shutdown() {
  let (conn, mut stream) = setup_stream("walpull_s8", false).await;

  // At least one event flows before disposal.
  next_event(&mut stream).await;

  stream.close().await.unwrap();
  conn.close().await.unwrap();
}

fn default_addrs() -> Vec<SocketAddr> {
  vec!["[::]:5432".parse::<SocketAddr>().unwrap()]
}

fn default_connection_options() -> ConnectionOptions {
  ConnectionOptions {
    password: Some("password".to_string()),
    database: Some("test".to_string()),
    ..Default::default()
  }
}

async fn connect() -> Connection {
  Connection::connect_tcp(default_addrs(), default_connection_options())
    .await
    .unwrap()
}

// A control connection plus a stream on a freshly created slot. The
// publication covers all tables and is shared by every test.
async fn setup_stream(slot: &str, messages: bool) -> (Connection, ReplicationStream) {
  let mut conn = connect().await;

  match conn
    .query_first("CREATE PUBLICATION walpull_pub FOR ALL TABLES;")
    .await
    .unwrap()
  {
    // 42710 duplicate_object, 23505 when two suites race the create.
    QueryResult::BackendError(Error::Backend { code, message }) if code != "42710" && code != "23505" => {
      panic!("failed to create publication: {}", message)
    }
    _ => {}
  }

  if conn.replication_slot_exists(slot).await.unwrap() {
    conn.drop_replication_slot(slot).await.unwrap();
  }
  conn.create_replication_slot(slot).await.unwrap();

  let mut options = ReplicationOptions::new(slot, "walpull_pub");
  options.messages = messages;

  let stream = connect().await.start_replication(options).await.unwrap();
  (conn, stream)
}

async fn next_event(stream: &mut ReplicationStream) -> WalEvent {
  tokio::time::timeout(Duration::from_secs(10), stream.recv())
    .await
    .expect("timed out waiting for a replication event")
    .expect("stream ended unexpectedly")
    .unwrap()
}

async fn next_keepalive(stream: &mut ReplicationStream) -> (Lsn, bool, chrono::DateTime<chrono::Utc>) {
  loop {
    if let WalEvent::Keepalive {
      current_lsn,
      must_reply,
      system_time,
    } = next_event(stream).await
    {
      return (current_lsn, must_reply, system_time);
    }
  }
}

fn change_relation(change: &ChangeEvent) -> Option<&Relation> {
  match change {
    ChangeEvent::Insert { relation, .. }
    | ChangeEvent::Update { relation, .. }
    | ChangeEvent::Delete { relation, .. } => Some(relation.as_ref()),
    _ => None,
  }
}

// Other tests share the publication, so scan past frames that belong to
// someone else's table.
async fn next_change_for(stream: &mut ReplicationStream, table: &str) -> ChangeEvent {
  loop {
    if let WalEvent::Data { change, .. } = next_event(stream).await {
      if change_relation(&change).is_some_and(|relation| relation.name == table) {
        return change;
      }
    }
  }
}
