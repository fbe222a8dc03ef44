use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use tracing_subscriber::EnvFilter;
use url::Url;

use walpull::query::QueryResult;
use walpull::{ChangeEvent, Connection, Error, Lsn, ReplicationOptions, WalEvent};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let mut cmd = Command::new("walpull")
    .version("0.1.0")
    .about("Tail a pgoutput logical replication stream as JSON lines")
    .arg(Arg::new("url").required(true).short('u').long("url").value_parser(Url::parse))
    .arg(Arg::new("slot").short('s').long("slot").default_value("walpull"))
    .arg(
      Arg::new("publication")
        .short('p')
        .long("publication")
        .default_value("walpull"),
    )
    .arg(
      Arg::new("create")
        .long("create")
        .action(ArgAction::SetTrue)
        .help("create the slot and publication if missing"),
    )
    .arg(
      Arg::new("messages")
        .long("messages")
        .action(ArgAction::SetTrue)
        .help("stream pg_logical_emit_message events"),
    );

  let matches = cmd.get_matches_mut();

  let url = matches.get_one::<Url>("url").unwrap();
  let slot = matches.get_one::<String>("slot").unwrap();
  let publication = matches.get_one::<String>("publication").unwrap();

  let mut conn = Connection::connect_from_url(url).await.unwrap();

  if matches.get_flag("create") {
    // CREATE PUBLICATION has no IF NOT EXISTS; a duplicate_object error
    // just means someone got there first.
    match conn
      .query_first(format!("CREATE PUBLICATION \"{}\" FOR ALL TABLES", publication))
      .await
      .unwrap()
    {
      QueryResult::BackendError(Error::Backend { code, message }) if code != "42710" => {
        panic!("failed to create publication: {}", message)
      }
      _ => {}
    }

    if !conn.replication_slot_exists(slot).await.unwrap() {
      conn.create_replication_slot(slot).await.unwrap();
    }
  }

  let mut options = ReplicationOptions::new(slot, publication);
  options.messages = matches.get_flag("messages");

  let mut stream = conn.start_replication(options).await.unwrap();

  let interrupt = tokio::signal::ctrl_c();
  tokio::pin!(interrupt);

  // Keep the slot's confirmed position moving even when the stream is idle.
  let mut interval = tokio::time::interval(Duration::from_secs(10));
  let mut committed = Lsn::ZERO;

  loop {
    tokio::select! {
      Ok(_) = &mut interrupt => break,
      event = stream.recv() => {
        match event {
          Some(Ok(event)) => {
            match &event {
              WalEvent::Data { change: ChangeEvent::Commit { commit_end_lsn, .. }, .. } => {
                committed = *commit_end_lsn;
              }
              WalEvent::Keepalive { current_lsn, must_reply: true, .. } => {
                committed = committed.max(*current_lsn);
                stream.acknowledge(committed).await.unwrap();
              }
              _ => {}
            }
            println!("{}", serde_json::to_string(&event).unwrap());
          }
          Some(Err(err)) => panic!("{}", err),
          None => break,
        }
      },
      _ = interval.tick() => {
        if committed != Lsn::ZERO {
          stream.acknowledge(committed).await.unwrap();
        }
      },
    }
  }

  stream.close().await.unwrap();
}
