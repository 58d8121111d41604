//! End-to-end transaction and channel tests over two connected engines.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tandem::config::{Config, TransferConfig};
use tandem::socket::Message;
use tandem::transaction::{sized, Metadata};
use tandem::transport::memory::MemoryPeer;
use tandem::transport::{Connector, PeerConnection, RtcConfiguration};
use tandem::{
    ChannelEvent, Engine, EventSource, LocalSignaler, TandemError, TransactionState,
};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(10);
const MIB: usize = 1024 * 1024;

fn connector(pc: Arc<MemoryPeer>) -> impl Connector {
    move |rtc: &RtcConfiguration| {
        pc.configure(rtc);
        Ok::<_, TandemError>(Arc::clone(&pc) as Arc<dyn PeerConnection>)
    }
}

async fn connected(transfer: TransferConfig) -> (Engine, Engine) {
    let config = Config {
        transfer,
        ..Config::default()
    };
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, pc_b) = MemoryPeer::pair();

    let a = Engine::with_config(sig_a, &connector(pc_a), config.clone()).unwrap();
    let b = Engine::with_config(sig_b, &connector(pc_b), config).unwrap();
    timeout(TIMEOUT, async { tokio::try_join!(a.connect(), b.connect()) })
        .await
        .expect("connect timed out")
        .expect("connect failed");
    (a, b)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_labeled_transfer_round_trip() {
    let (a, b) = connected(TransferConfig::default()).await;
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    let mut metadata = sized(payload.len() as u64);
    metadata.insert("name".to_string(), json!("numbers.bin"));

    let (writer, reader) = timeout(TIMEOUT, async {
        tokio::try_join!(a.writable(Some("upload"), metadata), b.readable("upload"))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reader.metadata()["name"], "numbers.bin");
    assert_eq!(reader.transaction().size(), Some(payload.len() as u64));

    let send = async {
        for piece in payload.chunks(64 * 1024) {
            writer.write(piece.to_vec()).await?;
        }
        writer.finish().await
    };
    let receive = async {
        let mut chunks = reader.into_stream();
        let mut received = Vec::new();
        while let Some(chunk) = chunks.next().await {
            received.extend_from_slice(&chunk?);
        }
        Ok::<_, TandemError>(received)
    };
    let (_, received) = timeout(TIMEOUT, async { tokio::try_join!(send, receive) })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, payload);
    assert_eq!(writer.state(), TransactionState::Done);
    assert_eq!(writer.processed(), payload.len() as u64);
}

#[tokio::test]
async fn test_exact_chunk_is_sent_once() {
    let (a, b) = connected(TransferConfig::default()).await;
    let size = 204_800;

    let mut readables = b.readables();

    // The writer opens this channel, so it sends nothing but metadata and data
    let writer = timeout(TIMEOUT, a.writable(None, sized(size as u64)))
        .await
        .unwrap()
        .unwrap();
    let reader = timeout(TIMEOUT, readables.recv()).await.unwrap().unwrap();

    writer.write(vec![7u8; size]).await.unwrap();
    writer.finish().await.unwrap();

    let chunk = timeout(TIMEOUT, reader.read()).await.unwrap().unwrap().unwrap();
    assert_eq!(chunk.len(), size);
    assert!(reader.read().await.unwrap().is_none());

    let stats = a.stats(writer.transaction().socket()).await.unwrap().unwrap();
    assert_eq!(stats.messages_sent, 2);
}

#[tokio::test]
async fn test_reader_buffer_full_blocks_and_pull_releases() {
    let transfer = TransferConfig {
        chunk_size: MIB,
        ..TransferConfig::default()
    };
    let (a, b) = connected(transfer).await;

    let (writer, reader) = timeout(TIMEOUT, async {
        tokio::try_join!(a.writable(Some("bulk"), sized(20 * MIB as u64)), b.readable("bulk"))
    })
    .await
    .unwrap()
    .unwrap();
    let writer = Arc::new(writer);

    // Eleven 1 MiB chunks put the reader queue over its 10 MiB mark
    timeout(TIMEOUT, writer.write(vec![0u8; 11 * MIB]))
        .await
        .unwrap()
        .unwrap();
    let flag = writer.clone();
    eventually(move || flag.is_remote_buffer_full()).await;
    assert_eq!(reader.queued(), 11 * MIB);

    for _ in 0..2 {
        reader.read().await.unwrap().unwrap();
    }
    let flag = writer.clone();
    eventually(move || !flag.is_remote_buffer_full()).await;

    // The queue crosses the mark again, so the rest only flows while reading
    let send = async {
        writer.write(vec![0u8; 9 * MIB]).await?;
        writer.finish().await
    };
    let drain = async {
        let mut rest = 0;
        while let Some(chunk) = reader.read().await? {
            rest += chunk.len();
        }
        Ok::<_, TandemError>(rest)
    };
    let (_, rest) = timeout(TIMEOUT, async { tokio::try_join!(send, drain) })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rest, 18 * MIB);
    assert_eq!(reader.state(), TransactionState::Done);
}

#[tokio::test]
async fn test_cancel_fails_writer_with_reason() {
    let (a, b) = connected(TransferConfig::default()).await;
    let (writer, reader) = timeout(TIMEOUT, async {
        tokio::try_join!(a.writable(Some("doomed"), sized(1_000_000)), b.readable("doomed"))
    })
    .await
    .unwrap()
    .unwrap();

    writer.write(vec![1u8; 300_000]).await.unwrap();
    reader.cancel("no reason").await.unwrap();

    let state = timeout(TIMEOUT, writer.transaction().finished()).await.unwrap();
    assert_eq!(state, TransactionState::Canceled);

    let err = writer.write(vec![1u8; 300_000]).await.unwrap_err();
    assert!(matches!(err, TandemError::Canceled(ref reason) if reason == "no reason"));

    timeout(TIMEOUT, writer.transaction().socket().closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_abort_fails_reader() {
    let (a, b) = connected(TransferConfig::default()).await;
    let (writer, reader) = timeout(TIMEOUT, async {
        tokio::try_join!(a.writable(Some("aborted"), sized(100)), b.readable("aborted"))
    })
    .await
    .unwrap()
    .unwrap();

    writer.abort("TypeError", "source went away").await.unwrap();

    let err = timeout(TIMEOUT, reader.read()).await.unwrap().unwrap_err();
    match err {
        TandemError::Aborted { name, message } => {
            assert_eq!(name, "TypeError");
            assert_eq!(message, "source went away");
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(reader.state(), TransactionState::Aborted);
}

#[tokio::test]
async fn test_writer_socket_close_fails_reader() {
    let (a, b) = connected(TransferConfig::default()).await;
    let (writer, reader) = timeout(TIMEOUT, async {
        tokio::try_join!(a.writable(Some("cut"), sized(100)), b.readable("cut"))
    })
    .await
    .unwrap()
    .unwrap();

    writer.write(vec![0u8; 10]).await.unwrap();
    writer.transaction().socket().close();

    let state = timeout(TIMEOUT, reader.transaction().finished()).await.unwrap();
    assert_eq!(state, TransactionState::Failed);
    assert!(matches!(
        reader.read_to_end().await,
        Err(TandemError::ClosedUnexpectedly(_))
    ));
}

#[tokio::test]
async fn test_pause_and_resume_complete_transfer() {
    let transfer = TransferConfig {
        chunk_size: 64 * 1024,
        ..TransferConfig::default()
    };
    let (a, b) = connected(transfer).await;
    let size = 2 * MIB;

    let (writer, reader) = timeout(TIMEOUT, async {
        tokio::try_join!(a.writable(Some("paused"), sized(size as u64)), b.readable("paused"))
    })
    .await
    .unwrap()
    .unwrap();
    let writer = Arc::new(writer);

    writer.write(vec![0u8; MIB]).await.unwrap();
    reader.pause().await.unwrap();
    timeout(TIMEOUT, writer.transaction().watch_paused().wait_for(true))
        .await
        .unwrap();
    assert_eq!(writer.state(), TransactionState::Paused);

    // Writes block while paused
    let blocked = {
        let writer = writer.clone();
        tokio::spawn(async move {
            writer.write(vec![0u8; MIB]).await?;
            writer.finish().await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(writer.processed(), MIB as u64);

    reader.resume().await.unwrap();
    let received = timeout(TIMEOUT, reader.read_to_end()).await.unwrap().unwrap();
    timeout(TIMEOUT, blocked).await.unwrap().unwrap().unwrap();

    assert_eq!(received.len(), size);
    assert_eq!(reader.processed(), size as u64);
    assert_eq!(writer.state(), TransactionState::Done);
}

#[tokio::test]
async fn test_unsized_transfer_streams_until_close() {
    let (a, b) = connected(TransferConfig::default()).await;
    let mut readables = b.readables();

    let writer = timeout(TIMEOUT, a.writable(None, Metadata::new()))
        .await
        .unwrap()
        .unwrap();
    let reader = timeout(TIMEOUT, readables.recv()).await.unwrap().unwrap();
    assert_eq!(reader.transaction().size(), None);

    let mut source = &b"streamed without a size"[..];
    let sent = writer.pipe_from(&mut source).await.unwrap();
    assert_eq!(sent, 23);

    let mut sink = Vec::new();
    let copied = timeout(TIMEOUT, reader.pipe_to(&mut sink)).await.unwrap().unwrap();
    assert_eq!(copied, 23);
    assert_eq!(sink, b"streamed without a size".to_vec());
    assert_eq!(reader.state(), TransactionState::Done);
}

#[tokio::test]
async fn test_channel_messages_and_files() {
    let (a, b) = connected(TransferConfig::default()).await;
    let (left, right) = timeout(TIMEOUT, async {
        tokio::try_join!(a.channel("files"), b.channel("files"))
    })
    .await
    .unwrap()
    .unwrap();
    let mut events = right.subscribe();

    left.send_json(&json!({"kind": "hello"})).await.unwrap();
    match timeout(TIMEOUT, events.recv()).await.unwrap().unwrap() {
        ChannelEvent::Message(Message::Json(value)) => assert_eq!(value["kind"], "hello"),
        other => panic!("unexpected event: {other:?}"),
    }

    let mut metadata = sized(11);
    metadata.insert("name".to_string(), json!("greeting.txt"));
    let mut source = &b"hello world"[..];

    let receive = async {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Transaction(reader)) => {
                    assert_eq!(reader.label(), "files/file-0");
                    assert_eq!(reader.metadata()["name"], "greeting.txt");
                    return reader.read_to_end().await;
                },
                Some(_) => continue,
                None => return Err(TandemError::Closed),
            }
        }
    };
    let (sent, received) = timeout(TIMEOUT, async {
        tokio::try_join!(left.send_file(metadata, &mut source), receive)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(sent, 11);
    assert_eq!(received, b"hello world".to_vec());
}
