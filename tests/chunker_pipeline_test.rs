//! Chunkers feeding a live data server, read back through a client.

use daq_stream::archive::ArchiveWriter;
use daq_stream::chunker::{ChunkerManager, ChunkerRegistry};
use daq_stream::client::DataClient;
use daq_stream::config::{BufferLimits, BufferSettings, ChunkerConfig, Settings};
use daq_stream::data::{DataManager, DataRequirements};
use daq_stream::error::DaqError;
use daq_stream::server::DataServer;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

async fn serve(data: Arc<DataManager>) -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let server = DataServer::with_wait_timeout(data, Duration::from_secs(5));
    tokio::spawn(async move { server.serve(listener, rx).await });
    (addr, tx)
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_udp_packets_served_as_chunks() {
    let data = Arc::new(DataManager::new(BufferSettings::uniform(BufferLimits::new(
        4096, 256,
    ))));
    let port = free_udp_port();
    let mut chunkers = ChunkerManager::new(ChunkerRegistry::with_builtin());
    chunkers
        .add_stream_chunker(
            ChunkerConfig::new("udp", ["visibilities"])
                .with_endpoint("127.0.0.1", port)
                .with_packets(16, 2),
        )
        .unwrap();
    chunkers.init(Arc::clone(&data)).unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.connect(("127.0.0.1", port)).unwrap();
    for packet in 0..4u8 {
        sender.send(&[packet; 16]).unwrap();
    }

    let (addr, shutdown) = serve(Arc::clone(&data)).await;
    let mut client = DataClient::connect(addr).await.unwrap();
    let options = [DataRequirements::for_stream("visibilities")];

    let first = client.request_stream(&options).await.unwrap();
    assert_eq!(first.payload.len(), 32);
    assert_eq!(&first.payload[..16], &[0u8; 16]);
    assert_eq!(&first.payload[16..], &[1u8; 16]);

    let second = client.request_stream(&options).await.unwrap();
    assert_eq!(&second.payload[..16], &[2u8; 16]);
    assert!(second.version > first.version);

    shutdown.send(true).unwrap();
    tokio::task::spawn_blocking(move || chunkers.stop())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_configured_chunkers_serve_stream_with_service_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.blob");
    let mut writer = ArchiveWriter::create(&path).unwrap();
    for i in 0..3u8 {
        writer.write_record("beams", &[i; 8]).unwrap();
    }
    writer.finish().unwrap();

    let settings = Settings::from_toml_str(&format!(
        r#"
        [buffers.default]
        max_bytes = 4096
        max_chunk_bytes = 512

        [[chunkers]]
        kind = "archive"
        data_types = ["beams"]
        path = "{}"
        "#,
        path.display()
    ))
    .unwrap();

    let data = Arc::new(DataManager::new(settings.buffers.clone()));
    {
        let mut positions = data.get_service_writable("positions", 4).unwrap();
        positions.write(b"xyz0");
    }
    let mut chunkers =
        ChunkerManager::from_settings(ChunkerRegistry::with_builtin(), &settings).unwrap();
    chunkers.init(Arc::clone(&data)).unwrap();

    let (addr, shutdown) = serve(Arc::clone(&data)).await;
    let mut client = DataClient::connect(addr).await.unwrap();
    let options = [DataRequirements::for_stream("beams").with_service("positions")];
    for i in 0..3u8 {
        let received = client.next_data(&options).await.unwrap();
        assert_eq!(&received.stream.payload[..], &[i; 8]);
        assert_eq!(received.services.len(), 1);
        assert_eq!(&received.services[0].payload[..], b"xyz0");
    }

    shutdown.send(true).unwrap();
    tokio::task::spawn_blocking(move || chunkers.stop())
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_two_chunkers_on_one_port_rejected() {
    let mut chunkers = ChunkerManager::new(ChunkerRegistry::with_builtin());
    chunkers
        .add_stream_chunker(ChunkerConfig::new("udp", ["A"]).with_endpoint("0.0.0.0", 2001))
        .unwrap();
    let err = chunkers
        .add_service_chunker(ChunkerConfig::new("udp", ["B"]).with_endpoint("0.0.0.0", 2001))
        .unwrap_err();
    assert!(matches!(err, DaqError::EndpointInUse { port: 2001, .. }));
}
