//! Integration tests for the REST client and end-to-end gathering
//!
//! The REST API is served by mockito and the memcached data port by a
//! local TCP listener speaking the binary protocol.

use bytes::BytesMut;
use couchbase_input::client::{Opcode, Packet};
use couchbase_input::{
    Accumulator, ClientConfig, ClientError, ClusterClient, ClusterConnector, CouchbaseConfig,
    CouchbaseInput, FieldValue, HttpConnector, Input, MetricBuffer,
};
use mockito::{Matcher, Server, ServerGuard};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const POOLS: &str = r#"{
    "isAdminCreds": true,
    "implementationVersion": "7.2.0-5325-enterprise",
    "pools": [
        {"name": "default", "uri": "/pools/default", "streamingUri": "/poolsStreaming/default"}
    ]
}"#;

fn pool_document(rest_host: &str) -> String {
    format!(
        r#"{{
            "name": "default",
            "nodes": [{{
                "hostname": "{}",
                "memoryFree": 22069141504,
                "memoryTotal": 64424656896,
                "ports": {{"direct": 11210}}
            }}],
            "buckets": {{"uri": "/pools/default/buckets"}}
        }}"#,
        rest_host
    )
}

const BUCKETS: &str = r#"[{
    "name": "blastro-df",
    "bucketType": "membase",
    "basicStats": {
        "quotaPercentUsed": 68.85,
        "opsPerSec": 5686.79,
        "diskFetches": 0,
        "itemCount": 943239752,
        "diskUsed": 409178772321,
        "dataUsed": 212179309111,
        "memUsed": 202156957464
    },
    "nodes": []
}]"#;

fn bucket_detail(data_port: u16) -> String {
    format!(
        r#"{{
            "name": "blastro-df",
            "basicStats": {{"itemCount": 943239752}},
            "nodes": [{{"hostname": "127.0.0.1:8091", "ports": {{"direct": {}}}}}]
        }}"#,
        data_port
    )
}

async fn mock_rest(server: &mut ServerGuard, data_port: u16) {
    server
        .mock("GET", "/pools")
        .with_header("content-type", "application/json")
        .with_body(POOLS)
        .create_async()
        .await;
    server
        .mock("GET", "/pools/default")
        .with_header("content-type", "application/json")
        .with_body(pool_document("127.0.0.1:8091"))
        .create_async()
        .await;
    server
        .mock("GET", "/pools/default/buckets")
        .with_header("content-type", "application/json")
        .with_body(BUCKETS)
        .create_async()
        .await;
    server
        .mock("GET", "/pools/default/buckets/blastro-df")
        .with_header("content-type", "application/json")
        .with_body(bucket_detail(data_port))
        .create_async()
        .await;
}

/// Accept connections and answer SASL, SELECT_BUCKET and STAT requests
async fn fake_data_port(stats: &'static [(&'static str, &'static str)]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };

            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                loop {
                    let request = loop {
                        if let Some(p) = Packet::decode(&mut buf).unwrap() {
                            break p;
                        }
                        match socket.read_buf(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                    };

                    let mut out = BytesMut::new();
                    if request.opcode == Opcode::Stat as u8 {
                        for (k, v) in stats {
                            Packet::response(Opcode::Stat, 0, *k, *v, request.opaque)
                                .encode(&mut out);
                        }
                        Packet::response(Opcode::Stat, 0, "", "", request.opaque).encode(&mut out);
                    } else if request.opcode == Opcode::SaslAuth as u8 {
                        Packet::response(Opcode::SaslAuth, 0, "", "Authenticated", request.opaque)
                            .encode(&mut out);
                    } else {
                        Packet::response(Opcode::SelectBucket, 0, "", "", request.opaque)
                            .encode(&mut out);
                    }

                    if socket.write_all(&out).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    port
}

async fn gather(input: &CouchbaseInput) -> Arc<MetricBuffer> {
    let buffer = Arc::new(MetricBuffer::new());
    let acc: Arc<dyn Accumulator> = buffer.clone();
    input.gather(acc).await.unwrap();
    buffer
}

#[tokio::test]
async fn test_connect_and_get_pool() {
    let mut server = Server::new_async().await;
    mock_rest(&mut server, 11210).await;

    let connector = HttpConnector::new(ClientConfig::default()).unwrap();
    let client = connector.connect(&server.url()).await.unwrap();
    let pool = client.get_pool("default").await.unwrap();

    assert_eq!(pool.nodes.len(), 1);
    assert_eq!(pool.nodes[0].hostname, "127.0.0.1:8091");
    assert_eq!(pool.nodes[0].memory_free, 22069141504.0);
    assert_eq!(pool.bucket_map.len(), 1);
    let bucket = &pool.bucket_map["blastro-df"];
    assert_eq!(bucket.basic_stats.quota_percent_used, 68.85);
    assert_eq!(bucket.basic_stats.item_count, 943239752.0);
}

#[tokio::test]
async fn test_connect_sends_basic_auth() {
    let mut server = Server::new_async().await;
    let pools = server
        .mock("GET", "/pools")
        .match_header("authorization", "Basic YWRtaW46c2VjcmV0")
        .with_body(POOLS)
        .create_async()
        .await;

    let address = server.url().replace("http://", "http://admin:secret@");
    let connector = HttpConnector::new(ClientConfig::default()).unwrap();
    assert!(connector.connect(&address).await.is_ok());

    pools.assert_async().await;
}

#[tokio::test]
async fn test_connect_rejected() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/pools")
        .with_status(401)
        .with_body("Unauthorized")
        .create_async()
        .await;

    let connector = HttpConnector::new(ClientConfig::default()).unwrap();
    let err = connector.connect(&server.url()).await.err().unwrap();

    assert!(matches!(err, ClientError::Status { status: 401, .. }));
}

#[tokio::test]
async fn test_unknown_pool() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/pools")
        .with_body(r#"{"pools": [{"name": "other", "uri": "/pools/other"}]}"#)
        .create_async()
        .await;

    let connector = HttpConnector::new(ClientConfig::default()).unwrap();
    let client = connector.connect(&server.url()).await.unwrap();
    let err = client.get_pool("default").await.unwrap_err();

    assert!(matches!(err, ClientError::PoolNotFound(_)));
}

#[tokio::test]
async fn test_malformed_pool_document() {
    let mut server = Server::new_async().await;
    server.mock("GET", "/pools").with_body(POOLS).create_async().await;
    server
        .mock("GET", "/pools/default")
        .with_body("not json")
        .create_async()
        .await;

    let connector = HttpConnector::new(ClientConfig::default()).unwrap();
    let client = connector.connect(&server.url()).await.unwrap();
    let err = client.get_pool("default").await.unwrap_err();

    assert!(matches!(err, ClientError::Decode { .. }));
}

#[tokio::test]
async fn test_gather_end_to_end_with_detailed_stats() {
    static STATS: &[(&str, &str)] = &[
        ("curr_items", "42"),
        ("ep_diskqueue_items", "7"),
        ("ep_version", "7.2.0"),
    ];
    let data_port = fake_data_port(STATS).await;

    let mut server = Server::new_async().await;
    mock_rest(&mut server, data_port).await;

    let address = format!("{}/", server.url());
    let input = CouchbaseInput::from_config(CouchbaseConfig {
        servers: vec![address.clone()],
        bucket_node_stats: vec!["*".to_string()],
        client: ClientConfig::default(),
    })
    .unwrap();

    let buffer = gather(&input).await;

    assert_eq!(buffer.error_count(), 0, "errors: {:?}", buffer.errors());
    assert_eq!(buffer.metrics_named("couchbase_node").len(), 1);
    assert_eq!(buffer.metrics_named("couchbase_bucket").len(), 1);

    let detailed = buffer.metrics_named("couchbase_bucket_node");
    assert_eq!(detailed.len(), 1);
    let record = &detailed[0];
    assert_eq!(record.tag("cluster"), Some(address.as_str()));
    assert_eq!(record.tag("bucket"), Some("blastro-df"));
    assert_eq!(record.tag("hostname"), Some(format!("127.0.0.1:{}", data_port).as_str()));
    assert_eq!(record.fields.len(), 2);
    assert_eq!(record.field("curr_items"), Some(FieldValue::Float(42.0)));
    assert_eq!(record.field("ep_version"), None);
}

#[tokio::test]
async fn test_gather_reports_unreachable_server() {
    let mut server = Server::new_async().await;
    mock_rest(&mut server, 11210).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://{}/", listener.local_addr().unwrap());
    drop(listener);

    let input = CouchbaseInput::from_config(CouchbaseConfig {
        servers: vec![format!("{}/", server.url()), dead.clone()],
        ..Default::default()
    })
    .unwrap();

    let buffer = gather(&input).await;

    assert_eq!(buffer.metrics_named("couchbase_node").len(), 1);
    assert_eq!(buffer.metrics_named("couchbase_bucket").len(), 1);
    let errors = buffer.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(&dead));
}

#[tokio::test]
async fn test_connect_reads_pool_listing_once() {
    let mut server = Server::new_async().await;
    let pools = server
        .mock("GET", "/pools")
        .match_query(Matcher::Any)
        .with_body(POOLS)
        .expect(1)
        .create_async()
        .await;

    let connector = HttpConnector::new(ClientConfig::default()).unwrap();
    connector.connect(&server.url()).await.unwrap();

    pools.assert_async().await;
}
