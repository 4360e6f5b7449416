//! End-to-end daemon tests over a real socket.

use std::collections::BTreeMap;
use std::time::Duration;

use data_types::{RecordDescription, RecordId, SliceOp, SliceSpec, Value};
use futures::{SinkExt, StreamExt};
use protocol::{ItemReply, Request, Response};
use recorder::{ping, watch_or_serve, RecorderConfig, ServeOutcome, Server};
use tokio::net::TcpStream;

async fn start_server(datapath: &std::path::Path) -> std::net::SocketAddr {
    let config = RecorderConfig {
        port: 0,
        datapath: datapath.to_path_buf(),
        db_url: None,
        ping_timeout: Duration::from_millis(200),
    };
    let server = Server::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

struct Client {
    framed: tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: protocol::framed(stream),
        }
    }

    async fn send(&mut self, req: Request) {
        let bytes = protocol::encode(&req).unwrap();
        self.framed.send(bytes).await.unwrap();
    }

    async fn request(&mut self, req: Request) -> Response {
        self.send(req).await;
        let frame = self.framed.next().await.unwrap().unwrap();
        protocol::decode(&frame).unwrap()
    }
}

fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn ping_pong() {
    let dir = test_helpers::tmp_dir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = Client::connect(addr).await;
    assert!(matches!(client.request(Request::Ping).await, Response::Pong));
}

#[tokio::test]
async fn scan_write_then_read_back() {
    test_helpers::maybe_start_logging();
    let dir = test_helpers::tmp_dir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = Client::connect(addr).await;

    let mut description = RecordDescription::new("workflow");
    description.axis.insert("x".into(), vec![0]);
    description.axis.insert("y".into(), vec![0]);
    let created = client
        .request(Request::RecordCreate {
            description: protocol::encode_description(&description).unwrap(),
        })
        .await;
    let Response::RecordId(id) = created else {
        panic!("unexpected reply: {created:?}");
    };

    // ten appends, fire-and-forget
    for i in 0..10u64 {
        client
            .send(Request::RecordAppend {
                record_id: id,
                level: 0,
                step: i,
                position: i,
                variables: vars(&[
                    ("x", Value::Int(i as i64)),
                    ("y", Value::Int((i * i) as i64)),
                ]),
            })
            .await;
    }
    client
        .send(Request::RecordAppend {
            record_id: id,
            level: -1,
            step: 0,
            position: 0,
            variables: BTreeMap::new(),
        })
        .await;

    // appends carry no reply; a ping barrier orders us behind them
    assert!(matches!(client.request(Request::Ping).await, Response::Pong));

    let keys = client.request(Request::RecordKeys { record_id: id }).await;
    let Response::Keys(mut keys) = keys else {
        panic!("unexpected reply: {keys:?}");
    };
    keys.sort();
    assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);

    let item = client
        .request(Request::RecordGetitem {
            record_id: id,
            key: "y".into(),
        })
        .await;
    let Response::Item(Some(ItemReply::Buffer(header))) = item else {
        panic!("unexpected reply: {item:?}");
    };
    assert_eq!(header.lu, vec![0]);
    assert_eq!(header.rd, vec![10]);
    assert!(header.file.is_some());

    let entries = client
        .request(Request::BufferlistSlice {
            record_id: id,
            key: "y".into(),
            slice: None,
        })
        .await;
    let Response::Entries(entries) = entries else {
        panic!("unexpected reply: {entries:?}");
    };
    let ys: Vec<i64> = entries.iter().map(|(_, v)| v.as_i64().unwrap()).collect();
    assert_eq!(ys, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);

    // server-side slicing
    let entries = client
        .request(Request::BufferlistSlice {
            record_id: id,
            key: "y".into(),
            slice: Some(SliceSpec(vec![SliceOp::Range {
                start: Some(0),
                stop: None,
                step: Some(3),
            }])),
        })
        .await;
    let Response::Entries(entries) = entries else {
        panic!("unexpected reply");
    };
    let ys: Vec<i64> = entries.iter().map(|(_, v)| v.as_i64().unwrap()).collect();
    assert_eq!(ys, vec![0, 9, 36, 81]);

    let desc = client
        .request(Request::RecordDescription { record_id: id })
        .await;
    let Response::Description(bytes) = desc else {
        panic!("unexpected reply: {desc:?}");
    };
    assert_eq!(
        protocol::decode_description(&bytes).unwrap().app,
        "workflow"
    );
}

#[tokio::test]
async fn reads_see_data_while_scan_still_running() {
    let dir = test_helpers::tmp_dir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut writer = Client::connect(addr).await;

    let created = writer
        .request(Request::RecordCreate {
            description: protocol::encode_description(&RecordDescription::new("live")).unwrap(),
        })
        .await;
    let Response::RecordId(id) = created else {
        panic!("no id");
    };

    writer
        .send(Request::RecordAppend {
            record_id: id,
            level: 0,
            step: 0,
            position: 0,
            variables: vars(&[("v", Value::Float(0.25))]),
        })
        .await;
    assert!(matches!(writer.request(Request::Ping).await, Response::Pong));

    // a second connection reads the unflushed point
    let mut reader = Client::connect(addr).await;
    let entries = reader
        .request(Request::BufferlistSlice {
            record_id: id,
            key: "v".into(),
            slice: None,
        })
        .await;
    let Response::Entries(entries) = entries else {
        panic!("unexpected reply");
    };
    assert_eq!(entries, vec![(vec![0], Value::Float(0.25))]);
}

#[tokio::test]
async fn unknown_record_answers_error_not_silence() {
    let dir = test_helpers::tmp_dir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = Client::connect(addr).await;

    let resp = client
        .request(Request::RecordKeys {
            record_id: RecordId::new(4242),
        })
        .await;
    assert!(matches!(resp, Response::Error(_)), "got {resp:?}");
}

#[tokio::test]
async fn query_lists_created_records() {
    let dir = test_helpers::tmp_dir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = Client::connect(addr).await;

    for app in ["t1.rabi", "t1.spec"] {
        let mut d = RecordDescription::new(app);
        d.tags.push("cal".into());
        let resp = client
            .request(Request::RecordCreate {
                description: protocol::encode_description(&d).unwrap(),
            })
            .await;
        assert!(matches!(resp, Response::RecordId(_)));
    }

    let resp = client
        .request(Request::RecordQuery {
            app: Some("t1.*".into()),
            tags: vec!["cal".into()],
            offset: 0,
            limit: 10,
            before: None,
            after: None,
        })
        .await;
    let Response::Query(listing) = resp else {
        panic!("unexpected reply: {resp:?}");
    };
    assert_eq!(listing.total, 2);
    assert!(listing.apps.0.contains_key("t1"));
    assert_eq!(listing.rows.len(), 2);
}

#[tokio::test]
async fn delete_removes_catalog_row_and_files() {
    let dir = test_helpers::tmp_dir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = Client::connect(addr).await;

    let Response::RecordId(id) = client
        .request(Request::RecordCreate {
            description: protocol::encode_description(&RecordDescription::new("gone")).unwrap(),
        })
        .await
    else {
        panic!("no id");
    };
    client
        .send(Request::RecordAppend {
            record_id: id,
            level: 0,
            step: 0,
            position: 0,
            variables: vars(&[("x", Value::Int(1))]),
        })
        .await;
    assert!(matches!(client.request(Request::Ping).await, Response::Pong));

    let resp = client.request(Request::RecordDelete { record_id: id }).await;
    assert!(matches!(resp, Response::Empty));

    let resp = client
        .request(Request::RecordDescription { record_id: id })
        .await;
    assert!(matches!(resp, Response::Error(_)));
}

#[tokio::test]
async fn second_start_on_same_port_reports_already_running() {
    let dir = test_helpers::tmp_dir().unwrap();
    let addr = start_server(dir.path()).await;
    assert!(ping(&addr.to_string(), Duration::from_secs(1)).await);

    let config = RecorderConfig {
        port: addr.port(),
        datapath: dir.path().to_path_buf(),
        db_url: None,
        ping_timeout: Duration::from_secs(1),
    };
    let outcome = watch_or_serve(config).await.unwrap();
    assert_eq!(outcome, ServeOutcome::AlreadyRunning);
}
