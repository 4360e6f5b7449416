//! Submission-server tests: a serialized recipe travels over the wire,
//! runs here, and lands in the recorder.

use std::time::Duration;

use data_types::Value;
use expression::Expr;
use futures::{SinkExt, StreamExt};
use protocol::{Request, Response};
use recorder::{RecorderConfig, Server};
use recorder_client::{get_record, Database};
use scanner::recipe::{RecipeEntry, RecipeLevel, RecipeSource, ScanRecipe};
use scanner::server::{SubmissionConfig, SubmissionServer};
use tokio::net::TcpStream;

async fn start_recorder(datapath: &std::path::Path) -> String {
    let config = RecorderConfig {
        port: 0,
        datapath: datapath.to_path_buf(),
        db_url: None,
        ping_timeout: Duration::from_millis(200),
    };
    let server = Server::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("tcp://127.0.0.1:{}", addr.port())
}

async fn start_submission() -> std::net::SocketAddr {
    let server = SubmissionServer::bind(&SubmissionConfig {
        port: 0,
        ping_timeout: Duration::from_millis(200),
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn request(addr: std::net::SocketAddr, req: Request) -> Response {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = protocol::framed(stream);
    framed.send(protocol::encode(&req).unwrap()).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    protocol::decode(&frame).unwrap()
}

#[tokio::test]
async fn submitted_recipe_runs_and_records() {
    test_helpers::maybe_start_logging();
    let dir = test_helpers::tmp_dir().unwrap();
    let recorder_url = start_recorder(dir.path()).await;
    let submission = start_submission().await;

    assert!(matches!(
        request(submission, Request::Ping).await,
        Response::Pong
    ));

    let mut recipe = ScanRecipe::new("submitted.sweep", recorder_url.clone());
    recipe.loops.push(RecipeLevel {
        entries: vec![RecipeEntry {
            keys: vec!["x".into()],
            source: RecipeSource::Values((0..5).map(Value::Int).collect()),
        }],
    });
    recipe
        .functions
        .insert("y".into(), Expr::symbol("x") * Expr::symbol("x"));

    let resp = request(
        submission,
        Request::Submit {
            recipe: protocol::encode(&recipe).unwrap().to_vec(),
        },
    )
    .await;
    let Response::Submitted(scan_id) = resp else {
        panic!("unexpected reply: {resp:?}");
    };

    // get_record_id polls until the scan has its record
    let resp = request(submission, Request::GetRecordId { id: scan_id }).await;
    let Response::SubmittedRecordId(Some(record_id)) = resp else {
        panic!("unexpected reply: {resp:?}");
    };

    // the scan is short; give it a moment to finish appending
    let mut y = None;
    for _ in 0..50 {
        let record = get_record(record_id, &Database::Url(recorder_url.clone()))
            .await
            .unwrap();
        if let Ok(a) = record.get_array("y", None).await {
            if a.len() == 5 && !a.iter().any(|v| v.is_nan()) {
                y = Some(a);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let y = y.expect("submitted scan should have written y");
    let got: Vec<i64> = y.iter().map(|v| v.as_i64().unwrap()).collect();
    assert_eq!(got, vec![0, 1, 4, 9, 16]);
}

#[tokio::test]
async fn unknown_scan_id_is_an_error() {
    let submission = start_submission().await;
    let resp = request(
        submission,
        Request::GetRecordId {
            id: data_types::ScanId::new(),
        },
    )
    .await;
    assert!(matches!(resp, Response::Error(_)), "got {resp:?}");
}
