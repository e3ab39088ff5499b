use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vidfetch_core::net::ReqwestNetClient;
use vidfetch_core::{CoreError, SegmentedTransfer, TransferConfig, TransferOutcome};

struct Request {
    method: String,
    path: String,
    range: Option<(usize, usize)>,
    trace: Option<String>,
}

#[derive(Default)]
struct ServerLog {
    requests: Mutex<Vec<(String, String, Option<(usize, usize)>)>>,
    traces: Mutex<Vec<Option<String>>>,
    flaky_hits: AtomicUsize,
}

fn read_request(stream: &TcpStream) -> Option<Request> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut range = None;
    let mut trace = None;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).ok()? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                let spec = value.trim().trim_start_matches("bytes=");
                if let Some((start, end)) = spec.split_once('-') {
                    range = Some((start.parse().ok()?, end.parse().ok()?));
                }
            } else if name.eq_ignore_ascii_case("x-trace") {
                trace = Some(value.trim().to_string());
            }
        }
    }
    Some(Request {
        method,
        path,
        range,
        trace,
    })
}

fn respond(mut stream: TcpStream, status: &str, headers: &[(String, String)], body: &[u8]) {
    let mut head = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

/// Sends the full body in `piece`-sized writes with `gap` between them.
fn respond_slowly(mut stream: TcpStream, body: &[u8], piece: usize, gap: Duration) {
    let head = format!(
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }
    for chunk in body.chunks(piece) {
        if stream.write_all(chunk).is_err() || stream.flush().is_err() {
            return;
        }
        thread::sleep(gap);
    }
}

fn handle(stream: TcpStream, data: &[u8], log: &ServerLog) {
    let Some(req) = read_request(&stream) else {
        return;
    };
    log.requests
        .lock()
        .unwrap()
        .push((req.method.clone(), req.path.clone(), req.range));
    log.traces.lock().unwrap().push(req.trace.clone());

    if req.path == "/missing" {
        respond(stream, "404 Not Found", &[("Content-Length".into(), "0".into())], b"");
        return;
    }
    if req.path == "/flaky" && log.flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 {
        respond(
            stream,
            "503 Service Unavailable",
            &[("Content-Length".into(), "0".into())],
            b"",
        );
        return;
    }

    let total = data.len();
    if req.method == "GET" && req.path == "/trickle" {
        respond_slowly(stream, data, 1000, Duration::from_millis(100));
        return;
    }
    if req.method == "GET" && req.path == "/stall" {
        respond_slowly(stream, data, total / 2, Duration::from_secs(4));
        return;
    }
    match (req.method.as_str(), req.range) {
        ("HEAD", _) => respond(
            stream,
            "200 OK",
            &[
                ("Content-Length".into(), total.to_string()),
                ("Accept-Ranges".into(), "bytes".into()),
            ],
            b"",
        ),
        ("GET", Some((start, end))) => {
            let end = end.min(total - 1);
            let body = &data[start..=end];
            respond(
                stream,
                "206 Partial Content",
                &[
                    ("Content-Length".into(), body.len().to_string()),
                    (
                        "Content-Range".into(),
                        format!("bytes {}-{}/{}", start, end, total),
                    ),
                ],
                body,
            );
        }
        _ => respond(
            stream,
            "200 OK",
            &[("Content-Length".into(), total.to_string())],
            data,
        ),
    }
}

fn serve(data: Vec<u8>) -> (String, Arc<ServerLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let data = Arc::new(data);
    let log = Arc::new(ServerLog::default());
    let server_log = Arc::clone(&log);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let data = Arc::clone(&data);
            let log = Arc::clone(&server_log);
            thread::spawn(move || handle(stream, &data, &log));
        }
    });
    (format!("http://{}", addr), log)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn client() -> Arc<ReqwestNetClient> {
    Arc::new(ReqwestNetClient::new(&TransferConfig::default()).expect("client"))
}

#[test]
fn segmented_download_matches_the_served_bytes() {
    let data = pattern(3 * 1024 * 1024 + 123);
    let (base, log) = serve(data.clone());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("file.bin");

    let last = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&last);
    let transfer = SegmentedTransfer::new(format!("{}/file.bin", base), &dest, client())
        .with_max_segments(4)
        .on_progress(move |percent, done, total| {
            *sink.lock().unwrap() = Some((percent, done, total));
        });
    let outcome = transfer.run().expect("transfer");

    assert_eq!(
        outcome,
        TransferOutcome::Completed {
            bytes: data.len() as u64
        }
    );
    assert_eq!(fs::read(&dest).unwrap(), data);
    let total = data.len() as u64;
    assert_eq!(*last.lock().unwrap(), Some((100.0, total, total)));

    let requests = log.requests.lock().unwrap();
    assert!(requests.iter().any(|(method, _, _)| method == "HEAD"));
    let ranged = requests.iter().filter(|(_, _, range)| range.is_some()).count();
    assert_eq!(ranged, 4);
}

#[test]
fn server_errors_are_retried_by_the_transport() {
    let data = pattern(40_000);
    let (base, log) = serve(data.clone());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("flaky.bin");

    SegmentedTransfer::new(format!("{}/flaky", base), &dest, client())
        .run()
        .expect("transfer");

    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(log.flaky_hits.load(Ordering::SeqCst) >= 2);
}

#[test]
fn missing_resource_is_an_http_error() {
    let (base, _log) = serve(pattern(10));
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("missing.bin");

    let err = SegmentedTransfer::new(format!("{}/missing", base), &dest, client())
        .run()
        .unwrap_err();

    match err {
        CoreError::HttpStatus { status, url } => {
            assert_eq!(status, 404);
            assert!(url.ends_with("/missing"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!dest.exists());
}

#[test]
fn custom_headers_are_sent() {
    let (base, log) = serve(pattern(1000));
    let dir = tempfile::tempdir().unwrap();
    let mut headers = HashMap::new();
    headers.insert("X-Trace".to_string(), "abc".to_string());

    SegmentedTransfer::new(format!("{}/small", base), dir.path().join("s.bin"), client())
        .with_headers(headers)
        .run()
        .expect("transfer");

    let traces = log.traces.lock().unwrap();
    assert!(!traces.is_empty());
    assert!(traces.iter().all(|trace| trace.as_deref() == Some("abc")));
}

fn impatient_config(stream_timeout: Duration) -> TransferConfig {
    TransferConfig {
        stream_timeout,
        retry_count: 0,
        ..TransferConfig::default()
    }
}

#[test]
fn slow_but_steady_body_outlives_the_stream_timeout() {
    let data = pattern(40_000);
    let (base, _log) = serve(data.clone());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("trickle.bin");
    let config = impatient_config(Duration::from_secs(2));
    let net = Arc::new(ReqwestNetClient::new(&config).expect("client"));

    let outcome = SegmentedTransfer::new(format!("{}/trickle", base), &dest, net)
        .with_config(config)
        .run()
        .expect("transfer");

    assert_eq!(outcome, TransferOutcome::Completed { bytes: 40_000 });
    assert_eq!(fs::read(&dest).unwrap(), data);
}

#[test]
fn silent_body_fails_after_the_stream_timeout() {
    let (base, _log) = serve(pattern(40_000));
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("stall.bin");
    let config = impatient_config(Duration::from_secs(1));
    let net = Arc::new(ReqwestNetClient::new(&config).expect("client"));

    let err = SegmentedTransfer::new(format!("{}/stall", base), &dest, net)
        .with_config(config)
        .run()
        .unwrap_err();

    assert!(matches!(err, CoreError::Network(_)), "unexpected error: {}", err);
}
