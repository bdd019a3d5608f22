use std::{
    collections::BTreeSet,
    io::{Read, Write},
    net::TcpStream,
    thread,
    time::{Duration, Instant},
};

use httpstub::{prelude::*, Outcome};

mod utils;
use utils::{client, init_logging, send_raw, wait_until};

#[test]
fn sequential_requests_are_recorded_in_order() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    let client = client();

    for i in 0..20 {
        client.get(server.url(format!("/item/{}", i))).send().unwrap();
    }

    let requests = server.requests();
    assert_eq!(requests.len(), 20);
    for (i, req) in requests.iter().enumerate() {
        assert_eq!(req.path(), format!("/item/{}", i));
    }
    assert!(requests.windows(2).all(|w| w[0].sequence() < w[1].sequence()));
}

#[test]
fn concurrent_clients_lose_no_requests() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    server.rule(|when, then| {
        when.path_pattern("/client/*");
        then.status(200);
    });

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let url = server.url(format!("/client/{}", i));
            thread::spawn(move || client().get(url).send().unwrap().status().as_u16())
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 200);
    }

    let requests = server.requests();
    assert_eq!(requests.len(), 10);

    let paths: BTreeSet<_> = requests.iter().map(|r| r.path().to_string()).collect();
    assert_eq!(paths.len(), 10);

    let sequences: BTreeSet<_> = requests.iter().map(|r| r.sequence()).collect();
    assert_eq!(sequences.len(), 10);
}

#[test]
fn static_response_round_trips_byte_for_byte() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let body: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    server.add_rule(
        RequestMatcher::new().path("/blob"),
        ResponseTemplate::new(206)
            .header("content-type", "application/octet-stream")
            .header("x-custom", "one")
            .body(body.clone()),
    );

    for _ in 0..3 {
        let response = client().get(server.url("/blob")).send().unwrap();
        assert_eq!(response.status(), 206);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(response.headers().get("x-custom").unwrap(), "one");
        assert_eq!(
            response.headers().get("content-length").unwrap(),
            &body.len().to_string()
        );
        assert_eq!(&response.bytes().unwrap()[..], body.as_slice());
    }
}

#[test]
fn failing_responder_does_not_affect_later_requests() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let failing = server.rule_fn(
        |when| {
            when.path("/fail");
        },
        |_| Err("database unreachable".into()),
    );
    let panicking = server.rule_fn(
        |when| {
            when.path("/panic");
        },
        |_| panic!("responder bug"),
    );
    server.rule(|when, then| {
        when.path("/ok");
        then.status(200).body("fine");
    });

    let response = client().get(server.url("/fail")).send().unwrap();
    assert_eq!(response.status(), 500);
    assert!(response.text().unwrap().contains("database unreachable"));

    let response = client().get(server.url("/panic")).send().unwrap();
    assert_eq!(response.status(), 500);

    let response = client().get(server.url("/ok")).send().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().unwrap(), "fine");

    let exchanges = server.exchanges();
    assert_eq!(exchanges.len(), 3);
    assert!(matches!(
        &exchanges[0].response.as_ref().unwrap().outcome,
        Outcome::ResponderFailed { rule, .. } if *rule == failing
    ));
    assert!(matches!(
        &exchanges[1].response.as_ref().unwrap().outcome,
        Outcome::ResponderFailed { rule, .. } if *rule == panicking
    ));
    assert!(matches!(
        &exchanges[2].response.as_ref().unwrap().outcome,
        Outcome::Matched { .. }
    ));
}

#[test]
fn panicking_matcher_is_answered_with_500() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let exploding = server.rule(|when, then| {
        when.is_true(|req| {
            if req.path() == "/boom" {
                panic!("matcher bug");
            }
            false
        });
        then.status(200);
    });

    let response = client().get(server.url("/boom")).send().unwrap();
    assert_eq!(response.status(), 500);
    assert!(response.text().unwrap().contains("matcher bug"));

    assert_eq!(client().get(server.url("/ok")).send().unwrap().status(), 404);

    let exchanges = server.exchanges();
    assert_eq!(exchanges.len(), 2);
    let first = exchanges[0].response.as_ref().unwrap();
    assert_eq!(first.status, 500);
    assert!(matches!(
        &first.outcome,
        Outcome::ResponderFailed { rule, .. } if *rule == exploding
    ));
    assert_eq!(exchanges[1].response.as_ref().unwrap().status, 404);
    assert_eq!(server.rule_hits(exploding), Some(0));
}

#[test]
fn repeated_headers_keep_their_value_order() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let raw = send_raw(
        server.address().unwrap(),
        b"GET /h HTTP/1.1\r\nHost: a\r\nX-A: 1\r\nX-B: 2\r\nX-A: 3\r\nConnection: close\r\n\r\n",
    );
    assert!(raw.starts_with("HTTP/1.1 404"));

    let req = server.last_request().unwrap();
    assert_eq!(req.header_values("X-A"), vec!["1", "3"]);
    assert_eq!(req.header("x-b"), Some("2"));

    let names: Vec<&str> = req.headers().iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["host", "x-a", "x-a", "x-b", "connection"]);
}

#[test]
fn keep_alive_connections_are_reused() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let mut stream = TcpStream::connect(server.address().unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // First exchange: the connection stays open after the response.
    stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: stub\r\n\r\n")
        .unwrap();
    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404"));
    assert!(head.to_ascii_lowercase().contains("content-length: 0"));

    // Second exchange on the same socket, asking the server to close afterwards.
    stream
        .write_all(b"GET /second HTTP/1.1\r\nHost: stub\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut rest = String::new();
    stream.read_to_string(&mut rest).unwrap();
    assert!(rest.starts_with("HTTP/1.1 404"));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].remote_addr(), requests[1].remote_addr());
}

/// Reads a response head byte by byte so nothing of a following response is consumed.
fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

#[test]
fn pipelined_requests_on_one_connection_are_recorded_separately() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let raw = send_raw(
        server.address().unwrap(),
        b"GET /first HTTP/1.1\r\nHost: stub\r\n\r\n\
          GET /second HTTP/1.1\r\nHost: stub\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(raw.matches("HTTP/1.1 404").count(), 2);

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path(), "/first");
    assert_eq!(requests[1].path(), "/second");
    assert_eq!(requests[0].remote_addr(), requests[1].remote_addr());
}

#[test]
fn http_1_0_requests_are_answered_and_closed() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let raw = send_raw(server.address().unwrap(), b"GET /old HTTP/1.0\r\n\r\n");

    assert!(raw.contains(" 404 "));
    assert_eq!(server.last_request().unwrap().version(), "HTTP/1.0");
}

#[test]
fn chunked_bodies_are_dechunked() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let raw = send_raw(
        server.address().unwrap(),
        b"POST /upload HTTP/1.1\r\nHost: stub\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
          5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );
    assert!(raw.starts_with("HTTP/1.1 404"));

    let last = server.last_request().unwrap();
    assert_eq!(last.method(), "POST");
    assert_eq!(last.body_str(), "hello world");
    assert_eq!(last.header("transfer-encoding"), Some("chunked"));
}

#[test]
fn malformed_requests_get_400_and_are_recorded() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    let raw = send_raw(server.address().unwrap(), b"this is not http\r\n\r\n");
    assert!(raw.starts_with("HTTP/1.1 400"));

    assert!(wait_until(Duration::from_secs(5), || server.requests().len() == 1));

    let req = server.last_request().unwrap();
    assert!(req.is_malformed());
    assert!(req.parse_error().is_some());
    assert_eq!(req.path(), "");

    let exchanges = server.exchanges();
    let response = exchanges[0].response.as_ref().unwrap();
    assert_eq!(response.status, 400);
    assert!(matches!(response.outcome, Outcome::Malformed { .. }));

    // The server keeps serving.
    assert_eq!(client().get(server.url("/after")).send().unwrap().status(), 404);
}

#[test]
fn stalled_body_is_answered_with_408() {
    init_logging();
    let server = StubServer::builder()
        .read_timeout(Duration::from_millis(200))
        .start()
        .unwrap();

    let raw = send_raw(
        server.address().unwrap(),
        b"POST /slow-upload HTTP/1.1\r\nHost: stub\r\nContent-Length: 100\r\n\r\npartial",
    );
    assert!(raw.starts_with("HTTP/1.1 408"));

    let req = server.last_request().unwrap();
    assert_eq!(req.path(), "/slow-upload");
    assert!(req.is_malformed());
}

#[test]
fn slow_responder_does_not_block_other_connections() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    server.rule_fn(
        |when| {
            when.path("/slow");
        },
        |_| {
            thread::sleep(Duration::from_millis(1500));
            Ok(ResponseTemplate::ok().body("slow"))
        },
    );
    server.rule(|when, then| {
        when.path("/delayed");
        then.status(200).delay(Duration::from_millis(1500));
    });
    server.rule(|when, then| {
        when.path("/fast");
        then.status(200).body("fast");
    });

    let slow_url = server.url("/slow");
    let delayed_url = server.url("/delayed");
    let slow = thread::spawn(move || client().get(slow_url).send().unwrap().text().unwrap());
    let delayed = thread::spawn(move || client().get(delayed_url).send().unwrap().status());

    assert!(wait_until(Duration::from_secs(5), || server.requests().len() == 2));

    let started = Instant::now();
    let response = client().get(server.url("/fast")).send().unwrap();
    assert_eq!(response.text().unwrap(), "fast");
    assert!(started.elapsed() < Duration::from_millis(1000));

    assert_eq!(slow.join().unwrap(), "slow");
    assert_eq!(delayed.join().unwrap(), 200);
}

#[test]
fn history_limit_keeps_the_newest_requests() {
    init_logging();
    let server = StubServer::builder().history_limit(2).start().unwrap();

    for path in ["/1", "/2", "/3"] {
        client().get(server.url(path)).send().unwrap();
    }

    let paths: Vec<_> = server
        .requests()
        .iter()
        .map(|r| r.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/2", "/3"]);
}

#[test]
fn exchanges_pair_requests_with_responses() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    let rule = server.rule(|when, then| {
        when.path("/pair");
        then.status(202).header("x-id", "9").body("accepted");
    });

    client().get(server.url("/pair")).send().unwrap();
    client().get(server.url("/other")).send().unwrap();

    let exchanges = server.exchanges();
    assert_eq!(exchanges.len(), 2);

    let first = exchanges[0].response.as_ref().unwrap();
    assert_eq!(exchanges[0].request.path(), "/pair");
    assert_eq!(first.status, 202);
    assert_eq!(&first.body[..], b"accepted");
    assert_eq!(first.outcome, Outcome::Matched { rule });

    let second = exchanges[1].response.as_ref().unwrap();
    assert_eq!(second.status, 404);
    assert_eq!(second.outcome, Outcome::Unmatched);
}
