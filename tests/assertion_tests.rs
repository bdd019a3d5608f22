use httpstub::{prelude::*, AssertionFailure};

mod utils;
use utils::{client, init_logging};

#[test]
fn passing_assertions() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    let rule = server.rule(|when, then| {
        when.method(PUT).path("/doc");
        then.status(204);
    });

    client()
        .put(server.url("/doc"))
        .body("content")
        .send()
        .unwrap();

    server.assert_request_count(1).unwrap();
    server.assert_last_request_path("/doc").unwrap();
    server.assert_last_request_method("put").unwrap();
    server.assert_last_request_method(PUT).unwrap();
    server.assert_last_request_body("content").unwrap();
    server.assert_rule_hits(rule, 1).unwrap();
}

#[test]
fn request_count_failure_lists_received_requests() {
    init_logging();
    let server = StubServer::start_new().unwrap();

    client().get(server.url("/one?x=1")).send().unwrap();
    client().post(server.url("/two")).body("payload").send().unwrap();

    let failure: AssertionFailure = server.assert_request_count(3).unwrap_err();
    assert_eq!(failure.subject, "request count");
    assert_eq!(failure.expected, "3");
    assert_eq!(failure.actual, "2");

    let message = failure.to_string();
    assert!(message.contains("/one?x=1"));
    assert!(message.contains("POST"));
    assert!(message.contains("\"payload\""));
}

#[test]
fn last_request_assertions_without_requests() {
    let server = StubServer::start_new().unwrap();

    let failure = server.assert_last_request_path("/x").unwrap_err();
    assert_eq!(failure.actual, "no request");
    assert!(failure.details.contains("No request has been received"));

    assert!(server.assert_last_request_method(GET).is_err());
    assert!(server.assert_last_request_body("").is_err());
}

#[test]
fn path_and_method_mismatches() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    client().get(server.url("/actual")).send().unwrap();

    let failure = server.assert_last_request_path("/expected").unwrap_err();
    assert_eq!(failure.expected, "/expected");
    assert_eq!(failure.actual, "/actual");

    let failure = server.assert_last_request_method(DELETE).unwrap_err();
    assert_eq!(failure.expected, "DELETE");
    assert_eq!(failure.actual, "GET");
}

#[test]
fn body_mismatch_contains_a_diff() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    client()
        .post(server.url("/text"))
        .body("first line\nsecond line\n")
        .send()
        .unwrap();

    let failure = server
        .assert_last_request_body("first line\n2nd line\n")
        .unwrap_err();

    assert!(failure.details.contains("-2nd line"));
    assert!(failure.details.contains("+second line"));
    assert!(failure.details.contains(" first line"));
}

#[test]
fn binary_bodies_are_shown_as_base64() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    client()
        .post(server.url("/bin"))
        .body(vec![0xde, 0xad, 0xbe, 0xef])
        .send()
        .unwrap();

    let failure = server.assert_last_request_body([0u8, 1]).unwrap_err();
    assert_eq!(failure.actual, "base64:3q2+7w==");
}

#[test]
fn rule_hit_mismatches() {
    init_logging();
    let server = StubServer::start_new().unwrap();
    let rule = server.rule(|when, then| {
        when.path("/counted");
        then.status(200);
    });

    client().get(server.url("/counted")).send().unwrap();

    let failure = server.assert_rule_hits(rule, 2).unwrap_err();
    assert_eq!(failure.actual, "1");
    assert!(failure.subject.contains(&rule.to_string()));

    server.remove_rule(rule);
    let failure = server.assert_rule_hits(rule, 1).unwrap_err();
    assert!(failure.actual.contains("removed"));
}
