extern crate livevote_server;
use actix_codec::{AsyncRead, AsyncWrite, Framed};
use actix_http::{ws::Codec, StatusCode};
use actix_web::App;
use actix_web_actors::ws;
use futures::{future::join_all, SinkExt, StreamExt};
use insta::assert_json_snapshot;
use livevote_server::{
    api::{CreatePollRequest, Credential, CurrentToken, Poll, ScanAck, Vote},
    config::Config,
    db::{token::TokenStatus, MemoryStore, Store},
    server,
    services::{
        broadcast::SubscriberCount,
        vote::{GetVoteStats, VoteStats},
        Services,
    },
    websocket::{IncomingMessage, OutgoingMessage},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const READ_TIMEOUT_MS: u64 = 300;

/// Reads frames until one of the wanted type shows up. Other messages are
/// skipped since results and credentials are pushed independently.
macro_rules! frame_message_type {
    ($framed:expr, $message_type:path) => {{
        let mut found = None;
        for _ in 0..10 {
            match read_message(&mut $framed)
                .await
                .expect("Unable to read ws frame")
            {
                $message_type(message) => {
                    found = Some(message);
                    break;
                }
                _ => continue,
            }
        }
        found.expect("Wrong outgoing message type")
    }};
}

async fn read_message(
    framed: &mut Framed<impl AsyncRead + AsyncWrite + Unpin, Codec>,
) -> Option<OutgoingMessage> {
    let frame = timeout(Duration::from_millis(READ_TIMEOUT_MS), framed.next()).await;
    match frame.ok()??.unwrap() {
        ws::Frame::Text(item) => Some(serde_json::from_slice(&item[..]).unwrap()),
        _ => None,
    }
}

async fn read_messages(
    framed: &mut Framed<impl AsyncRead + AsyncWrite + Unpin, Codec>,
) -> Vec<OutgoingMessage> {
    let mut messages = vec![];
    while let Some(message) = read_message(framed).await {
        messages.push(message);
    }
    messages
}

async fn send_message(
    framed: &mut Framed<impl AsyncRead + AsyncWrite + Unpin, Codec>,
    message: &IncomingMessage,
) {
    let message = serde_json::to_string(message).unwrap();
    framed.send(ws::Message::Text(message.into())).await.unwrap();
}

fn test_config() -> Config {
    // Long intervals so displays only react to pushed events.
    Config {
        token_check_interval: Duration::from_secs(60),
        result_refresh_interval: Duration::from_secs(60),
        ..Config::default()
    }
}

fn start_server() -> (actix_test::TestServer, Services) {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let services = Services::start(store, &config);
    let app_services = services.clone();
    let srv = actix_test::start(move || {
        let services = app_services.clone();
        let config = config.clone();
        App::new().configure(|cfg| server::configure(cfg, services, config))
    });
    (srv, services)
}

async fn create_poll(srv: &actix_test::TestServer, title: &str, options: &[&str]) -> Poll {
    let mut res = srv
        .post("/polls")
        .send_json(&CreatePollRequest {
            title: title.to_owned(),
            options: options.iter().map(|o| (*o).to_owned()).collect(),
            owner: None,
        })
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn current_token(srv: &actix_test::TestServer, poll: &Poll) -> CurrentToken {
    let mut res = srv
        .post(format!("/polls/{}/tokens/current", poll.id))
        .send_json(&json!({}))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

async fn fetch_poll(srv: &actix_test::TestServer, poll: &Poll) -> Poll {
    srv.get(format!("/polls/{}", poll.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn vote(
    srv: &actix_test::TestServer,
    poll: &Poll,
    option: usize,
    token: &str,
) -> (StatusCode, serde_json::Value) {
    let mut res = srv
        .post(format!("/polls/{}/votes", poll.id))
        .send_json(&json!({ "option_id": poll.options[option].id, "token": token }))
        .await
        .unwrap();
    (res.status(), res.json().await.unwrap())
}

#[derive(Deserialize)]
struct OwnedErrorResponse {
    error: String,
    message: String,
}

#[actix_rt::test]
async fn test_create_poll() {
    let (srv, _services) = start_server();
    let poll = create_poll(&srv, "  Best Color ", &["Red", " Blue"]).await;

    assert_json_snapshot!(poll, {
        ".id" => "[uuid]",
        ".options[].id" => "[uuid]",
        ".created_at" => "[timestamp]",
    }, @r###"
    {
      "id": "[uuid]",
      "title": "Best Color",
      "options": [
        {
          "id": "[uuid]",
          "text": "Red",
          "count": 0
        },
        {
          "id": "[uuid]",
          "text": "Blue",
          "count": 0
        }
      ],
      "total_votes": 0,
      "is_active": true,
      "owner": null,
      "created_at": "[timestamp]"
    }
    "###);

    let res = srv
        .post("/polls")
        .send_json(&json!({ "title": "Lonely", "options": ["only"] }))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let listed: Vec<Poll> = srv.get("/polls").send().await.unwrap().json().await.unwrap();
    assert_eq!(listed, vec![poll]);
}

#[actix_rt::test]
async fn test_scan_and_vote() {
    let (srv, _services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;

    let current = current_token(&srv, &poll).await;
    assert_eq!(current.status, TokenStatus::Active);
    assert!(current.rotated);
    assert!(current
        .vote_url
        .ends_with(&format!("/#/vote/{}/{}", poll.id, current.token)));

    // Voting page loads the poll and marks the credential scanned
    let res = srv
        .get(format!("/polls/{}/prepare/{}", poll.id, current.token))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let status: Credential = srv
        .get(format!("/tokens/{}", current.token))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.status, TokenStatus::Scanned);

    let (status, body) = vote(&srv, &poll, 0, current.token.as_str()).await;
    assert_eq!(status, StatusCode::CREATED);
    let recorded: Vote = serde_json::from_value(body).unwrap();
    assert_eq!(recorded.option_id, poll.options[0].id);

    let after = fetch_poll(&srv, &poll).await;
    assert_eq!(after.options[0].count, 1);
    assert_eq!(after.total_votes, 1);

    // Replaying the link is refused and changes nothing
    let (status, body) = vote(&srv, &poll, 1, current.token.as_str()).await;
    assert_eq!(status, StatusCode::GONE);
    let body: OwnedErrorResponse = serde_json::from_value(body).unwrap();
    assert_eq!(body.error, "CREDENTIAL_EXPIRED");
    assert_eq!(body.message, "link expired, rescan");
    assert_eq!(fetch_poll(&srv, &poll).await.total_votes, 1);

    // The display gets a new credential
    let next: CurrentToken = srv
        .post(format!("/polls/{}/tokens/current", poll.id))
        .send_json(&json!({ "previous_token": current.token }))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(next.rotated);
    assert_ne!(next.token, current.token);

    let votes: Vec<Vote> = srv
        .get(format!("/polls/{}/votes", poll.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].token, current.token);
}

#[actix_rt::test]
async fn test_credential_from_other_poll() {
    let (srv, _services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;
    let other = create_poll(&srv, "Best Pet", &["Cat", "Dog"]).await;
    let foreign = current_token(&srv, &other).await;

    let (status, _) = vote(&srv, &poll, 0, foreign.token.as_str()).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(fetch_poll(&srv, &poll).await.total_votes, 0);
    assert_eq!(fetch_poll(&srv, &other).await.total_votes, 0);

    let (status, _) = vote(&srv, &poll, 0, "not-a-real-token").await;
    assert_eq!(status, StatusCode::GONE);
}

#[actix_rt::test]
async fn test_closed_poll() {
    let (srv, _services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;
    let current = current_token(&srv, &poll).await;

    let res = srv
        .post(format!("/polls/{}/close", poll.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let (status, body) = vote(&srv, &poll, 0, current.token.as_str()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let body: OwnedErrorResponse = serde_json::from_value(body).unwrap();
    assert_eq!(body.error, "POLL_CLOSED");

    srv.post(format!("/polls/{}/reopen", poll.id))
        .send()
        .await
        .unwrap();
    let (status, _) = vote(&srv, &poll, 0, current.token.as_str()).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[actix_rt::test]
async fn test_racing_votes_count_once() {
    let (srv, services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;
    let current = current_token(&srv, &poll).await;

    let attempts = (0..10).map(|i| vote(&srv, &poll, i % 2, current.token.as_str()));
    let statuses: Vec<StatusCode> = join_all(attempts)
        .await
        .into_iter()
        .map(|(status, _)| status)
        .collect();

    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::CREATED).count(),
        1
    );
    assert!(statuses
        .iter()
        .all(|s| *s == StatusCode::CREATED || *s == StatusCode::GONE));
    assert_eq!(fetch_poll(&srv, &poll).await.total_votes, 1);

    let stats: VoteStats = services.votes.send(GetVoteStats).await.unwrap();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.invalid_credential + stats.credential_conflict, 9);
}

#[actix_rt::test]
async fn test_display_rotates_after_vote() {
    let (mut srv, _services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;

    let mut framed = srv
        .ws_at(&format!("/ws/display/{}", poll.id))
        .await
        .unwrap();
    let first = frame_message_type!(framed, OutgoingMessage::Token);
    assert!(first.vote_url.contains(first.token.as_str()));

    let (status, _) = vote(&srv, &poll, 1, first.token.as_str()).await;
    assert_eq!(status, StatusCode::CREATED);

    let messages = read_messages(&mut framed).await;
    let next = messages
        .iter()
        .find_map(|message| match message {
            OutgoingMessage::Token(token) => Some(token.clone()),
            _ => None,
        })
        .expect("display should show a new credential");
    assert_ne!(next.token, first.token);
    assert_eq!(next.status, TokenStatus::Active);
    let results = messages
        .iter()
        .rev()
        .find_map(|message| match message {
            OutgoingMessage::Poll(poll) => Some(poll.clone()),
            _ => None,
        })
        .expect("display should refresh the results");
    assert_eq!(results.options[1].count, 1);
}

#[actix_rt::test]
async fn test_display_rotates_after_scan() {
    let (mut srv, _services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;

    let mut framed = srv
        .ws_at(&format!("/ws/display/{}", poll.id))
        .await
        .unwrap();
    let first = frame_message_type!(framed, OutgoingMessage::Token);

    let mut res = srv
        .post(format!("/tokens/{}/scan", first.token))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack: ScanAck = res.json().await.unwrap();
    assert!(ack.scanned);

    // Scanned before any vote, so the display must move on by itself
    let next = frame_message_type!(framed, OutgoingMessage::Token);
    assert_ne!(next.token, first.token);
    assert_eq!(next.status, TokenStatus::Active);
    assert_eq!(fetch_poll(&srv, &poll).await.total_votes, 0);

    // The scanned link still votes once
    let (status, _) = vote(&srv, &poll, 0, first.token.as_str()).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[actix_rt::test]
async fn test_display_simulate_vote() {
    let (mut srv, _services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;

    let mut framed = srv
        .ws_at(&format!("/ws/display/{}", poll.id))
        .await
        .unwrap();
    frame_message_type!(framed, OutgoingMessage::Token);

    send_message(&mut framed, &IncomingMessage::SimulateVote).await;
    let simulated = frame_message_type!(framed, OutgoingMessage::Simulated);
    assert_eq!(simulated.poll_id, poll.id);
    assert_eq!(fetch_poll(&srv, &poll).await.total_votes, 1);
}

#[actix_rt::test]
async fn test_display_closes_when_poll_deleted() {
    let (mut srv, services) = start_server();
    let poll = create_poll(&srv, "Best Color", &["Red", "Blue"]).await;

    let mut framed = srv
        .ws_at(&format!("/ws/display/{}", poll.id))
        .await
        .unwrap();
    frame_message_type!(framed, OutgoingMessage::Token);

    let res = srv
        .delete(format!("/polls/{}", poll.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let messages = read_messages(&mut framed).await;
    assert!(messages.iter().any(|message| matches!(
        message,
        OutgoingMessage::Deleted { poll_id } if *poll_id == poll.id
    )));

    let res = srv.get(format!("/polls/{}", poll.id)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let subscribers = services
        .broadcast
        .send(SubscriberCount(poll.id.clone()))
        .await
        .unwrap();
    assert_eq!(subscribers, 0);
}

#[actix_rt::test]
async fn test_display_for_unknown_poll() {
    let (srv, _services) = start_server();
    let mut res = srv
        .get(format!("/ws/display/{}", uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: OwnedErrorResponse = res.json().await.unwrap();
    assert_eq!(body.error, "NOT_FOUND");
}
