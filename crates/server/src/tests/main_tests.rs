use std::time::Duration;

use super::*;
use axum::{body, body::Body, http::Request};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;

async fn test_app() -> (Router, ApiContext) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let api = ApiContext::new(storage, Arc::new(BoardHub::new()));
    let app = build_router(Arc::new(AppState {
        api: api.clone(),
        max_body_bytes: 16 * 1024,
    }));
    (app, api)
}

async fn call(app: &Router, method: &str, uri: &str, payload: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match payload {
        Some(payload) => builder
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

struct Seeded {
    app: Router,
    user: i64,
    board: i64,
    todo: i64,
    done: i64,
}

async fn seeded() -> Seeded {
    let (app, _api) = test_app().await;
    let (_, login) = call(&app, "POST", "/login", Some(json!({ "username": "alice" }))).await;
    let user = login["userId"].as_i64().expect("user id");
    let (status, board) = call(
        &app,
        "POST",
        &format!("/boards?user_id={user}"),
        Some(json!({ "title": "Roadmap" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let board = board["id"].as_i64().expect("board id");
    let todo = create_list(&app, user, board, "Todo").await;
    let done = create_list(&app, user, board, "Done").await;
    Seeded {
        app,
        user,
        board,
        todo,
        done,
    }
}

async fn create_list(app: &Router, user: i64, board: i64, title: &str) -> i64 {
    let (status, list) = call(
        app,
        "POST",
        &format!("/lists?user_id={user}"),
        Some(json!({ "title": title, "boardId": board })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    list["id"].as_i64().expect("list id")
}

async fn create_card(s: &Seeded, list: i64, title: &str) -> i64 {
    let (status, card) = call(
        &s.app,
        "POST",
        &format!("/cards?user_id={}", s.user),
        Some(json!({ "title": title, "listId": list, "boardId": s.board })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(card["list"].as_i64(), Some(list));
    card["id"].as_i64().expect("card id")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _api) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn login_is_idempotent_per_username() {
    let (app, _api) = test_app().await;
    let (status, first) = call(&app, "POST", "/login", Some(json!({ "username": "sam" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = call(&app, "POST", "/login", Some(json!({ "username": "sam" }))).await;
    assert_eq!(first["userId"], second["userId"]);

    let (status, err) = call(&app, "POST", "/login", Some(json!({ "username": " " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "validation");
}

#[tokio::test]
async fn board_routes_cover_the_board_lifecycle() {
    let s = seeded().await;

    let (status, boards) = call(&s.app, "GET", &format!("/boards?user_id={}", s.user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(boards[0]["lists"], json!([s.todo, s.done]));

    let (status, renamed) = call(
        &s.app,
        "PUT",
        &format!("/boards/{}?user_id={}", s.board, s.user),
        Some(json!({ "title": "Q3" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["title"], "Q3");

    let (status, ack) = call(
        &s.app,
        "DELETE",
        &format!("/boards/{}?user_id={}", s.board, s.user),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        ack["events"],
        json!([{ "type": "boardDeleted", "payload": { "boardId": s.board } }])
    );

    let (status, err) = call(
        &s.app,
        "GET",
        &format!("/boards/{}?user_id={}", s.board, s.user),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "not_found");
}

#[tokio::test]
async fn move_card_route_returns_both_orderings() {
    let s = seeded().await;
    let a = create_card(&s, s.todo, "a").await;
    let b = create_card(&s, s.todo, "b").await;
    let d = create_card(&s, s.done, "d").await;

    let (status, ack) = call(
        &s.app,
        "PUT",
        &format!("/cards/{b}/move?user_id={}", s.user),
        Some(json!({
            "sourceListId": s.todo,
            "destListId": s.done,
            "boardId": s.board,
            "destIndex": 0
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        ack["events"],
        json!([
            { "type": "cardsReordered", "payload": { "listId": s.todo, "orderedCardIds": [a] } },
            { "type": "cardsReordered", "payload": { "listId": s.done, "orderedCardIds": [b, d] } }
        ])
    );

    let (_, snapshot) = call(
        &s.app,
        "GET",
        &format!("/boards/{}?user_id={}", s.board, s.user),
        None,
    )
    .await;
    assert_eq!(snapshot["lists"][1]["cards"][0]["id"].as_i64(), Some(b));
    assert_eq!(snapshot["lists"][1]["cards"][0]["list"].as_i64(), Some(s.done));
}

#[tokio::test]
async fn partial_list_ordering_is_a_conflict() {
    let s = seeded().await;
    let (status, err) = call(
        &s.app,
        "PUT",
        &format!("/boards/{}/reorder-lists?user_id={}", s.board, s.user),
        Some(json!({ "orderedListIds": [s.done] })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "integrity");

    let (status, ack) = call(
        &s.app,
        "PUT",
        &format!("/boards/{}/reorder-lists?user_id={}", s.board, s.user),
        Some(json!({ "orderedListIds": [s.done, s.todo] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["events"][0]["payload"]["orderedListIds"], json!([s.done, s.todo]));
}

#[tokio::test]
async fn missing_or_foreign_actor_is_unauthorized() {
    let s = seeded().await;
    let (status, _) = call(&s.app, "GET", "/boards", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, login) = call(&s.app, "POST", "/login", Some(json!({ "username": "mallory" }))).await;
    let mallory = login["userId"].as_i64().expect("user id");
    let (status, err) = call(
        &s.app,
        "GET",
        &format!("/boards/{}?user_id={mallory}", s.board),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["code"], "not_authorized");
}

#[tokio::test]
async fn list_outside_the_addressed_board_is_not_found() {
    let s = seeded().await;
    let (_, other) = call(
        &s.app,
        "POST",
        &format!("/boards?user_id={}", s.user),
        Some(json!({ "title": "Other" })),
    )
    .await;
    let other = other["id"].as_i64().expect("board id");
    let foreign = create_list(&s.app, s.user, other, "Foreign").await;

    let (status, _) = call(
        &s.app,
        "PUT",
        &format!("/lists/{foreign}/reorder-cards?user_id={}", s.user),
        Some(json!({ "orderedCardIds": [], "boardId": s.board })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_bodies_are_validation_errors() {
    let s = seeded().await;
    let (status, err) = call(
        &s.app,
        "POST",
        &format!("/lists?user_id={}", s.user),
        Some(json!({ "title": "no board" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "validation");

    let (status, _) = call(
        &s.app,
        "PUT",
        &format!("/cards/1?user_id={}", s.user),
        Some(json!({ "boardId": s.board })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_routes_need_the_board_in_the_query() {
    let s = seeded().await;
    let card = create_card(&s, s.todo, "a").await;

    let (status, _) = call(
        &s.app,
        "DELETE",
        &format!("/lists/{}?user_id={}", s.todo, s.user),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, ack) = call(
        &s.app,
        "DELETE",
        &format!("/cards/{card}?user_id={}&boardId={}", s.user, s.board),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["events"][0]["type"], "cardDeleted");

    let (status, ack) = call(
        &s.app,
        "DELETE",
        &format!("/lists/{}?user_id={}&boardId={}", s.todo, s.user, s.board),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        ack["events"],
        json!([{ "type": "listDeleted", "payload": { "listId": s.todo, "boardId": s.board } }])
    );
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let s = seeded().await;
    let (status, _) = call(
        &s.app,
        "POST",
        &format!("/cards?user_id={}", s.user),
        Some(json!({
            "title": "big",
            "description": "x".repeat(32 * 1024),
            "listId": s.todo,
            "boardId": s.board
        })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

#[tokio::test]
async fn websocket_room_receives_board_events() {
    let s = seeded().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let served = s.app.clone();
    let server = tokio::spawn(async move { axum::serve(listener, served).await });

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id={}", s.user))
            .await
            .expect("connect");

    socket
        .send(WsMessage::Text("not json".into()))
        .await
        .expect("send");
    assert_eq!(next_json(&mut socket).await["type"], "error");

    socket
        .send(WsMessage::Text(
            json!({ "type": "joinBoard", "payload": { "boardId": s.board } }).to_string(),
        ))
        .await
        .expect("send");
    assert_eq!(
        next_json(&mut socket).await,
        json!({ "type": "joined", "payload": { "boardId": s.board } })
    );

    let card = create_card(&s, s.todo, "live").await;

    let frame = next_json(&mut socket).await;
    assert_eq!(frame["type"], "boardEvent");
    assert_eq!(frame["payload"]["boardId"].as_i64(), Some(s.board));
    assert_eq!(frame["payload"]["event"]["type"], "cardCreated");
    assert_eq!(
        frame["payload"]["event"]["payload"]["newCard"]["id"].as_i64(),
        Some(card)
    );
    let first_seq = frame["payload"]["seq"].as_u64().expect("seq");

    call(
        &s.app,
        "PUT",
        &format!("/boards/{}/reorder-lists?user_id={}", s.board, s.user),
        Some(json!({ "orderedListIds": [s.done, s.todo] })),
    )
    .await;
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["payload"]["event"]["type"], "listsReordered");
    assert_eq!(frame["payload"]["seq"].as_u64(), Some(first_seq + 1));

    socket.close(None).await.expect("close");
    server.abort();
}
