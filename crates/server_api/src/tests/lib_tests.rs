use std::time::Duration;

use shared::protocol::ServerMessage;
use tokio::sync::mpsc;

use super::*;

struct Fixture {
    ctx: ApiContext,
    alice: UserId,
    board: BoardId,
    todo: ListId,
    done: ListId,
}

async fn setup() -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ctx = ApiContext::new(storage, Arc::new(BoardHub::new()));
    let alice = login(&ctx, "alice").await.expect("login");
    let board = create_board(&ctx, alice, "Roadmap").await.expect("board").id;
    let todo = create_list(&ctx, alice, &list_request("Todo", board))
        .await
        .expect("todo")
        .id;
    let done = create_list(&ctx, alice, &list_request("Done", board))
        .await
        .expect("done")
        .id;
    Fixture {
        ctx,
        alice,
        board,
        todo,
        done,
    }
}

fn list_request(title: &str, board_id: BoardId) -> CreateListRequest {
    CreateListRequest {
        title: title.to_string(),
        board_id,
    }
}

async fn add_card(fx: &Fixture, list_id: ListId, title: &str) -> CardId {
    create_card(
        &fx.ctx,
        fx.alice,
        &CreateCardRequest {
            title: title.to_string(),
            description: None,
            list_id,
            board_id: fx.board,
        },
    )
    .await
    .expect("card")
    .id
}

fn subscribe(fx: &Fixture) -> mpsc::UnboundedReceiver<ServerMessage> {
    let (connection, rx) = fx.ctx.hub.connect();
    assert!(fx.ctx.hub.join(connection, fx.board));
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<BoardEvent> {
    let mut events = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let ServerMessage::BoardEvent(envelope) = message {
            events.push(envelope.event);
        }
    }
    events
}

async fn card_order(fx: &Fixture, list_id: ListId) -> Vec<CardId> {
    fx.ctx
        .storage
        .card_ids_for_list(list_id)
        .await
        .expect("cards")
}

fn move_request(fx: &Fixture, source: ListId, dest: ListId, index: Option<usize>) -> MoveCardRequest {
    MoveCardRequest {
        source_list_id: source,
        dest_list_id: dest,
        board_id: fx.board,
        dest_index: index,
    }
}

#[tokio::test]
async fn cross_list_move_emits_both_orderings() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    let c = add_card(&fx, fx.todo, "c").await;
    let d = add_card(&fx, fx.done, "d").await;
    let mut rx = subscribe(&fx);

    let events = move_card(&fx.ctx, fx.alice, b, &move_request(&fx, fx.todo, fx.done, Some(0)))
        .await
        .expect("move");

    assert_eq!(card_order(&fx, fx.todo).await, vec![a, c]);
    assert_eq!(card_order(&fx, fx.done).await, vec![b, d]);
    let card = fx.ctx.storage.load_card(b).await.expect("load").expect("card");
    assert_eq!(card.list_id, fx.done);

    let expected = vec![
        BoardEvent::CardsReordered {
            list_id: fx.todo,
            ordered_card_ids: vec![a, c],
        },
        BoardEvent::CardsReordered {
            list_id: fx.done,
            ordered_card_ids: vec![b, d],
        },
    ];
    assert_eq!(events, expected);
    assert_eq!(drain(&mut rx), expected);
}

#[tokio::test]
async fn same_list_move_emits_one_ordering() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    let c = add_card(&fx, fx.todo, "c").await;
    let mut rx = subscribe(&fx);

    move_card(&fx.ctx, fx.alice, a, &move_request(&fx, fx.todo, fx.todo, Some(99)))
        .await
        .expect("move");

    assert_eq!(card_order(&fx, fx.todo).await, vec![b, c, a]);
    assert_eq!(
        drain(&mut rx),
        vec![BoardEvent::CardsReordered {
            list_id: fx.todo,
            ordered_card_ids: vec![b, c, a],
        }]
    );
}

#[tokio::test]
async fn retried_move_converges_without_duplicates() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let d = add_card(&fx, fx.done, "d").await;
    let request = move_request(&fx, fx.todo, fx.done, None);

    move_card(&fx.ctx, fx.alice, a, &request).await.expect("first");
    move_card(&fx.ctx, fx.alice, a, &request).await.expect("retry");

    assert!(card_order(&fx, fx.todo).await.is_empty());
    assert_eq!(card_order(&fx, fx.done).await, vec![d, a]);
}

#[tokio::test]
async fn move_of_card_from_unrelated_list_is_integrity_error() {
    let fx = setup().await;
    let third = create_list(&fx.ctx, fx.alice, &list_request("Later", fx.board))
        .await
        .expect("third")
        .id;
    let stray = add_card(&fx, third, "stray").await;
    let mut rx = subscribe(&fx);

    let err = move_card(&fx.ctx, fx.alice, stray, &move_request(&fx, fx.todo, fx.done, None))
        .await
        .expect_err("stale source");
    assert_eq!(err.code, ErrorCode::Integrity);
    assert_eq!(card_order(&fx, third).await, vec![stray]);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn reorder_lists_swaps_and_emits() {
    let fx = setup().await;
    let mut rx = subscribe(&fx);

    let event = reorder_lists(&fx.ctx, fx.alice, fx.board, &[fx.done, fx.todo])
        .await
        .expect("reorder");

    let expected = BoardEvent::ListsReordered {
        ordered_list_ids: vec![fx.done, fx.todo],
    };
    assert_eq!(event, expected);
    assert_eq!(
        fx.ctx.storage.list_ids_for_board(fx.board).await.expect("lists"),
        vec![fx.done, fx.todo]
    );
    assert_eq!(drain(&mut rx), vec![expected]);
}

#[tokio::test]
async fn reorder_lists_with_missing_id_changes_nothing() {
    let fx = setup().await;
    let mut rx = subscribe(&fx);

    let err = reorder_lists(&fx.ctx, fx.alice, fx.board, &[fx.done])
        .await
        .expect_err("incomplete ordering");
    assert_eq!(err.code, ErrorCode::Integrity);

    let err = reorder_lists(&fx.ctx, fx.alice, fx.board, &[fx.done, fx.done])
        .await
        .expect_err("duplicate");
    assert_eq!(err.code, ErrorCode::Integrity);

    assert_eq!(
        fx.ctx.storage.list_ids_for_board(fx.board).await.expect("lists"),
        vec![fx.todo, fx.done]
    );
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn reorder_is_idempotent() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    let request = ReorderCardsRequest {
        ordered_card_ids: vec![b, a],
        board_id: fx.board,
    };

    let first = reorder_cards(&fx.ctx, fx.alice, fx.todo, &request)
        .await
        .expect("first");
    let second = reorder_cards(&fx.ctx, fx.alice, fx.todo, &request)
        .await
        .expect("second");
    assert_eq!(first, second);
    assert_eq!(card_order(&fx, fx.todo).await, vec![b, a]);
}

#[tokio::test]
async fn concurrent_mutations_reach_every_observer_in_one_order() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    let mut first = subscribe(&fx);
    let mut second = subscribe(&fx);

    let move_ctx = fx.ctx.clone();
    let request = move_request(&fx, fx.todo, fx.done, Some(0));
    let alice = fx.alice;
    let moving = tokio::spawn(async move { move_card(&move_ctx, alice, a, &request).await });

    let reorder_ctx = fx.ctx.clone();
    let (board, todo, done) = (fx.board, fx.todo, fx.done);
    let reordering =
        tokio::spawn(async move { reorder_lists(&reorder_ctx, alice, board, &[done, todo]).await });

    let (moved, reordered) = futures::future::join(moving, reordering).await;
    moved.expect("join").expect("move");
    reordered.expect("join").expect("reorder");

    let seen_first = drain(&mut first);
    let seen_second = drain(&mut second);
    assert_eq!(seen_first.len(), 3);
    assert_eq!(seen_first, seen_second);
    assert_eq!(card_order(&fx, fx.todo).await, vec![b]);
    assert_eq!(card_order(&fx, fx.done).await, vec![a]);
    assert_eq!(
        fx.ctx.storage.list_ids_for_board(fx.board).await.expect("lists"),
        vec![fx.done, fx.todo]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn move_and_reorder_on_one_list_are_serialized() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    let mut first = subscribe(&fx);
    let mut second = subscribe(&fx);

    let move_ctx = fx.ctx.clone();
    let request = move_request(&fx, fx.todo, fx.done, None);
    let alice = fx.alice;
    let moving = tokio::spawn(async move { move_card(&move_ctx, alice, a, &request).await });

    let reorder_ctx = fx.ctx.clone();
    let remaining = ReorderCardsRequest {
        ordered_card_ids: vec![b],
        board_id: fx.board,
    };
    let todo = fx.todo;
    let reordering =
        tokio::spawn(async move { reorder_cards(&reorder_ctx, alice, todo, &remaining).await });

    let (moved, reordered) = futures::future::join(moving, reordering).await;
    moved.expect("join").expect("move always applies");

    let move_events = vec![
        BoardEvent::CardsReordered {
            list_id: fx.todo,
            ordered_card_ids: vec![b],
        },
        BoardEvent::CardsReordered {
            list_id: fx.done,
            ordered_card_ids: vec![a],
        },
    ];
    let seen_first = drain(&mut first);
    let seen_second = drain(&mut second);
    assert_eq!(seen_first, seen_second);

    match reordered.expect("join") {
        // reorder ran second: [b] is the whole list by then
        Ok(event) => {
            let mut expected = move_events.clone();
            expected.push(event);
            assert_eq!(seen_first, expected);
        }
        // reorder ran first: [b] leaves out a, nothing is published for it
        Err(err) => {
            assert_eq!(err.code, ErrorCode::Integrity);
            assert_eq!(seen_first, move_events);
        }
    }
    assert_eq!(card_order(&fx, fx.todo).await, vec![b]);
    assert_eq!(card_order(&fx, fx.done).await, vec![a]);
}

#[tokio::test]
async fn sequence_numbers_follow_apply_order() {
    let fx = setup().await;
    let (_connection, mut rx) = {
        let (connection, rx) = fx.ctx.hub.connect();
        fx.ctx.hub.join(connection, fx.board);
        (connection, rx)
    };
    add_card(&fx, fx.todo, "a").await;
    add_card(&fx, fx.todo, "b").await;

    let mut seqs = Vec::new();
    while let Ok(ServerMessage::BoardEvent(envelope)) = rx.try_recv() {
        assert_eq!(envelope.board_id, fx.board);
        seqs.push(envelope.seq);
    }
    assert_eq!(seqs.len(), 2);
    assert_eq!(seqs[1], seqs[0] + 1);
}

#[tokio::test]
async fn delete_list_cascades_with_one_event() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    let mut rx = subscribe(&fx);

    delete_list(&fx.ctx, fx.alice, fx.todo, fx.board)
        .await
        .expect("delete");

    assert_eq!(
        fx.ctx.storage.list_ids_for_board(fx.board).await.expect("lists"),
        vec![fx.done]
    );
    for card in [a, b] {
        assert!(fx.ctx.storage.load_card(card).await.expect("load").is_none());
    }
    assert_eq!(
        drain(&mut rx),
        vec![BoardEvent::ListDeleted {
            list_id: fx.todo,
            board_id: fx.board,
        }]
    );
}

#[tokio::test]
async fn delete_card_emits_card_deleted() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    let mut rx = subscribe(&fx);

    delete_card(&fx.ctx, fx.alice, a, fx.board)
        .await
        .expect("delete");

    assert_eq!(card_order(&fx, fx.todo).await, vec![b]);
    assert_eq!(
        drain(&mut rx),
        vec![BoardEvent::CardDeleted {
            card_id: a,
            list_id: fx.todo,
        }]
    );
}

#[tokio::test]
async fn delete_board_closes_room() {
    let fx = setup().await;
    add_card(&fx, fx.todo, "a").await;
    let mut rx = subscribe(&fx);

    delete_board(&fx.ctx, fx.alice, fx.board)
        .await
        .expect("delete");

    assert_eq!(
        drain(&mut rx),
        vec![BoardEvent::BoardDeleted { board_id: fx.board }]
    );
    assert_eq!(fx.ctx.hub.room_size(fx.board), 0);
    let err = get_board(&fx.ctx, fx.alice, fx.board)
        .await
        .expect_err("gone");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn non_owner_is_not_authorized() {
    let fx = setup().await;
    let mallory = login(&fx.ctx, "mallory").await.expect("login");
    let mut rx = subscribe(&fx);

    let err = reorder_lists(&fx.ctx, mallory, fx.board, &[fx.done, fx.todo])
        .await
        .expect_err("not owner");
    assert_eq!(err.code, ErrorCode::NotAuthorized);

    let err = get_board(&fx.ctx, mallory, fx.board)
        .await
        .expect_err("not owner");
    assert_eq!(err.code, ErrorCode::NotAuthorized);

    let (connection, _rx) = fx.ctx.hub.connect();
    let err = join_board(&fx.ctx, mallory, connection, fx.board)
        .await
        .expect_err("not owner");
    assert_eq!(err.code, ErrorCode::NotAuthorized);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn list_from_another_board_reads_as_missing() {
    let fx = setup().await;
    let other_board = create_board(&fx.ctx, fx.alice, "Other").await.expect("board").id;
    let foreign = create_list(&fx.ctx, fx.alice, &list_request("Foreign", other_board))
        .await
        .expect("list")
        .id;
    let card = add_card(&fx, fx.todo, "a").await;

    let err = reorder_cards(
        &fx.ctx,
        fx.alice,
        foreign,
        &ReorderCardsRequest {
            ordered_card_ids: vec![],
            board_id: fx.board,
        },
    )
    .await
    .expect_err("foreign list");
    assert_eq!(err.code, ErrorCode::NotFound);

    let err = move_card(&fx.ctx, fx.alice, card, &move_request(&fx, fx.todo, foreign, None))
        .await
        .expect_err("foreign dest");
    assert_eq!(err.code, ErrorCode::NotFound);
    assert_eq!(card_order(&fx, fx.todo).await, vec![card]);

    let err = delete_card(&fx.ctx, fx.alice, card, other_board)
        .await
        .expect_err("card not on that board");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_storage() {
    let fx = setup().await;

    let err = create_board(&fx.ctx, fx.alice, "   ").await.expect_err("blank");
    assert_eq!(err.code, ErrorCode::Validation);

    let long = "x".repeat(MAX_TITLE_BYTES + 1);
    let err = create_list(&fx.ctx, fx.alice, &list_request(&long, fx.board))
        .await
        .expect_err("too long");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = update_card(
        &fx.ctx,
        fx.alice,
        CardId(1),
        &UpdateCardRequest {
            title: None,
            description: None,
            board_id: fx.board,
        },
    )
    .await
    .expect_err("empty update");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = reorder_lists(&fx.ctx, fx.alice, BoardId(0), &[])
        .await
        .expect_err("missing board id");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn unknown_user_cannot_create_boards() {
    let fx = setup().await;
    let err = create_board(&fx.ctx, UserId(999), "Ghost")
        .await
        .expect_err("unknown");
    assert_eq!(err.code, ErrorCode::NotAuthorized);
}

#[tokio::test]
async fn update_card_changes_only_given_fields() {
    let fx = setup().await;
    let card = add_card(&fx, fx.todo, "draft").await;
    let mut rx = subscribe(&fx);

    let updated = update_card(
        &fx.ctx,
        fx.alice,
        card,
        &UpdateCardRequest {
            title: None,
            description: Some("details".into()),
            board_id: fx.board,
        },
    )
    .await
    .expect("update");

    assert_eq!(updated.title, "draft");
    assert_eq!(updated.description, "details");
    assert_eq!(
        drain(&mut rx),
        vec![BoardEvent::CardUpdated {
            updated_card: updated
        }]
    );
}

#[tokio::test]
async fn snapshot_lists_cards_in_order() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    reorder_lists(&fx.ctx, fx.alice, fx.board, &[fx.done, fx.todo])
        .await
        .expect("reorder");

    let snapshot = get_board(&fx.ctx, fx.alice, fx.board).await.expect("snapshot");
    assert_eq!(snapshot.title, "Roadmap");
    let lists: Vec<ListId> = snapshot.lists.iter().map(|list| list.id).collect();
    assert_eq!(lists, vec![fx.done, fx.todo]);
    let cards: Vec<CardId> = snapshot.lists[1].cards.iter().map(|card| card.id).collect();
    assert_eq!(cards, vec![a, b]);
    assert!(snapshot.lists[0].cards.is_empty());
    assert!(snapshot.seq > 0);
    assert_eq!(snapshot.seq, fx.ctx.hub.current_seq(fx.board));

    let boards = list_boards(&fx.ctx, fx.alice).await.expect("boards");
    assert_eq!(boards.len(), 1);
    assert_eq!(boards[0].lists, vec![fx.done, fx.todo]);
}

#[tokio::test]
async fn snapshot_repairs_torn_positions() {
    let fx = setup().await;
    let a = add_card(&fx, fx.todo, "a").await;
    let b = add_card(&fx, fx.todo, "b").await;
    sqlx::query("UPDATE cards SET position = 7 WHERE id = ?")
        .bind(a.0)
        .execute(fx.ctx.storage.pool())
        .await
        .expect("tear positions");

    let snapshot = get_board(&fx.ctx, fx.alice, fx.board).await.expect("snapshot");
    let cards: Vec<CardId> = snapshot.lists[0].cards.iter().map(|card| card.id).collect();
    assert_eq!(cards, vec![b, a]);
    assert!(fx
        .ctx
        .storage
        .orderings_are_dense(fx.board)
        .await
        .expect("dense"));
}

#[tokio::test]
async fn slow_store_fails_with_persistence_and_publishes_nothing() {
    let fx = setup().await;
    let ctx = fx
        .ctx
        .clone()
        .with_persistence_timeout(Duration::from_millis(50));
    let mut rx = subscribe(&fx);

    let held = ctx.storage.pool().acquire().await.expect("hold connection");
    let err = reorder_lists(&ctx, fx.alice, fx.board, &[fx.done, fx.todo])
        .await
        .expect_err("store is busy");
    assert_eq!(err.code, ErrorCode::Persistence);
    drop(held);

    assert_eq!(
        fx.ctx.storage.list_ids_for_board(fx.board).await.expect("lists"),
        vec![fx.todo, fx.done]
    );
    assert!(drain(&mut rx).is_empty());
}
