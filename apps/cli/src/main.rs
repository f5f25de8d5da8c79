use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{reconciler::BoardState, BoardClient, ClientEvent};
use shared::domain::{BoardId, CardId, ListId};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "swiftly", about = "Command-line client for a Swiftly board server")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    #[arg(long)]
    username: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the boards you own.
    Boards,
    CreateBoard { title: String },
    /// Print a board with its lists and cards in order.
    Show { board_id: i64 },
    /// Print the board every time it changes, until Ctrl-C.
    Watch { board_id: i64 },
    MoveList {
        board_id: i64,
        list_id: i64,
        to_index: usize,
    },
    ReorderCard {
        board_id: i64,
        list_id: i64,
        card_id: i64,
        to_index: usize,
    },
    MoveCard {
        board_id: i64,
        card_id: i64,
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let client = BoardClient::new();
    let user_id = client.login(&args.server_url, &args.username).await?;
    println!("logged in as {} (user_id={user_id})", args.username);

    match args.command {
        Command::Boards => {
            for board in client.list_boards().await? {
                println!("{:>6}  {}", board.id, board.title);
            }
        }
        Command::CreateBoard { title } => {
            let board = client.create_board(&title).await?;
            println!("created board_id={}", board.id);
        }
        Command::Show { board_id } => {
            let state = client.open_board(BoardId(board_id)).await?;
            print_board(&state);
        }
        Command::Watch { board_id } => watch(&client, BoardId(board_id)).await?,
        Command::MoveList {
            board_id,
            list_id,
            to_index,
        } => {
            client.open_board(BoardId(board_id)).await?;
            let ack = client.move_list(ListId(list_id), to_index).await?;
            println!("{}", ack.message);
            print_view(&client).await;
        }
        Command::ReorderCard {
            board_id,
            list_id,
            card_id,
            to_index,
        } => {
            client.open_board(BoardId(board_id)).await?;
            let ack = client
                .reorder_card(ListId(list_id), CardId(card_id), to_index)
                .await?;
            println!("{}", ack.message);
            print_view(&client).await;
        }
        Command::MoveCard {
            board_id,
            card_id,
            from,
            to,
            index,
        } => {
            client.open_board(BoardId(board_id)).await?;
            let ack = client
                .move_card(CardId(card_id), ListId(from), ListId(to), index)
                .await?;
            println!("{}", ack.message);
            print_view(&client).await;
        }
    }

    Ok(())
}

async fn watch(client: &BoardClient, board_id: BoardId) -> Result<()> {
    let mut events = client.subscribe_events();
    let state = client.open_board(board_id).await?;
    print_board(&state);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::BoardChanged(state)) => print_board(&state),
                Ok(ClientEvent::BoardClosed(closed)) if closed == board_id => {
                    println!("board {board_id} was closed");
                    break;
                }
                Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                Ok(ClientEvent::Disconnected) => {
                    eprintln!("disconnected from server");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed client events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn print_view(client: &BoardClient) {
    if let Some(state) = client.view().await {
        print_board(&state);
    }
}

fn print_board(state: &BoardState) {
    println!("== {} [{}]", state.title, state.id);
    for (list, cards) in state.ordered() {
        println!("  {} [{}]", list.title, list.id);
        for card in cards {
            println!("    - {} [{}]", card.title, card.id);
        }
    }
}
