use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{BoardId, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/swiftly.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
    },
    CreateBoard {
        owner_user_id: i64,
        title: String,
    },
    /// Renumber list and card positions so every ordering is dense again.
    RepairOrderings {
        board_id: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username } => {
            let user_id = storage.create_user(username.trim()).await?;
            println!("user_id={}", user_id.0);
        }
        Command::CreateBoard {
            owner_user_id,
            title,
        } => {
            let owner = UserId(owner_user_id);
            if storage.username_for_user(owner).await?.is_none() {
                bail!("no user with id {owner_user_id}");
            }
            let board = storage.create_board(title.trim(), owner).await?;
            println!("created board_id={}", board.board_id.0);
        }
        Command::RepairOrderings { board_id } => {
            let boards = match board_id {
                Some(id) => vec![BoardId(id)],
                None => storage.all_board_ids().await?,
            };
            for board_id in boards {
                if storage.orderings_are_dense(board_id).await? {
                    continue;
                }
                let rows = storage.repair_board_orderings(board_id).await?;
                println!("board_id={}: renumbered {rows} rows", board_id.0);
            }
        }
    }

    Ok(())
}
