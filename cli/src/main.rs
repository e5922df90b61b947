//! Line-delimited JSON protocol host: reads frontend messages on stdin,
//! drives an Aurora bot, and writes suggestions to stdout.

use anyhow::Result;
use aurora::eval::Standard;
use aurora::{AuroraBot, Options};
use enumset::EnumSet;
use game::tetris::tbp::*;
use game::tetris::PieceKind;
use tokio::io::AsyncBufReadExt;

fn main() -> Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> Result<()> {
    let mut bot: Option<AuroraBot> = None;

    write_message(&BotMessage::Info {
        name: "Aurora".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        author: "aurora".to_owned(),
        features: vec!["randomizer".to_owned()],
    })?;

    let mut reader = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = reader.next_line().await? {
        let Ok(message) = serde_json::from_str::<FrontendMessage>(&line) else {
            continue;
        };
        match message {
            FrontendMessage::Rules { .. } => {
                write_message(&BotMessage::Ready)?;
            }
            FrontendMessage::Start(start) => {
                let bag = match start.randomizer {
                    Randomizer::SevenBag { bag_state } => bag_state,
                    Randomizer::Unknown => EnumSet::<PieceKind>::all(),
                };
                let launched = AuroraBot::launch_with_board(
                    Options::default(),
                    Standard::default(),
                    &start.board.to_rows(),
                    bag,
                    start.hold,
                    start.back_to_back,
                    start.combo,
                );
                for &piece in &start.queue {
                    launched.add_next_piece(piece);
                }
                bot = Some(launched);
            }
            FrontendMessage::NewPiece { piece } => {
                if let Some(bot) = &bot {
                    bot.add_next_piece(piece);
                }
            }
            FrontendMessage::Suggest => {
                let Some(bot) = &bot else { continue };
                bot.request_next_move(0);
                match bot.block_next_move() {
                    Some((mv, info)) => {
                        write_message(&BotMessage::Suggestion {
                            moves: vec![mv.expected],
                            move_info: MoveInfo {
                                nodes: info.nodes as u64,
                                depth: info.depth,
                                extra: format!("rank {}", info.original_rank),
                            },
                        })?;
                    }
                    None => {
                        write_message(&BotMessage::Error {
                            reason: BotErrorReason::UnsupportedRules,
                        })?;
                    }
                }
            }
            // committing a suggestion already advanced the bot; a frontend
            // that deviates from the suggestion must send a fresh start
            FrontendMessage::Play { .. } => {}
            FrontendMessage::Stop => {
                bot = None;
            }
            FrontendMessage::Quit | FrontendMessage::Unknown => break,
        }
    }
    Ok(())
}

fn write_message(message: &BotMessage) -> Result<()> {
    println!("{}", serde_json::to_string(message)?);
    Ok(())
}
