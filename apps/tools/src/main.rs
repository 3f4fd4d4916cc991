use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{JobId, MessageKind, RoomId, UserId},
    protocol::NewMessage,
};
use storage::Storage;

/// Seeds and inspects the dev hub's database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/hub.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Opens a room between two users; without --job it is their general room.
    CreateRoom {
        participant_a: String,
        participant_b: String,
        #[arg(long)]
        job: Option<String>,
    },
    ListRooms {
        user_id: String,
    },
    PostMessage {
        room_id: String,
        sender_id: String,
        content: String,
        #[arg(long)]
        job_context: Option<String>,
    },
    ListMessages {
        room_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateRoom {
            participant_a,
            participant_b,
            job,
        } => {
            let a = UserId::new(participant_a);
            let b = UserId::new(participant_b);
            let room = match job {
                Some(job) => storage.create_room(&a, &b, Some(&JobId::new(job))).await?,
                None => storage.get_or_create_general_room(&a, &b).await?,
            };
            println!("room_id={} participants={},{}", room.id, room.participant_a, room.participant_b);
        }
        Command::ListRooms { user_id } => {
            let rooms = storage.list_rooms_for_user(&UserId::new(user_id)).await?;
            for room in rooms {
                let latest = room
                    .latest_message
                    .map(|summary| summary.content)
                    .unwrap_or_default();
                println!(
                    "{}\t{} <-> {}\t{}\t{}",
                    room.id,
                    room.participant_a,
                    room.participant_b,
                    room.updated_at.to_rfc3339(),
                    latest
                );
            }
        }
        Command::PostMessage {
            room_id,
            sender_id,
            content,
            job_context,
        } => {
            let room_id = RoomId::new(room_id);
            let sender_id = UserId::new(sender_id);
            let room = storage
                .room(&room_id)
                .await?
                .ok_or_else(|| anyhow!("room {room_id} does not exist"))?;
            if !room.has_participant(&sender_id) {
                return Err(anyhow!("{sender_id} is not a participant of {room_id}"));
            }
            let message = storage
                .insert_message(
                    &room_id,
                    &sender_id,
                    &NewMessage {
                        content,
                        kind: MessageKind::Text,
                        attachment_url: None,
                        sender_name: None,
                        job_context,
                    },
                )
                .await?;
            println!("message_id={}", message.id);
        }
        Command::ListMessages { room_id } => {
            for message in storage.list_messages(&RoomId::new(room_id)).await? {
                let read = if message.read_at.is_some() { "read" } else { "unread" };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    message.created_at.to_rfc3339(),
                    message.sender_id,
                    message.kind.as_str(),
                    read,
                    message.content
                );
            }
        }
    }

    Ok(())
}
