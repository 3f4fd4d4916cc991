use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::load_settings, http::HubClient, store::SendOptions, ws::WsRealtimeTransport,
    BackendClient, ChatContext, ChatEvent, SessionHandle,
};
use shared::{
    domain::{MessageId, UserId},
    protocol::ChatMessage,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod input;

use input::{format_message, Input};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    hub_url: String,
    /// Who to sign in as.
    #[arg(long)]
    user: String,
    /// The other participant of the general room.
    #[arg(long)]
    peer: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    job_context: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let me = UserId::new(args.user.trim());

    let anonymous = HubClient::new(&args.hub_url, Arc::new(SessionHandle::new()))?;
    let session = anonymous
        .issue_token(&me)
        .await
        .with_context(|| format!("failed to sign in as {me}"))?;
    let auth = Arc::new(SessionHandle::with_session(session));
    let hub = Arc::new(HubClient::new(&args.hub_url, auth.clone())?);
    let realtime = Arc::new(WsRealtimeTransport::new(hub.realtime_url()?));

    let context = ChatContext::new(load_settings());
    context
        .init(BackendClient::new(realtime.clone(), hub.clone(), auth, hub))
        .await?;
    let store = context.store().clone();

    let room = store
        .get_or_create_general_room(&UserId::new(args.peer.trim()))
        .await?;
    info!(room_id = %room.id, user = %me, "console: general room ready");
    println!("room {} with {}", room.id, room.other_participant(&me));
    store.set_current_room(Some(room.id.clone())).await?;

    let mut printed: HashSet<MessageId> = HashSet::new();
    print_new(&store.messages(&room.id), &me, &mut printed);
    let mut events = store.events();
    store.subscribe_room(&room.id).await?;
    println!("unread: {}  (/read, /diag, /health, /quit)", store.unread_count(&room.id));

    let options = SendOptions {
        sender_name: args.name.clone(),
        job_context: args.job_context.clone(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Input::parse(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Text(text) => {
                        match store.send_text(&room.id, &text, options.clone()).await {
                            Ok(_) => print_new(&store.messages(&room.id), &me, &mut printed),
                            Err(err) => eprintln!("send failed: {err}"),
                        }
                    }
                    Input::Read => match store.mark_read(&room.id).await {
                        Ok(count) => println!("marked {count} message(s) read"),
                        Err(err) => eprintln!("mark read failed: {err}"),
                    },
                    Input::Diag => {
                        let report = store.diagnostics_report();
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    }
                    Input::Health => {
                        let status = context.connections().connection_status().await;
                        println!("{}", serde_json::to_string_pretty(&status)?);
                        match context.connections().test_connection().await {
                            Ok(probe) => println!("api ok: {}  realtime ok: {}", probe.api, probe.realtime),
                            Err(err) => eprintln!("connection test failed: {err}"),
                        }
                    }
                    Input::Unknown(command) => eprintln!("unknown command /{command}"),
                }
            }
            event = events.recv() => match event {
                Ok(ChatEvent::MessagesChanged { room_id }) if room_id == room.id => {
                    print_new(&store.messages(&room_id), &me, &mut printed);
                }
                Ok(ChatEvent::UnreadChanged { room_id, count }) if room_id == room.id => {
                    println!("unread: {count}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console: store events lagged");
                    print_new(&store.messages(&room.id), &me, &mut printed);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    context.dispose().await;
    realtime.disconnect().await;
    Ok(())
}

fn print_new(
    messages: &[ChatMessage],
    me: &UserId,
    printed: &mut HashSet<MessageId>,
) {
    for message in messages {
        if printed.insert(message.id.clone()) {
            println!("{}", format_message(message, me));
        }
    }
}
