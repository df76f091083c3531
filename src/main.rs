use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use roomsync::client::services::api_client::ApiClient;
use roomsync::client::services::dispatcher::SendOutcome;
use roomsync::client::services::websocket_client::ConnectionState;
use roomsync::common::models::{DeliveryState, MessageKind};
use roomsync::{ClientConfig, RoomSession, SessionUpdate};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const VISIBLE_MESSAGES: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "roomsync", about = "Terminal client for a group chat room")]
struct Args {
    /// Group id of the room to open
    #[arg(long)]
    room: String,
    /// Username to join as
    #[arg(long)]
    user: String,
    /// Overrides API_BASE_URL
    #[arg(long)]
    api: Option<String>,
    /// Overrides SOCKET_URL
    #[arg(long)]
    socket: Option<String>,
}

/// One line typed on stdin.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Quit,
    More,
    Focus,
    Details,
    Members(Vec<String>),
    Groups,
    Create(String),
    Delete,
    /// Anything that is not a command goes to the room.
    Say,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match head {
            "/quit" => Command::Quit,
            "/more" => Command::More,
            "/focus" => Command::Focus,
            "/details" => Command::Details,
            "/groups" => Command::Groups,
            "/delete" => Command::Delete,
            "/create" => Command::Create(rest.trim().to_string()),
            "/members" => Command::Members(
                rest.split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect(),
            ),
            _ => Command::Say,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ClientConfig::from_env();
    if let Some(api) = args.api {
        config.api_base_url = api;
    }
    if let Some(socket) = args.socket {
        config.session.socket_url = socket;
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

    let api = Arc::new(ApiClient::new(&config.api_base_url)?);
    let mut session = RoomSession::open(&config.session, &args.room, &args.user, api.clone());
    info!("[CLIENT] Room {} opened as {}", args.room, args.user);
    println!("[CLIENT] Type a message and press enter. Commands: /more, /details, /members a,b, /groups, /create <name>, /delete, /focus, /quit");

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            update = session.next_update() => {
                let Some(update) = update else { break };
                if update.needs_redraw() {
                    render(&session);
                }
                match update {
                    SessionUpdate::HistoryLoaded { has_more: false, .. } => {
                        println!("[CLIENT] Beginning of conversation");
                    }
                    SessionUpdate::HistoryFailed { page } => {
                        println!("[CLIENT] Could not load page {}, try /more again", page);
                    }
                    _ => {}
                }
            }
            line = line_rx.recv() => {
                let Some(mut line) = line else {
                    session.shutdown(Duration::from_secs(1)).await;
                    break;
                };
                match Command::parse(&line) {
                    Command::Quit => {
                        session.shutdown(Duration::from_secs(1)).await;
                        break;
                    }
                    Command::More => {
                        if !session.load_more() {
                            println!("[CLIENT] Nothing more to load right now");
                        }
                    }
                    Command::Focus => {
                        session.on_focus();
                    }
                    Command::Details => {
                        let api = api.clone();
                        let room = args.room.clone();
                        tokio::spawn(async move {
                            match api.group_details(&room).await {
                                Ok(details) => {
                                    println!("[CLIENT] {} (admin: {})", details.name, details.admin().unwrap_or("?"));
                                    for member in &details.members {
                                        println!("  - {}", member.username);
                                    }
                                }
                                Err(e) => println!("[CLIENT] Failed to load group details: {}", e),
                            }
                        });
                    }
                    Command::Members(usernames) => {
                        let api = api.clone();
                        let room = args.room.clone();
                        let user = args.user.clone();
                        tokio::spawn(async move {
                            match api.add_members(&room, &usernames, &user).await {
                                Ok(()) => println!("[CLIENT] Added {}", usernames.join(", ")),
                                Err(e) => println!("[CLIENT] Failed to add members: {}", e),
                            }
                        });
                    }
                    Command::Groups => {
                        let api = api.clone();
                        let user = args.user.clone();
                        tokio::spawn(async move {
                            match api.list_groups(&user).await {
                                Ok(groups) if groups.is_empty() => println!("[CLIENT] No groups yet"),
                                Ok(groups) => {
                                    for group in groups {
                                        let admin = group.created_by.map(|o| o.username).unwrap_or_default();
                                        println!("  #{} {} ({})", group.id, group.name, admin);
                                    }
                                }
                                Err(e) => println!("[CLIENT] Failed to load groups: {}", e),
                            }
                        });
                    }
                    Command::Create(name) => {
                        let api = api.clone();
                        let user = args.user.clone();
                        tokio::spawn(async move {
                            match api.create_group(&name, &user).await {
                                Ok(()) => println!("[CLIENT] Group {} created", name.trim()),
                                Err(e) => println!("[CLIENT] Failed to create group: {}", e),
                            }
                        });
                    }
                    Command::Delete => match api.delete_group_as(&args.room, &args.user).await {
                        Ok(()) => {
                            println!("[CLIENT] Group deleted, leaving the room");
                            session.shutdown(Duration::from_secs(1)).await;
                            break;
                        }
                        Err(e) => println!("[CLIENT] Failed to delete group: {}", e),
                    },
                    Command::Say => match session.send(&mut line) {
                        SendOutcome::Sent { .. } => render(&session),
                        SendOutcome::Blank => {}
                        SendOutcome::NotConnected => {
                            println!("[CLIENT] Not connected, message not sent");
                        }
                    },
                }
            }
        }
    }

    Ok(())
}

/// Redraws the newest messages, oldest of them first.
fn render(session: &RoomSession) {
    let mut entries = session.store().messages();
    entries.sort_by_key(|entry| entry.message.timestamp);
    let visible = &entries[entries.len().saturating_sub(VISIBLE_MESSAGES)..];

    print!("\x1B[2J\x1B[H");
    let status = match session.connection_state() {
        ConnectionState::Open => "online",
        ConnectionState::Connecting => "connecting",
        _ => "offline",
    };
    println!("== room {} as {} [{}] ==", session.room_id(), session.username(), status);
    for entry in visible {
        let time = entry.message.timestamp.with_timezone(&chrono::Local).format("%H:%M");
        match entry.message.kind {
            MessageKind::System => println!("   * {} ({})", entry.message.content, time),
            _ => {
                let marker = if entry.delivery == DeliveryState::Pending { " …" } else { "" };
                println!("[{}] {}: {}{}", time, entry.message.sender, entry.message.content, marker);
            }
        }
    }
}
