use chrono::Utc;
use clap::Parser;
use duochat::auth::StaticCredentialProvider;
use duochat::types::events::Event;
use duochat::types::message::Message;
use duochat::types::user::UserId;
use duochat::upload::PendingAttachment;
use duochat::{Client, ClientConfig};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

// Terminal front end for the session engine.
//
// Usage:
//   cargo run -- --user a@x.com --token <jwt>
//   DUOCHAT_TOKEN=<jwt> cargo run -- -u a@x.com --relay-url wss://relay.example.com/ws
//
// Then type `/join b@x.com` and chat. `/help` lists the commands.

#[derive(Parser, Debug)]
#[command(name = "duochat", about = "Two-party chat and call client")]
struct Args {
    /// Your identifier, as issued by the identity service.
    #[arg(short, long, env = "DUOCHAT_USER")]
    user: String,

    /// Short-lived relay credential.
    #[arg(short, long, env = "DUOCHAT_TOKEN")]
    token: String,

    /// JSON configuration file. Command-line flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, env = "DUOCHAT_RELAY_URL")]
    relay_url: Option<String>,

    #[arg(long, env = "DUOCHAT_UPLOAD_URL")]
    upload_url: Option<String>,
}

const HELP: &str = "\
/join <user>       open the conversation with <user>
/file <path>       send a file as an attachment
/call | /video     start an audio or video call
/answer | /reject  respond to an incoming call
/hangup            end the call
/mute | /camera    toggle microphone or camera
/who               list online users
/quit              disconnect and exit
anything else      send as a text message";

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let mut config = match &args.config {
        Some(path) => match ClientConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config from {}: {}", path.display(), e);
                return;
            }
        },
        None => ClientConfig::default(),
    };
    if let Some(url) = args.relay_url {
        config.relay_url = url;
    }
    if args.upload_url.is_some() {
        config.upload_url = args.upload_url;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let client = match Client::builder(args.user.as_str())
            .with_config(config)
            .with_credentials(StaticCredentialProvider::new(args.token))
            .on_event(print_event)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to build client: {}", e);
                return;
            }
        };

        let runner = client.clone();
        let event_loop = tokio::spawn(async move { runner.run().await });

        if let Err(e) = client.connect().await {
            error!("Could not connect: {}", e);
        }

        info!("Type /help for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !handle_command(&client, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                },
            }
        }

        client.shutdown().await;
        if let Err(e) = event_loop.await {
            warn!("Event loop task failed: {}", e);
        }
    });
}

/// Returns `false` when the user asked to quit.
async fn handle_command(client: &Arc<Client>, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let result = match command {
        "/quit" => return false,
        "/help" => {
            println!("{HELP}");
            Ok(())
        }
        "/join" if !rest.is_empty() => client
            .open_conversation(&UserId::from(rest))
            .await
            .map(|room| info!("Joined {}", room)),
        "/file" if !rest.is_empty() => match read_attachment(Path::new(rest)).await {
            Ok(pending) => client.send_message("", Some(pending)).await.map(|_| ()),
            Err(e) => {
                error!("Cannot read {}: {}", rest, e);
                Ok(())
            }
        },
        "/call" => client.start_call(false).await,
        "/video" => client.start_call(true).await,
        "/answer" => client.answer_call().await,
        "/reject" => client.reject_call().await,
        "/hangup" => {
            client.hang_up().await;
            Ok(())
        }
        "/mute" => {
            let flags = client.toggle_mute();
            info!("Microphone {}", if flags.muted { "muted" } else { "live" });
            Ok(())
        }
        "/camera" => {
            let flags = client.toggle_video();
            info!("Camera {}", if flags.video_off { "off" } else { "on" });
            Ok(())
        }
        "/who" => {
            let online: Vec<String> = client.online().iter().map(|id| client.display_name(id)).collect();
            info!("Online: {}", online.join(", "));
            Ok(())
        }
        _ if command.starts_with('/') => {
            warn!("Unknown command {}. Type /help.", command);
            Ok(())
        }
        _ => client.send_message(line, None).await.map(|_| ()),
    };

    if let Err(e) = result {
        // Notices are already printed by the event handler.
        log::debug!("Command failed: {}", e);
    }
    true
}

async fn read_attachment(path: &Path) -> std::io::Result<PendingAttachment> {
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    Ok(PendingAttachment::new(name, guess_mime_type(path), data))
}

fn guess_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn print_event(event: &Event) {
    match event {
        Event::Connected => info!("✅ Connected to relay"),
        Event::Disconnected => warn!("Disconnected from relay"),
        Event::Message { room_id, message } => print_message(room_id.as_str(), message),
        Event::HistoryLoaded { room_id, count } => info!("{} earlier messages in {}", count, room_id),
        Event::PresenceChanged { online } => info!("{} user(s) online", online.len()),
        Event::TypingChanged { typing, .. } if !typing.is_empty() => {
            let names: Vec<&str> = typing.iter().map(|id| id.as_str()).collect();
            info!("{} typing...", names.join(", "));
        }
        Event::IncomingCall { from, with_video, .. } => info!(
            "📞 Incoming {} call from {}. /answer or /reject",
            if *with_video { "video" } else { "audio" },
            from.as_ref().map_or("unknown", |f| f.as_str())
        ),
        Event::CallPhaseChanged { phase, .. } => info!("Call is now {:?}", phase),
        Event::CallEnded { reason, .. } => info!("Call ended ({:?})", reason),
        Event::Error(notice) => error!("{}", notice),
        _ => {}
    }
}

fn print_message(room: &str, message: &Message) {
    match &message.attachment {
        Some(attachment) => info!(
            "[{}] {} sent {} ({} bytes): {}",
            room, message.sender_id, attachment.name, attachment.size_bytes, attachment.url
        ),
        None => info!("[{}] {}: {}", room, message.sender_id, message.text),
    }
}
