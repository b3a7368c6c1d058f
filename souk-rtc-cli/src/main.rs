//! Souk RTC demo driver
//!
//! Runs scripted two-client scenarios against the in-process loopback
//! router, printing the event flow as it happens. Useful for watching
//! the call state machine and the chat reconciliation behave without a
//! server or media devices.

use anyhow::Result;
use clap::{Parser, Subcommand};
use souk_rtc_core::cache::{CacheConfig, MessageCache};
use souk_rtc_core::client::{RtcClient, RtcConfig};
use souk_rtc_core::loopback::{FakeMediaSource, LoopbackEngineFactory, LoopbackRouter};
use souk_rtc_core::types::{ConversationId, MediaKind, MessageType, Profile};
use souk_rtc_core::{CallEvent, ChatEvent};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted call between two loopback clients
    Call {
        /// Place a video call instead of audio-only
        #[arg(long)]
        video: bool,

        /// Decline on the callee side instead of accepting
        #[arg(long)]
        reject: bool,
    },

    /// Run a scripted chat exchange between two loopback clients
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "souk=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Call { video, reject } => run_call_demo(video, reject).await,
        Commands::Chat => run_chat_demo().await,
    }
}

async fn spawn_client(router: &Arc<LoopbackRouter>, name: &str) -> Result<(Profile, RtcClient)> {
    let profile = Profile::new(name, name);
    let client = RtcClient::new(
        profile.user_id.clone(),
        router.wire_for(profile.clone()),
        router.api_for(profile.user_id.clone()),
        Arc::new(MessageCache::open_in_memory(CacheConfig::default())?),
        Arc::new(FakeMediaSource::new()),
        Arc::new(LoopbackEngineFactory::new()),
        RtcConfig::default(),
    );
    client.start();
    let mut connected = client.channel().watch_connected();
    connected.wait_for(|up| *up).await?;
    println!("[{name}] connected");
    Ok((profile, client))
}

fn watch_calls(name: &'static str, client: &RtcClient) {
    let mut events = client.calls().subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::IncomingCall { caller, media_kind, .. } => {
                    println!("[{name}] incoming {media_kind:?} call from {}", caller.user_id);
                }
                CallEvent::StateChanged { state, .. } => {
                    println!("[{name}] call state: {state:?}");
                }
                CallEvent::RemoteMediaReady { .. } => {
                    println!("[{name}] remote media ready");
                }
                CallEvent::Ended { state, reason, .. } => {
                    println!(
                        "[{name}] call over: {state:?}{}",
                        reason.map(|r| format!(" ({r})")).unwrap_or_default()
                    );
                }
            }
        }
    });
}

async fn run_call_demo(video: bool, reject: bool) -> Result<()> {
    let router = Arc::new(LoopbackRouter::new());
    let (_alice, alice) = spawn_client(&router, "alice").await?;
    let (bob_profile, bob) = spawn_client(&router, "bob").await?;
    watch_calls("alice", &alice);
    watch_calls("bob", &bob);

    let kind = if video { MediaKind::Video } else { MediaKind::Audio };
    println!("--- alice calls bob ({kind:?}) ---");
    alice.calls().start_call(bob_profile, kind).await?;

    // Let the offer ring before the callee reacts.
    tokio::time::sleep(Duration::from_millis(200)).await;

    if reject {
        println!("--- bob rejects ---");
        bob.calls().reject().await?;
    } else {
        println!("--- bob accepts ---");
        bob.calls().accept().await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        println!("--- alice hangs up ---");
        alice.calls().hang_up().await?;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice.calls().current().await.is_none());
    assert!(bob.calls().current().await.is_none());
    println!("--- both sides idle, no leaked media ---");

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn run_chat_demo() -> Result<()> {
    let router = Arc::new(LoopbackRouter::new());
    let (alice_profile, alice) = spawn_client(&router, "alice").await?;
    let (bob_profile, bob) = spawn_client(&router, "bob").await?;

    let convo = ConversationId::new("demo");
    router.add_conversation(
        convo.clone(),
        alice_profile.user_id.clone(),
        bob_profile.user_id,
    );
    alice.chat().bootstrap().await?;
    bob.chat().bootstrap().await?;
    alice.chat().select_conversation(&convo).await?;
    bob.chat().select_conversation(&convo).await?;

    let mut bob_chat = bob.chat().subscribe_events();

    println!("--- alice types, then sends ---");
    alice.chat().set_typing(&convo, true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    for typer in bob.presence().typing_in(&convo) {
        println!("[bob] {typer} is typing...");
    }
    alice.chat().set_typing(&convo, false);
    alice
        .chat()
        .send_message(&convo, "hey, is the lamp still for sale?", MessageType::Text)?;

    // Wait for the broadcast to land on bob's side.
    while let Ok(event) = bob_chat.recv().await {
        if matches!(event, ChatEvent::MessagesUpdated { .. }) {
            break;
        }
    }
    for message in bob.chat().messages(&convo) {
        println!(
            "[bob] {}: {} [{:?}]",
            message.sender_id, message.content, message.status
        );
    }

    println!("--- bob reads and replies ---");
    bob.chat().mark_read(&convo)?;
    bob.chat()
        .send_message(&convo, "it is! want to call?", MessageType::Text)?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("--- alice's view ---");
    for message in alice.chat().messages(&convo) {
        println!(
            "[alice] {}: {} [{:?}]",
            message.sender_id, message.content, message.status
        );
    }

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
