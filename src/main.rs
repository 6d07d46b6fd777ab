#![allow(non_snake_case)]

use clap::Parser;
use dioxus::prelude::*;
use dioxus_desktop::{Config as DesktopConfig, WindowBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

use voice_room::config::Config;
use voice_room::connection::{ConnectionStatus, SessionSnapshot};
use voice_room::push_to_talk::{KeyEdge, PushToTalk};
use voice_room::session::CallSession;
use voice_room::share::{copy_to_clipboard, location_with_room, room_from_launch_arg};

#[derive(Parser, Debug)]
#[clap(name = "voice-room")]
struct Args {
    /// JSON config file; defaults apply when absent.
    #[clap(long, env = "VOICE_ROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Room link (`...?room=name`) or bare room name to join on launch.
    location: Option<String>,
}

struct AppProps {
    session: Arc<CallSession>,
    launch_room: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match Config::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("cannot load config: {}", e);
            std::process::exit(1);
        }
    };
    let launch_room = args.location.as_deref().and_then(room_from_launch_arg);
    let session = Arc::new(CallSession::from_config(config));

    dioxus_desktop::launch_with_props(
        App,
        AppProps { session, launch_room },
        DesktopConfig::new().with_window(WindowBuilder::new().with_title("Voice Room")),
    );
}

#[derive(Props, PartialEq)]
struct TalkingProps {
    label: String,
    active: bool,
}

fn TalkingIndicator(cx: Scope<TalkingProps>) -> Element {
    let class = if cx.props.active { "talking-dot active" } else { "talking-dot" };
    cx.render(rsx! {
        div { class: "talking-item",
            span { class: "{class}" }
            span { "{cx.props.label}" }
        }
    })
}

fn App(cx: Scope<AppProps>) -> Element {
    let snapshot = use_state(cx, || cx.props.session.snapshot());
    let room_input = use_state(cx, || cx.props.launch_room.clone().unwrap_or_default());
    let ptt = use_ref(cx, || PushToTalk::new(cx.props.session.config().push_to_talk_key.clone()));

    use_future(cx, (), |_| {
        let mut rx = cx.props.session.subscribe();
        let snapshot = snapshot.clone();
        async move {
            while rx.changed().await.is_ok() {
                let next = rx.borrow().clone();
                snapshot.set(next);
            }
        }
    });

    use_future(cx, (), |_| {
        let session = cx.props.session.clone();
        let launch_room = cx.props.launch_room.clone();
        async move {
            let Some(room) = launch_room else {
                return;
            };
            tokio::time::sleep(session.config().auto_connect_delay()).await;
            if let Err(e) = session.connect(&room).await {
                warn!("auto-connect to {} failed: {}", room, e);
            }
        }
    });

    let connect = move || {
        let session = cx.props.session.clone();
        let room = room_input.get().clone();
        cx.spawn(async move {
            if let Err(e) = session.connect(&room).await {
                warn!("connect failed: {}", e);
            }
        });
    };

    let disconnect = move |_| {
        let session = cx.props.session.clone();
        ptt.write().reset();
        cx.spawn(async move {
            if let Err(e) = session.disconnect().await {
                warn!("disconnect failed: {}", e);
            }
        });
    };

    let toggle_mute = move |_| {
        let session = cx.props.session.clone();
        cx.spawn(async move {
            session.toggle_mute().await;
        });
    };

    let push_to_talk = cx.props.session.config().push_to_talk;
    let ptt_key = ptt.read().key().to_string();
    let on_key = move |edge: Option<KeyEdge>| {
        let Some(edge) = edge else {
            return;
        };
        let session = cx.props.session.clone();
        cx.spawn(async move {
            session.set_mic_enabled(edge == KeyEdge::Pressed).await;
        });
    };

    let snap: &SessionSnapshot = snapshot.get();
    let status_class = snap.status.css_class();
    let connected = snap.status == ConnectionStatus::Connected;
    let idle = snap.status == ConnectionStatus::NotConnected;
    let mute_label = if snap.mic_enabled { "Mute" } else { "Unmute" };
    let share_room = match snap.active_room() {
        Some(room) => room.to_string(),
        None => room_input.get().trim().to_string(),
    };
    // Once a session starts the field shows the resolved name, not what was typed.
    let shown_room = match snap.active_room() {
        Some(room) => room.to_string(),
        None => room_input.get().clone(),
    };
    let share_link = if share_room.is_empty() {
        None
    } else {
        location_with_room(&cx.props.session.config().share_base_url, &share_room).ok()
    };
    let link_to_copy = share_link.clone();

    cx.render(rsx! {
        style { include_str!("./style.css") }
        div {
            class: "app",
            tabindex: "0",
            onkeydown: move |evt| {
                if push_to_talk && connected {
                    on_key(ptt.write().key_down(&evt.code().to_string()));
                }
            },
            onkeyup: move |evt| {
                if push_to_talk && connected {
                    on_key(ptt.write().key_up(&evt.code().to_string()));
                }
            },

            h1 { "Voice Room" }

            div { class: "control-panel",
                label { r#for: "roomName", "Room:" }
                input {
                    id: "roomName",
                    placeholder: "leave blank for a new room",
                    value: "{shown_room}",
                    disabled: !idle,
                    oninput: move |evt| room_input.set(evt.value.clone()),
                    onkeydown: move |evt| {
                        if idle && evt.code().to_string() == "Enter" {
                            connect();
                        }
                    }
                }
                button {
                    onclick: move |_| connect(),
                    disabled: !idle,
                    "Connect"
                }
                button {
                    onclick: disconnect,
                    disabled: idle,
                    "Disconnect"
                }
            }

            div { class: "connection-status",
                "Status: ",
                span { class: "status-value {status_class}", "{snap.status}" }
                snap.strategy.as_ref().map(|strategy| rsx!(
                    span { class: "status-strategy", " via {strategy}" }
                ))
                snap.active_room().map(|room| rsx!(
                    div { class: "status-room", "Room: {room}" }
                ))
            }

            snap.notification.as_ref().map(|text| rsx!(
                div { class: "notification", "{text}" }
            ))

            div { class: "control-panel",
                h3 { "Audio" }
                button {
                    onclick: toggle_mute,
                    disabled: !connected,
                    "{mute_label}"
                }
                push_to_talk.then(|| rsx!(
                    span { class: "hint", "Hold {ptt_key} to talk" }
                ))
                TalkingIndicator { label: "You".to_string(), active: snap.local_talking }
                TalkingIndicator { label: "Peers".to_string(), active: snap.peers_talking }
            }

            div { class: "control-panel",
                h3 { "Peers" }
                snap.peers.is_empty().then(|| rsx!(
                    div { class: "peer-empty", "No peers connected" }
                ))
                ul { class: "peer-list",
                    snap.peers.iter().map(|peer| rsx!(
                        li { key: "{peer}", class: "peer-item", "{peer}" }
                    ))
                }
            }

            share_link.map(|link| rsx!(
                div { class: "control-panel share",
                    h3 { "Invite" }
                    input { class: "share-link", readonly: true, value: "{link}" }
                    button {
                        onclick: move |_| {
                            let Some(link) = link_to_copy.as_deref() else {
                                return;
                            };
                            match copy_to_clipboard(link) {
                                Ok(()) => cx.props.session.notify("Link copied!"),
                                Err(e) => cx.props.session.notify(format!("Copy failed: {}", e)),
                            }
                        },
                        "Copy"
                    }
                }
            ))
        }
    })
}
