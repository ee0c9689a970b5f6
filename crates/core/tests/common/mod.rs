//! Minimal Live service used to drive the controller end to end.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use gemini_realtime::codec::encode_pcm16;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};

pub const WAIT: Duration = Duration::from_secs(3);

enum Command {
    Text(String),
    Close(String),
}

struct Connection {
    setup: Value,
    commands: mpsc::UnboundedSender<Command>,
    closed_by_client: Arc<AtomicBool>,
}

pub struct MockLiveServer {
    pub url: String,
    connections: Arc<Mutex<Vec<Connection>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(usize, Value)>>,
}

impl MockLiveServer {
    /// Starts a server that refuses setups asking for any of `rejected_voices`
    /// by closing with a voice-specific reason.
    pub async fn start(rejected_voices: &[&str]) -> Self {
        Self::start_with(rejected_voices, false).await
    }

    /// Like [`start`](Self::start), but rejections arrive as an `error` frame
    /// followed by a close with a generic reason.
    pub async fn start_with_error_frames(rejected_voices: &[&str]) -> Self {
        Self::start_with(rejected_voices, true).await
    }

    async fn start_with(rejected_voices: &[&str], error_frames: bool) -> Self {
        let rejected: Vec<String> = rejected_voices.iter().map(|v| v.to_string()).collect();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let connections = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let conns = connections.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(serve(
                    tcp,
                    rejected.clone(),
                    error_frames,
                    conns.clone(),
                    inbound_tx.clone(),
                ));
            }
        });

        Self {
            url,
            connections,
            inbound: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    /// Number of connections that got as far as sending a setup frame.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn setup(&self, index: usize) -> Value {
        self.connections.lock().unwrap()[index].setup.clone()
    }

    pub fn voice(&self, index: usize) -> Option<String> {
        voice_of(&self.setup(index))
    }

    pub fn closed_by_client(&self, index: usize) -> bool {
        self.connections.lock().unwrap()[index]
            .closed_by_client
            .load(Ordering::SeqCst)
    }

    pub fn send(&self, index: usize, value: Value) {
        let conns = self.connections.lock().unwrap();
        let _ = conns[index].commands.send(Command::Text(value.to_string()));
    }

    pub fn close(&self, index: usize, reason: &str) {
        let conns = self.connections.lock().unwrap();
        let _ = conns[index].commands.send(Command::Close(reason.to_string()));
    }

    pub async fn next_frame(&self) -> (usize, Value) {
        let mut rx = self.inbound.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("mock server stopped")
    }
}

fn voice_of(setup: &Value) -> Option<String> {
    setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
        ["voiceName"]
        .as_str()
        .map(str::to_string)
}

async fn serve(
    tcp: tokio::net::TcpStream,
    rejected_voices: Vec<String>,
    error_frames: bool,
    connections: Arc<Mutex<Vec<Connection>>>,
    inbound: mpsc::UnboundedSender<(usize, Value)>,
) {
    let Ok(ws) = accept_async(tcp).await else {
        return;
    };
    let (mut tx, mut rx) = ws.split();

    let setup = loop {
        match rx.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(&text).unwrap(),
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let (commands, mut command_rx) = mpsc::unbounded_channel();
    let closed_by_client = Arc::new(AtomicBool::new(false));
    let index = {
        let mut conns = connections.lock().unwrap();
        conns.push(Connection {
            setup: setup.clone(),
            commands,
            closed_by_client: closed_by_client.clone(),
        });
        conns.len() - 1
    };

    if let Some(voice) = voice_of(&setup).filter(|v| rejected_voices.contains(v)) {
        let reason = if error_frames {
            let error = json!({"error": {"message": format!("Unsupported voice name: {voice}")}});
            let _ = tx.send(Message::Text(error.to_string().into())).await;
            "Request contains an invalid argument.".to_string()
        } else {
            format!("Unsupported voice: {voice}")
        };
        let _ = tx
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    let ack = json!({"setupComplete": {}}).to_string();
    if tx.send(Message::Text(ack.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(Command::Text(text)) => { let _ = tx.send(Message::Text(text.into())).await; }
                Some(Command::Close(reason)) => {
                    let _ = tx.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: reason.into(),
                    }))).await;
                    break;
                }
                None => break,
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send((index, serde_json::from_str(&text).unwrap()));
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    closed_by_client.store(true, Ordering::SeqCst);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

pub fn audio_frame(samples: &[i16]) -> Value {
    json!({"serverContent": {"modelTurn": {"parts": [
        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": encode_pcm16(samples)}}
    ]}}})
}

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Awaits `future`, failing the test after [`WAIT`].
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}
