//! An in-process stand-in for the Live service.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use gemini_realtime::{LiveEvent, Subscription, codec::encode_pcm16};
use serde_json::{Value, json};
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

#[derive(Clone, Default)]
pub struct MockOptions {
    /// Setups asking for one of these voices are closed with a voice error.
    pub rejected_voices: Vec<String>,
    /// Never acknowledge setup.
    pub skip_setup_complete: bool,
    /// Report rejected voices in an `error` frame, then close with a generic reason.
    pub voice_error_frame: bool,
}

pub enum Command {
    Text(String),
    Binary(Vec<u8>),
    Close(String),
}

pub struct MockConnection {
    pub setup: Value,
    pub commands: mpsc::UnboundedSender<Command>,
    pub closed_by_client: Arc<AtomicBool>,
}

pub struct MockLiveServer {
    pub url: String,
    connections: Arc<Mutex<Vec<MockConnection>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(usize, Value)>>,
}

impl MockLiveServer {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let connections = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let conns = connections.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(serve_connection(
                    tcp,
                    options.clone(),
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

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn setup(&self, index: usize) -> Value {
        self.connections.lock().unwrap()[index].setup.clone()
    }

    pub fn closed_by_client(&self, index: usize) -> bool {
        self.connections.lock().unwrap()[index]
            .closed_by_client
            .load(Ordering::SeqCst)
    }

    pub fn send(&self, index: usize, value: Value) {
        self.command(index, Command::Text(value.to_string()));
    }

    pub fn send_binary(&self, index: usize, value: Value) {
        self.command(index, Command::Binary(value.to_string().into_bytes()));
    }

    pub fn send_raw(&self, index: usize, text: &str) {
        self.command(index, Command::Text(text.to_string()));
    }

    pub fn close(&self, index: usize, reason: &str) {
        self.command(index, Command::Close(reason.to_string()));
    }

    fn command(&self, index: usize, command: Command) {
        let conns = self.connections.lock().unwrap();
        let _ = conns[index].commands.send(command);
    }

    /// Next client frame received after setup, as `(connection, json)`.
    pub async fn next_frame(&self) -> (usize, Value) {
        let mut rx = self.inbound.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("mock server stopped")
    }

    pub async fn wait_until_closed_by_client(&self, index: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.closed_by_client(index) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "client never closed connection {index}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn serve_connection(
    tcp: tokio::net::TcpStream,
    options: MockOptions,
    connections: Arc<Mutex<Vec<MockConnection>>>,
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
        conns.push(MockConnection {
            setup: setup.clone(),
            commands,
            closed_by_client: closed_by_client.clone(),
        });
        conns.len() - 1
    };

    let voice = setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
        ["prebuiltVoiceConfig"]["voiceName"]
        .as_str()
        .map(str::to_string);
    if let Some(voice) = voice.filter(|v| options.rejected_voices.contains(v)) {
        reject_voice(&mut tx, &voice, options.voice_error_frame).await;
        return;
    }

    if !options.skip_setup_complete {
        let ack = json!({"setupComplete": {}}).to_string();
        if tx.send(Message::Text(ack.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(Command::Text(text)) => { let _ = tx.send(Message::Text(text.into())).await; }
                Some(Command::Binary(data)) => {
                    let _ = tx.send(Message::Binary(data.into())).await;
                }
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

pub async fn next_event(sub: &mut Subscription) -> LiveEvent {
    tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

async fn reject_voice<S>(tx: &mut S, voice: &str, error_frame: bool)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let reason = if error_frame {
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
}
