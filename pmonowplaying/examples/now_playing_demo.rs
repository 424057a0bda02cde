// examples/now_playing_demo.rs
//
// Démo du gate "now playing" avec un récepteur natif simulé :
//   - le premier abonné démarre le récepteur
//   - le récepteur pousse quelques changements de morceau
//   - le dernier abonné qui part arrête le récepteur
//
// Run (depuis la racine du crate pmonowplaying) :
//   cargo run --example now_playing_demo
//   RUST_LOG=debug cargo run --example now_playing_demo

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pmonowplaying::{
    Config, NativeBridge, NowPlayingError, NowPlayingGate, StatusChannel, StatusFeed,
    init_logging,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const PLAYLIST: &[(&str, &str, &str, &str)] = &[
    ("Daft Punk", "Discovery", "One More Time", "spotify:track:0DiWol3AO6WpXZgp0goxAV"),
    ("Air", "Moon Safari", "La Femme d'Argent", "spotify:track:5mbqPD4JfaJ8Bq6lyA3Q3z"),
    ("Justice", "Cross", "Genesis", "spotify:track:3Qqmjn3EqFQkACIo4n7JAU"),
];

/// Récepteur simulé : pousse la playlist toutes les 300 ms une fois démarré.
#[derive(Default)]
struct SimulatedReceiver {
    callback: Mutex<Option<mpsc::UnboundedSender<Option<Value>>>>,
}

#[async_trait]
impl NativeBridge for SimulatedReceiver {
    async fn start(&self, service: &str) -> Result<StatusFeed, NowPlayingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut callback = self.callback.lock().unwrap();
            if callback.is_some() {
                return Err(NowPlayingError::native("Spotify Receiver already running."));
            }
            *callback = Some(tx.clone());
        }
        println!("[native] {service}: start");

        tokio::spawn(async move {
            for (artist, album, track, id) in PLAYLIST {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let status = json!({"artist": artist, "album": album, "track": track, "id": id});
                if tx.send(Some(status)).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn stop(&self, service: &str) -> Result<(), NowPlayingError> {
        println!("[native] {service}: stop");
        if let Some(tx) = self.callback.lock().unwrap().take() {
            let _ = tx.send(Some(json!({})));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_config(None)?;
    init_logging(&config.get_log_min_level());

    let gate_config = config.gate_config();
    let channel = Arc::new(StatusChannel::new(&gate_config.channel));
    let gate = NowPlayingGate::new(
        gate_config,
        Arc::new(SimulatedReceiver::default()),
        channel.clone(),
    )?;

    let mut first = channel.subscribe();
    let second = channel.subscribe();
    println!("2 listeners attached, state = {:?}", gate.state());

    for _ in 0..2 {
        if let Some(status) = first.recv().await {
            println!("[listener 1] {status}");
        }
    }
    drop(second);
    println!("listener 2 left, state = {:?}", gate.state());

    if let Some(status) = first.recv().await {
        println!("[listener 1] {status}");
    }
    drop(first);
    gate.flush().await?;

    println!("last listener left, state = {:?}", gate.state());
    println!("cached snapshot: {}", serde_json::to_string(&gate.snapshot())?);
    println!("stats: {:?}", gate.stats());
    Ok(())
}
