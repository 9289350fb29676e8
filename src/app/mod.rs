mod bridge;
mod manager;
mod player;
mod remote;


use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::cli::{Cli, Command};
use crate::config::{Config, Profile};
use crate::paths;
use crate::store::ProgressStore;

use self::bridge::{MessagingBridge, MqttBridge, NullBridge};
use self::manager::{SeriesManager, episode_key, pending_episodes};
use self::player::MpvPlayer;
use self::remote::RemoteHandler;

pub fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => paths::config_file_path()?,
    };
    let config = Config::load(&config_path)?;
    let profile = config.profile(&cli.profile)?.clone();

    let state_path = match config.state_file.clone() {
        Some(path) => path,
        None => paths::state_file_path()?,
    };
    let store = ProgressStore::load(state_path);

    match cli.command {
        Some(Command::Status) => run_status(&cli.profile, &profile, &store),
        Some(Command::Reset { episode }) => run_reset(store, &episode),
        Some(Command::Play) | None => run_play(&config, &profile, store),
    }
}

fn run_play(config: &Config, profile: &Profile, store: ProgressStore) -> Result<()> {
    let player = Arc::new(MpvPlayer::new(
        config.mpv_path.clone(),
        config.mpv_options.clone(),
        config.ipc_socket.clone(),
    ));
    let audio_track = Arc::new(Mutex::new(profile.audio_track));

    let bridge: Box<dyn MessagingBridge> = if config.mqtt.enabled {
        let handler = Arc::new(RemoteHandler::new(player.clone(), audio_track.clone()));
        Box::new(MqttBridge::new(config.mqtt.clone(), handler))
    } else {
        Box::new(NullBridge)
    };

    let mut manager = SeriesManager::new(profile, store, player, bridge, audio_track);
    manager.play_next()
}

fn run_status(profile_name: &str, profile: &Profile, store: &ProgressStore) -> Result<()> {
    println!("Profile: {profile_name}");
    println!("Source folder:  {}", profile.source_folder.display());
    println!("Watched folder: {}", profile.watched_folder.display());
    println!(
        "Autoplay next:  {}",
        if profile.autoplay_next { "yes" } else { "no" }
    );
    if let Some(track) = profile.audio_track {
        println!("Audio track:    #{track}");
    }

    let pending = pending_episodes(&profile.source_folder);
    if pending.is_empty() {
        println!("\nNo pending episodes.");
    } else {
        println!();
        println!(
            "{:<44} {:>10} {:>10} {:>8}",
            "EPISODE", "POSITION", "DURATION", "WATCHED"
        );
        for path in &pending {
            let key = episode_key(path);
            let record = store.get(&key);
            let watched = store.completion_ratio(&key);
            println!(
                "{:<44} {:>10} {:>10} {:>8}",
                truncate(&key, 44),
                format_seconds(record.position),
                format_seconds(record.duration),
                format!("{:.0}%", watched * 100.0)
            );
        }
    }

    let pending_keys: BTreeSet<String> = pending.iter().map(|path| episode_key(path)).collect();
    let orphaned: Vec<&str> = store
        .entries()
        .map(|(key, _)| key)
        .filter(|key| !pending_keys.contains(*key))
        .collect();
    if !orphaned.is_empty() {
        println!("\nStored progress without a matching file (use `nextup reset`):");
        for key in orphaned {
            println!("  {key}");
        }
    }
    Ok(())
}

fn run_reset(mut store: ProgressStore, episode: &str) -> Result<()> {
    if !store.contains(episode) {
        println!("No progress recorded for {episode}.");
        return Ok(());
    }
    store.clear(episode)?;
    println!("Cleared progress for {episode}.");
    Ok(())
}

pub(crate) fn format_seconds(value: Option<f64>) -> String {
    match value {
        Some(seconds) => format!("{seconds:.0}s"),
        None => "-".to_string(),
    }
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
