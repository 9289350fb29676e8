use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde_json::Value;

use super::bridge::CommandSink;
use super::player::PlayerControl;

/// Routes remote commands onto the player. Shares nothing with the polling
/// loop except the player handle and the queued audio-track default.
pub(crate) struct RemoteHandler<P: PlayerControl> {
    player: Arc<P>,
    audio_track: Arc<Mutex<Option<i64>>>,
}

impl<P: PlayerControl> RemoteHandler<P> {
    pub(crate) fn new(player: Arc<P>, audio_track: Arc<Mutex<Option<i64>>>) -> Self {
        RemoteHandler { player, audio_track }
    }

    fn set_audio_track(&self, track: i64) {
        if self.player.is_running() {
            if let Err(err) = self.player.set_audio_track(track) {
                warn!("audio track switch failed: {err}");
            }
            return;
        }
        *self.audio_track.lock().unwrap() = Some(track);
        info!("audio track #{track} queued for the next session");
    }
}

impl<P: PlayerControl> CommandSink for RemoteHandler<P> {
    fn on_command(&self, command: &str, data: Value) {
        // Audio-track selection works without a session: it becomes the
        // default for the next one.
        if command == "audio/set" {
            let track = data.get("track").and_then(Value::as_i64).unwrap_or(1);
            self.set_audio_track(track);
            return;
        }

        let live = self.player.is_running();
        let result = match command {
            "pause/toggle" if live => self.player.toggle_pause(),
            "pause/set" if live => self
                .player
                .set_pause(data.get("value").and_then(Value::as_bool).unwrap_or(true)),
            "seek" if live => self
                .player
                .seek(data.get("seconds").and_then(Value::as_f64).unwrap_or(0.0)),
            "volume/set" if live => self
                .player
                .set_volume(data.get("value").and_then(Value::as_f64).unwrap_or(50.0)),
            "audio/cycle" if live => self.player.cycle_audio_track(),
            "pause/toggle" | "pause/set" | "seek" | "volume/set" | "audio/cycle" => {
                info!("ignoring remote command {command}: no active playback session");
                return;
            }
            other => {
                info!("unknown remote command: {other} ({data})");
                return;
            }
        };
        if let Err(err) = result {
            warn!("remote command {command} failed: {err}");
        }
    }
}
