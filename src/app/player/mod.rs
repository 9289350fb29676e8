mod ipc;

use std::path::Path;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::{Value, json};

pub(crate) use self::ipc::IpcError;

/// Point-in-time view of the player. Any field may be absent when the
/// control channel is unreachable or the property is not known yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PlaybackSnapshot {
    pub(crate) position: Option<f64>,
    pub(crate) duration: Option<f64>,
    pub(crate) paused: Option<bool>,
    pub(crate) volume: Option<f64>,
}

/// Control surface of the external player process. Implementations must be
/// safe to call from the remote-command thread while the polling loop runs.
pub(crate) trait PlayerControl: Send + Sync {
    fn start(&self, episode: &Path, audio_track: Option<i64>, start_position: f64) -> Result<()>;
    fn is_running(&self) -> bool;
    fn stop(&self);
    fn snapshot(&self) -> PlaybackSnapshot;
    fn set_pause(&self, paused: bool) -> Result<Value, IpcError>;
    fn toggle_pause(&self) -> Result<Value, IpcError>;
    fn seek(&self, seconds: f64) -> Result<Value, IpcError>;
    fn set_volume(&self, volume: f64) -> Result<Value, IpcError>;
    fn set_audio_track(&self, track: i64) -> Result<Value, IpcError>;
    fn cycle_audio_track(&self) -> Result<Value, IpcError>;
}

/// mpv launched as a child process, controlled over its JSON IPC endpoint.
pub(crate) struct MpvPlayer {
    mpv_path: String,
    options: Vec<String>,
    ipc_socket: String,
    process: Mutex<Option<Child>>,
}

impl MpvPlayer {
    pub(crate) fn new(mpv_path: String, options: Vec<String>, ipc_socket: String) -> Self {
        MpvPlayer {
            mpv_path,
            options,
            ipc_socket,
            process: Mutex::new(None),
        }
    }

    fn request(&self, command: Value) -> Result<Value, IpcError> {
        ipc::request(&self.ipc_socket, &command)
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        self.request(json!(["get_property", name])).ok()
    }

    fn set_property(&self, name: &str, value: Value) -> Result<Value, IpcError> {
        self.request(json!(["set_property", name, value]))
    }
}

impl PlayerControl for MpvPlayer {
    fn start(&self, episode: &Path, audio_track: Option<i64>, start_position: f64) -> Result<()> {
        let mut cmd = ProcessCommand::new(&self.mpv_path);
        cmd.args(&self.options)
            .arg(format!("--input-ipc-server={}", self.ipc_socket));
        if let Some(track) = audio_track {
            cmd.arg(format!("--aid={track}"));
        }
        if start_position > 0.0 {
            cmd.arg(format!("--start={start_position}"));
        }
        cmd.arg(episode).stdout(Stdio::null()).stderr(Stdio::null());

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to launch {}", self.mpv_path))?;
        *self.process.lock().unwrap() = Some(child);
        Ok(())
    }

    fn is_running(&self) -> bool {
        let mut guard = self.process.lock().unwrap();
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                _ => {
                    *guard = None;
                    false
                }
            },
            None => false,
        }
    }

    fn stop(&self) {
        if self.is_running() {
            let _ = self.request(json!(["quit"]));
        }
        let mut guard = self.process.lock().unwrap();
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position: self.get_property("time-pos").and_then(|v| v.as_f64()),
            duration: self.get_property("duration").and_then(|v| v.as_f64()),
            paused: self.get_property("pause").and_then(|v| v.as_bool()),
            volume: self.get_property("volume").and_then(|v| v.as_f64()),
        }
    }

    fn set_pause(&self, paused: bool) -> Result<Value, IpcError> {
        self.set_property("pause", json!(paused))
    }

    fn toggle_pause(&self) -> Result<Value, IpcError> {
        self.request(json!(["cycle", "pause"]))
    }

    fn seek(&self, seconds: f64) -> Result<Value, IpcError> {
        self.request(json!(["seek", seconds, "relative"]))
    }

    fn set_volume(&self, volume: f64) -> Result<Value, IpcError> {
        self.set_property("volume", json!(volume))
    }

    fn set_audio_track(&self, track: i64) -> Result<Value, IpcError> {
        self.set_property("aid", json!(track))
    }

    fn cycle_audio_track(&self) -> Result<Value, IpcError> {
        self.request(json!(["cycle", "audio"]))
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
