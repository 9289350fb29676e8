use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;

use crate::config::Profile;
use crate::store::ProgressStore;

use super::bridge::MessagingBridge;
use super::player::{PlaybackSnapshot, PlayerControl};

/// Watched fraction above which an episode counts as finished.
pub(crate) const COMPLETE_THRESHOLD: f64 = 0.95;

/// Delay between playback supervision ticks.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stable identity of an episode file, independent of the folder it sits in.
pub(crate) fn episode_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Regular files in the source folder, in lexicographic play order.
///
/// Byte-order sorting is the contract: `ep2` sorts after `ep10`, so episode
/// numbers need zero padding. No mtime or numeric-aware tie-breaking.
pub(crate) fn pending_episodes(source: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(source) {
        Ok(entries) => entries,
        Err(err) => {
            error!("source folder {} is not readable: {err}", source.display());
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort_by_key(|path| episode_key(path));
    files
}

struct PlaybackSession {
    episode: PathBuf,
    started_at: Instant,
    resume_from: f64,
}

/// Supervises one playback session at a time: selects the next episode,
/// tracks its progress through the store, and archives it once watched.
pub(crate) struct SeriesManager<P: PlayerControl> {
    source: PathBuf,
    watched: PathBuf,
    audio_track: Arc<Mutex<Option<i64>>>,
    player: Arc<P>,
    bridge: Box<dyn MessagingBridge>,
    store: ProgressStore,
    session: Option<PlaybackSession>,
    poll_interval: Duration,
}

impl<P: PlayerControl> SeriesManager<P> {
    pub(crate) fn new(
        profile: &Profile,
        store: ProgressStore,
        player: Arc<P>,
        bridge: Box<dyn MessagingBridge>,
        audio_track: Arc<Mutex<Option<i64>>>,
    ) -> Self {
        SeriesManager {
            source: profile.source_folder.clone(),
            watched: profile.watched_folder.clone(),
            audio_track,
            player,
            bridge,
            store,
            session: None,
            poll_interval: POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub(crate) fn select_next_episode(&self) -> Option<PathBuf> {
        if !self.source.is_dir() {
            error!("source folder not found: {}", self.source.display());
            return None;
        }
        pending_episodes(&self.source).into_iter().next()
    }

    /// Play the next pending episode to completion, then archive it if the
    /// completion threshold was reached.
    pub(crate) fn play_next(&mut self) -> Result<()> {
        let Some(episode) = self.select_next_episode() else {
            info!("no episodes available in {}", self.source.display());
            return Ok(());
        };

        let key = episode_key(&episode);
        let resume_from = self.store.get(&key).position.unwrap_or(0.0);
        let audio_track = *self.audio_track.lock().unwrap();

        info!("starting episode: {key}");
        if resume_from > 0.0 {
            info!("resuming from {resume_from:.1}s");
        }
        if let Some(track) = audio_track {
            info!("using audio track #{track}");
        }

        self.bridge.start();
        if let Err(err) = self.player.start(&episode, audio_track, resume_from) {
            self.bridge.stop();
            return Err(err).with_context(|| format!("failed to start playback of {key}"));
        }
        self.session = Some(PlaybackSession {
            episode: episode.clone(),
            started_at: Instant::now(),
            resume_from,
        });

        info!("waiting for playback to finish");
        let mut warned_no_position = false;
        while self.player.is_running() {
            let had_real_position = self.persist_current_progress();
            if !had_real_position && !warned_no_position {
                warn!("player reports no playback position, falling back to wall-clock timing");
                warned_no_position = true;
            }
            thread::sleep(self.poll_interval);
        }
        // One last persist to capture the terminal position.
        self.persist_current_progress();

        let completion = self.store.completion_ratio(&key);
        info!("playback finished: {key} ({:.1}% watched)", completion * 100.0);

        let outcome = if completion >= COMPLETE_THRESHOLD {
            self.move_to_watched(&episode)
        } else {
            info!(
                "progress below {:.0}%, keeping {key} with its resume position",
                COMPLETE_THRESHOLD * 100.0
            );
            Ok(())
        };

        self.bridge.stop();
        self.session = None;
        outcome
    }

    /// Persist the player's current position, substituting elapsed wall-clock
    /// time when the control channel yields none. Returns whether a real
    /// position was obtained.
    fn persist_current_progress(&mut self) -> bool {
        let (key, fallback) = match &self.session {
            Some(session) => (
                episode_key(&session.episode),
                session.resume_from + session.started_at.elapsed().as_secs_f64(),
            ),
            None => return false,
        };

        let mut snapshot = self.player.snapshot();
        let had_real_position = snapshot.position.is_some();
        if !had_real_position {
            snapshot.position = Some(fallback);
        }

        // A failed write loses this tick's update; the next tick rewrites
        // the whole document anyway.
        if let Err(err) = self
            .store
            .set_position(&key, snapshot.position, snapshot.duration)
        {
            warn!("failed to persist progress for {key}: {err:#}");
        }
        self.publish_player_state(&key, &snapshot);
        had_real_position
    }

    fn publish_player_state(&self, key: &str, snapshot: &PlaybackSnapshot) {
        let progress = match (snapshot.position, snapshot.duration) {
            (Some(position), Some(duration)) if duration > 0.0 => {
                Some((position / duration).clamp(0.0, 1.0))
            }
            _ => None,
        };
        let payload = json!({
            "episode": key,
            "position": snapshot.position,
            "duration": snapshot.duration,
            "progress": progress,
            "paused": snapshot.paused,
            "volume": snapshot.volume,
            "timestamp": Utc::now().timestamp(),
        });
        self.bridge.publish_state(&payload);
    }

    fn move_to_watched(&mut self, episode: &Path) -> Result<()> {
        fs::create_dir_all(&self.watched).with_context(|| {
            format!("failed to create watched folder {}", self.watched.display())
        })?;
        let key = episode_key(episode);
        let dest = self.watched.join(&key);
        move_file(episode, &dest)?;
        self.store.clear(&key)?;
        info!("episode archived: {}", dest.display());
        Ok(())
    }
}

/// Move a file, falling back to copy+remove when source and destination sit
/// on different filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    fs::remove_file(from)
        .with_context(|| format!("failed to remove {} after copying", from.display()))
}
