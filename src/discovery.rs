//! Consumer of application lifecycle events.
//!
//! Enumeration of running processes happens elsewhere; this module only keeps
//! track of which identifiers are currently candidates for a gain.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::debug;

/// What happened to an application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// The application started producing audio or was launched.
    Launched,
    /// The application exited.
    Terminated,
}

/// One lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppEvent {
    /// Application identifier.
    pub app_id: String,
    /// What happened.
    pub kind: Lifecycle,
}

impl AppEvent {
    /// `app_id` was launched.
    pub fn launched(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            kind: Lifecycle::Launched,
        }
    }

    /// `app_id` terminated.
    pub fn terminated(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            kind: Lifecycle::Terminated,
        }
    }
}

/// Running applications, ordered by identifier. Clones share state.
#[derive(Clone, Default)]
pub struct ApplicationRoster {
    running: Arc<Mutex<BTreeSet<String>>>,
}

impl ApplicationRoster {
    /// Empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the roster.
    pub fn apply(&self, event: &AppEvent) {
        let mut running = self.running.lock();
        let changed = match event.kind {
            Lifecycle::Launched => running.insert(event.app_id.clone()),
            Lifecycle::Terminated => running.remove(&event.app_id),
        };
        if changed {
            debug!(app_id = %event.app_id, kind = ?event.kind, running = running.len(), "roster updated");
        }
    }

    /// Identifiers currently running.
    pub fn candidates(&self) -> Vec<String> {
        self.running.lock().iter().cloned().collect()
    }

    /// Whether `app_id` is running.
    pub fn contains(&self, app_id: &str) -> bool {
        self.running.lock().contains(app_id)
    }

    /// Consume `events` on a background thread until the sender side closes.
    pub fn spawn_watcher(&self, events: Receiver<AppEvent>) -> io::Result<JoinHandle<()>> {
        let roster = self.clone();
        thread::Builder::new()
            .name("app-roster".into())
            .spawn(move || {
                for event in events {
                    roster.apply(&event);
                }
                debug!("application event stream closed");
            })
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;

    #[test]
    fn launch_and_terminate_track_candidates() {
        let roster = ApplicationRoster::new();
        roster.apply(&AppEvent::launched("com.spotify.client"));
        roster.apply(&AppEvent::launched("com.apple.Music"));
        roster.apply(&AppEvent::launched("com.spotify.client"));
        assert_eq!(
            roster.candidates(),
            vec!["com.apple.Music".to_string(), "com.spotify.client".to_string()]
        );
        roster.apply(&AppEvent::terminated("com.apple.Music"));
        assert!(!roster.contains("com.apple.Music"));
        roster.apply(&AppEvent::terminated("never.seen"));
        assert_eq!(roster.candidates().len(), 1);
    }

    #[test]
    fn watcher_drains_channel_then_exits() {
        let roster = ApplicationRoster::new();
        let (tx, rx) = unbounded();
        let watcher = roster.spawn_watcher(rx).unwrap();
        tx.send(AppEvent::launched("org.videolan.vlc")).unwrap();
        tx.send(AppEvent::launched("us.zoom.xos")).unwrap();
        tx.send(AppEvent::terminated("org.videolan.vlc")).unwrap();
        drop(tx);
        watcher.join().unwrap();
        assert_eq!(roster.candidates(), vec!["us.zoom.xos".to_string()]);
    }
}
