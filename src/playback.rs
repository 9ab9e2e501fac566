//! Reply playback
//!
//! `PlaybackController` keeps at most one clip playing. Every `play` call
//! ends in exactly one outcome delivered to its callback, unless `stop`
//! runs first, in which case the outcome is swallowed.

use crate::audio::{AudioClip, OutputDevice, OutputSession};
use crate::{ParleyError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub type PlaybackId = u64;

/// Terminal result of one `play` call
#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackOutcome {
    Completed,
    Failed(ParleyError),
}

type ActivityHook = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Slot {
    next_id: PlaybackId,
    current: Option<PlaybackId>,
    session: Option<Arc<OutputSession>>,
    active: bool,
}

impl Slot {
    /// Clear the slot if `id` still owns it
    fn release(&mut self, id: PlaybackId, hook: Option<&ActivityHook>) -> bool {
        if self.current != Some(id) {
            return false;
        }
        self.current = None;
        self.session = None;
        if self.active {
            self.active = false;
            if let Some(hook) = hook {
                hook(false);
            }
        }
        true
    }
}

pub struct PlaybackController {
    device: Arc<dyn OutputDevice>,
    slot: Arc<Mutex<Slot>>,
    activity: Option<ActivityHook>,
}

impl PlaybackController {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self {
            device,
            slot: Arc::new(Mutex::new(Slot::default())),
            activity: None,
        }
    }

    /// Observe output becoming active (`true`) and inactive (`false`)
    ///
    /// Meant for visualizations; the hook runs under the controller's lock
    /// and must not call back into it.
    pub fn with_activity_hook(mut self, hook: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.activity = Some(Arc::new(hook));
        self
    }

    /// Play `clip`, stopping anything already playing
    ///
    /// `on_finished` receives the single terminal outcome. Like the activity
    /// hook it runs under the controller's lock.
    pub fn play(
        &self,
        clip: AudioClip,
        on_finished: impl FnOnce(PlaybackId, PlaybackOutcome) + Send + 'static,
    ) -> Result<PlaybackId> {
        self.stop();

        let id = {
            let mut slot = self.slot.lock();
            slot.next_id += 1;
            slot.current = Some(slot.next_id);
            slot.next_id
        };

        let device = Arc::clone(&self.device);
        let slot = Arc::clone(&self.slot);
        let hook = self.activity.clone();
        let duration = clip.duration();

        let spawned = thread::Builder::new()
            .name("parley-player".into())
            .spawn(move || {
                let session = match device.begin(clip) {
                    Ok(session) => Arc::new(session),
                    Err(e) => {
                        let mut slot = slot.lock();
                        if slot.release(id, hook.as_ref()) {
                            on_finished(id, PlaybackOutcome::Failed(e));
                        }
                        return;
                    }
                };

                {
                    let mut slot = slot.lock();
                    if slot.current != Some(id) {
                        // Stopped while the device was still starting
                        session.stop();
                        return;
                    }
                    slot.session = Some(Arc::clone(&session));
                    slot.active = true;
                    if let Some(hook) = hook.as_ref() {
                        hook(true);
                    }
                }
                info!("Playback {} started ({:?})", id, duration);

                let outcome = match session.wait() {
                    Ok(()) => PlaybackOutcome::Completed,
                    Err(e) => PlaybackOutcome::Failed(e),
                };

                let mut slot = slot.lock();
                if slot.release(id, hook.as_ref()) {
                    debug!("Playback {} finished: {:?}", id, outcome);
                    on_finished(id, outcome);
                }
            });

        match spawned {
            Ok(_) => Ok(id),
            Err(e) => {
                self.slot.lock().release(id, self.activity.as_ref());
                Err(ParleyError::PlaybackDecode(format!("Failed to spawn player: {}", e)))
            }
        }
    }

    /// Stop current output; a no-op when nothing is playing
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        let Some(id) = slot.current else {
            return;
        };
        if let Some(session) = slot.session.as_ref() {
            session.stop();
        }
        slot.release(id, self.activity.as_ref());
        debug!("Playback {} stopped", id);
    }

    /// Output has started and not yet finished
    pub fn is_playing(&self) -> bool {
        self.slot.lock().active
    }

    /// A `play` call is in flight, started or not
    pub fn is_pending(&self) -> bool {
        self.slot.lock().current.is_some()
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        if self.is_pending() {
            warn!("Playback controller dropped mid-playback");
        }
        self.stop();
    }
}
