//! Attribute slides - timed interpolation of float attributes
//!
//! One scheduler thread per session advances every running slide at a fixed
//! step. Starting a slide on a (voice, attribute) pair that already has one
//! supersedes the old slide. Slides end early when cancelled, when their
//! voice is removed, or when the session shuts down.

use crate::attribute::{validate, AttributeKind, AttributeValue};
use crate::error::{AudioError, Result};
use crate::registry::VoiceHandle;
use crate::voice::VoiceControl;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// How a slide finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideOutcome {
    /// Reached the target value
    Completed,
    /// Cancelled through its handle, by voice removal or by session shutdown
    Cancelled,
    /// Replaced by a newer slide on the same attribute
    Superseded,
}

/// Handle to a running slide
pub struct SlideHandle {
    cancel: Arc<AtomicBool>,
    done: Receiver<SlideOutcome>,
}

impl SlideHandle {
    /// Ask the scheduler to stop the slide at its current value
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Block until the slide finishes
    pub fn wait(self) -> SlideOutcome {
        self.done.recv().unwrap_or(SlideOutcome::Cancelled)
    }

    /// Block for at most `timeout`; `None` if the slide is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<SlideOutcome> {
        match self.done.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(SlideOutcome::Cancelled),
        }
    }
}

struct SlideTask {
    handle: VoiceHandle,
    kind: AttributeKind,
    control: Arc<VoiceControl>,
    from: f32,
    to: f32,
    started: Instant,
    duration: Duration,
    cancel: Arc<AtomicBool>,
    done: Sender<SlideOutcome>,
}

impl SlideTask {
    fn finish(&self, outcome: SlideOutcome) {
        let _ = self.done.try_send(outcome);
    }

    fn store(&self, value: f32) {
        // Endpoints were validated at submission, so interpolated values are in range
        let _ = self
            .control
            .set_attribute(self.kind, AttributeValue::Float(value));
    }

    /// Advance to `now`; returns false once the slide is over
    fn tick(&self, now: Instant) -> bool {
        if self.cancel.load(Ordering::Acquire) || self.control.is_removed() {
            self.finish(SlideOutcome::Cancelled);
            return false;
        }

        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration {
            self.store(self.to);
            self.finish(SlideOutcome::Completed);
            return false;
        }

        let t = elapsed.as_secs_f32() / self.duration.as_secs_f32();
        self.store(self.from + (self.to - self.from) * t);
        true
    }
}

enum SchedulerMessage {
    Start(SlideTask),
    Shutdown,
}

/// Session-owned slide worker
pub(crate) struct SlideScheduler {
    submit: Sender<SchedulerMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SlideScheduler {
    pub(crate) fn start(step: Duration) -> Result<Self> {
        let (submit, inbox) = unbounded();
        let thread = std::thread::Builder::new()
            .name("mixdown-slides".into())
            .spawn(move || run(inbox, step))
            .map_err(|e| AudioError::invalid_operation(format!("failed to spawn slide thread: {e}")))?;

        Ok(Self {
            submit,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Start interpolating `kind` on a voice from its current value to `target`
    pub(crate) fn begin(
        &self,
        handle: VoiceHandle,
        control: Arc<VoiceControl>,
        kind: AttributeKind,
        target: f32,
        duration: Duration,
    ) -> Result<SlideHandle> {
        if !kind.is_float() {
            return Err(AudioError::invalid_argument(format!(
                "{kind:?} is not a float attribute and cannot slide"
            )));
        }
        let to = match validate(kind, AttributeValue::Float(target))? {
            AttributeValue::Float(v) => v,
            AttributeValue::Bool(_) => target,
        };
        let from = control.attribute(kind).as_float().unwrap_or(to);

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded(1);
        let task = SlideTask {
            handle,
            kind,
            control,
            from,
            to,
            started: Instant::now(),
            duration,
            cancel: Arc::clone(&cancel),
            done: done_tx,
        };

        self.submit
            .send(SchedulerMessage::Start(task))
            .map_err(|_| AudioError::InvalidState("slide scheduler has stopped".into()))?;

        Ok(SlideHandle {
            cancel,
            done: done_rx,
        })
    }

    /// Cancel every running slide and join the worker
    pub(crate) fn stop(&self) {
        let _ = self.submit.send(SchedulerMessage::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Slide scheduler thread panicked");
            }
        }
    }
}

impl Drop for SlideScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inbox: Receiver<SchedulerMessage>, step: Duration) {
    let mut active: Vec<SlideTask> = Vec::new();

    loop {
        let message = if active.is_empty() {
            match inbox.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            }
        } else {
            match inbox.recv_timeout(step) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        match message {
            Some(SchedulerMessage::Start(task)) => {
                active.retain(|running| {
                    let same = running.handle == task.handle && running.kind == task.kind;
                    if same {
                        running.finish(SlideOutcome::Superseded);
                    }
                    !same
                });
                debug!(
                    "Slide {:?} on voice {} to {} over {:?}",
                    task.kind,
                    task.handle.index(),
                    task.to,
                    task.duration
                );
                active.push(task);
            }
            Some(SchedulerMessage::Shutdown) => break,
            None => {}
        }

        let now = Instant::now();
        active.retain(|task| task.tick(now));
    }

    for task in active.drain(..) {
        task.finish(SlideOutcome::Cancelled);
    }
    debug!("Slide scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> SlideScheduler {
        SlideScheduler::start(Duration::from_millis(1)).unwrap()
    }

    fn handle(index: u32) -> VoiceHandle {
        VoiceHandle::new(0, index, 0)
    }

    #[test]
    fn test_slide_reaches_target() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        let slide = sched
            .begin(handle(0), Arc::clone(&control), AttributeKind::Rate, 1.5, Duration::from_millis(30))
            .unwrap();
        assert_eq!(slide.wait(), SlideOutcome::Completed);
        assert_eq!(control.attribute(AttributeKind::Rate), AttributeValue::Float(1.5));
    }

    #[test]
    fn test_zero_duration_is_immediate() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        let slide = sched
            .begin(handle(0), Arc::clone(&control), AttributeKind::Volume, 0.2, Duration::ZERO)
            .unwrap();
        assert_eq!(slide.wait(), SlideOutcome::Completed);
        assert_eq!(control.attribute(AttributeKind::Volume), AttributeValue::Float(0.2));
    }

    #[test]
    fn test_cancel_stops_midway() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        let slide = sched
            .begin(handle(0), Arc::clone(&control), AttributeKind::Pan, 1.0, Duration::from_secs(10))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        slide.cancel();
        assert_eq!(slide.wait(), SlideOutcome::Cancelled);

        let pan = control.attribute(AttributeKind::Pan).as_float().unwrap();
        assert!(pan > 0.0 && pan < 1.0, "pan stopped at {pan}");
    }

    #[test]
    fn test_newer_slide_supersedes() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        let first = sched
            .begin(handle(3), Arc::clone(&control), AttributeKind::Volume, 0.0, Duration::from_secs(10))
            .unwrap();
        let second = sched
            .begin(handle(3), Arc::clone(&control), AttributeKind::Volume, 0.5, Duration::from_millis(10))
            .unwrap();

        assert_eq!(first.wait(), SlideOutcome::Superseded);
        assert_eq!(second.wait(), SlideOutcome::Completed);
        assert_eq!(control.attribute(AttributeKind::Volume), AttributeValue::Float(0.5));
    }

    #[test]
    fn test_other_attribute_runs_alongside() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        let volume = sched
            .begin(handle(1), Arc::clone(&control), AttributeKind::Volume, 0.5, Duration::from_millis(20))
            .unwrap();
        let pan = sched
            .begin(handle(1), Arc::clone(&control), AttributeKind::Pan, -0.5, Duration::from_millis(20))
            .unwrap();
        assert_eq!(volume.wait(), SlideOutcome::Completed);
        assert_eq!(pan.wait(), SlideOutcome::Completed);
    }

    #[test]
    fn test_removed_voice_cancels() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        let slide = sched
            .begin(handle(0), Arc::clone(&control), AttributeKind::Rate, 2.0, Duration::from_secs(10))
            .unwrap();
        control.mark_removed();
        assert_eq!(slide.wait(), SlideOutcome::Cancelled);
    }

    #[test]
    fn test_shutdown_cancels_running() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        let slide = sched
            .begin(handle(0), control, AttributeKind::Rate, 2.0, Duration::from_secs(10))
            .unwrap();
        sched.stop();
        assert_eq!(slide.wait(), SlideOutcome::Cancelled);
    }

    #[test]
    fn test_bool_attributes_rejected() {
        let sched = scheduler();
        let control = Arc::new(VoiceControl::default());
        for kind in [AttributeKind::Looping, AttributeKind::PitchCorrection] {
            let err = sched
                .begin(handle(0), Arc::clone(&control), kind, 1.0, Duration::from_millis(5))
                .err();
            assert!(matches!(err, Some(AudioError::InvalidArgument(_))));
        }
    }
}
