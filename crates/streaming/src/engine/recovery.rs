use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::fetch::FetchJob;
use super::media_state::TrackPhase;
use super::{duration_from_secs, Inner};
use crate::backoff::Backoff;
use crate::error::{ErrorCategory, Severity, StreamingError};
use crate::events::EngineEvent;
use crate::media::ContentType;
use crate::sink::StreamsByType;

/// Seconds to wait after shrinking the buffering goal before retrying, so
/// the playhead can free some room.
const QUOTA_RETRY_DELAY: f64 = 4.0;

enum QuotaAction {
    /// Another track is already recovering.
    Wait,
    Disabled,
    Reduced { scale: f64 },
    Fatal,
}

impl Inner {
    /// Classify a failed fetch-and-append and recover from it.
    pub(super) async fn handle_fetch_error(self: &Arc<Self>, job: &FetchJob, error: StreamingError) {
        let content_type = job.content_type;
        let ignore_text = {
            let state = self.state.lock();
            if state.destroyed || !state.media_states.contains_key(&content_type) {
                return;
            }
            state.config.ignore_text_stream_failures
        };

        if error.is_aborted() {
            debug!(content_type = %content_type, "Fetch aborted, rescheduling");
            {
                let mut state = self.state.lock();
                if let Some(ms) = state.media_states.get_mut(&content_type) {
                    ms.phase = TrackPhase::Idle;
                    ms.operation = None;
                    ms.cancel_update();
                }
            }
            self.finish_update(content_type).await;
            return;
        }

        if content_type == ContentType::Text && ignore_text {
            warn!(error = %error, "Text stream failed, dropping text track");
            let mut state = self.state.lock();
            if let Some(mut ms) = state.media_states.remove(&ContentType::Text) {
                ms.cancel_update();
                Self::take_operation(&mut ms);
            }
            return;
        }

        if matches!(error, StreamingError::QuotaExceeded { .. }) {
            self.handle_quota_exceeded(content_type, error).await;
            return;
        }
        if matches!(error, StreamingError::MediaSourceOperationFailed { .. }) {
            self.set_phase(content_type, TrackPhase::Failed);
            warn!(content_type = %content_type, error = %error, "Sink operation failed, attempting recovery");
            if self.reset_media_source(false, true).await {
                self.player.on_event(EngineEvent::MediaSourceRecovered);
                return;
            }
        }

        warn!(
            content_type = %content_type,
            start = job.reference.start_time(),
            error = %error,
            "Segment fetch failed"
        );
        {
            let mut state = self.state.lock();
            if let Some(ms) = state.media_states.get_mut(&content_type) {
                ms.phase = TrackPhase::Failed;
                if error.category() == ErrorCategory::Network {
                    if let Some(prefetch) = &ms.segment_prefetch {
                        prefetch.remove_reference(&job.reference);
                    }
                }
            }
        }
        self.handle_streaming_error(content_type, error).await;
    }

    /// The shared failure path: pace, try to disable the stream, then
    /// report.
    pub(super) async fn handle_streaming_error(self: &Arc<Self>, content_type: ContentType, error: StreamingError) {
        if matches!(error, StreamingError::StreamingNotAllowed) {
            let mut state = self.state.lock();
            if let Some(ms) = state.media_states.get_mut(&content_type) {
                ms.phase = TrackPhase::Idle;
                ms.last_segment_reference = None;
            }
            self.schedule_update(&mut state, content_type, 0.0);
            return;
        }

        self.set_phase(content_type, TrackPhase::Failed);
        // Auto-reset backoff; only paces, never fails.
        {
            let mut backoff = self.failure_backoff.lock().await;
            let pending = self.state.lock().pending_failure_retry.take();
            if let Some(params) = pending {
                debug!(max_attempts = params.max_attempts, "Applying new failure pacing parameters");
                *backoff = Backoff::new(&params, true);
            }
            if let Err(error) = backoff.attempt().await {
                debug!(error = %error, "Failure backoff exhausted");
            }
        }

        let (stream, max_disabled_time, failure_callback) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.destroyed {
                return;
            }
            let is_network = error.category() == ErrorCategory::Network
                && !matches!(error, StreamingError::Timeout { .. });
            let in_trick_play = state
                .media_states
                .get(&content_type)
                .is_some_and(|ms| ms.restore_stream_after_trick_play.is_some());
            if is_network && in_trick_play {
                debug!(content_type = %content_type, "Trick play stream failed, leaving trick play");
                self.set_trick_play(state, false);
                return;
            }
            let stream = state
                .media_states
                .get(&content_type)
                .filter(|_| is_network)
                .map(|ms| Arc::clone(&ms.stream));
            (
                stream,
                disabled_time(state.config.max_disabled_time, &error),
                state.config.failure_callback.clone(),
            )
        };

        let mut severity = Severity::Critical;
        if let Some(stream) = stream {
            if self.player.disable_stream(&stream, max_disabled_time) {
                info!(stream_id = stream.id(), max_disabled_time, "Disabled failing stream");
                severity = Severity::Recoverable;
            }
        }

        if severity == Severity::Critical {
            error!(content_type = %content_type, error = %error, "Streaming failure");
        }
        let handled = self.player.on_error(&error, severity);
        if !handled {
            if let Some(callback) = failure_callback {
                callback.call(&error);
            }
        }
    }

    /// The sink ran out of room: shrink the buffering goal step by step
    /// and retry, or fail once the schedule is exhausted.
    async fn handle_quota_exceeded(self: &Arc<Self>, content_type: ContentType, error: StreamingError) {
        self.metrics.record_quota_exceeded();

        let (stream, max_disabled_time, waiting) = {
            let mut state = self.state.lock();
            let waiting = state
                .media_states
                .iter()
                .any(|(ct, ms)| *ct != content_type && ms.recovering);
            let Some(ms) = state.media_states.get_mut(&content_type) else {
                return;
            };
            ms.phase = TrackPhase::Idle;
            let stream = Arc::clone(&ms.stream);
            (stream, disabled_time(state.config.max_disabled_time, &error), waiting)
        };

        let action = if waiting {
            QuotaAction::Wait
        } else if self.player.disable_stream(&stream, max_disabled_time) {
            QuotaAction::Disabled
        } else {
            let mut state = self.state.lock();
            match reduced_buffering_scale(state.buffering_scale) {
                Some(scale) => {
                    state.buffering_scale = scale;
                    QuotaAction::Reduced { scale }
                }
                None => QuotaAction::Fatal,
            }
        };

        match action {
            QuotaAction::Wait => {
                debug!(content_type = %content_type, "Quota exceeded while another track recovers");
            }
            QuotaAction::Disabled => {
                info!(stream_id = stream.id(), "Disabled stream after quota exceeded");
                return;
            }
            QuotaAction::Fatal => {
                error!(content_type = %content_type, "Quota exceeded with minimal buffering goal");
                {
                    let mut state = self.state.lock();
                    state.fatal_error = true;
                    if let Some(ms) = state.media_states.get_mut(&content_type) {
                        ms.phase = TrackPhase::Failed;
                    }
                }
                self.player.on_error(&error, Severity::Critical);
                return;
            }
            QuotaAction::Reduced { scale } => {
                warn!(content_type = %content_type, scale, "Quota exceeded, reducing buffering goal");
                if let Some(ms) = self.state.lock().media_states.get_mut(&content_type) {
                    ms.recovering = true;
                }
                self.player
                    .on_event(EngineEvent::BufferingGoalReduced { content_type, scale });
                let presentation_time = self.player.presentation_time();
                if let Err(error) = self.evict(content_type, presentation_time).await {
                    warn!(content_type = %content_type, error = %error, "Eviction after quota failed");
                }
            }
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        if let Some(ms) = state.media_states.get_mut(&content_type) {
            ms.cancel_update();
        }
        self.schedule_update(&mut state, content_type, QUOTA_RETRY_DELAY);
    }

    pub(super) fn retry(self: &Arc<Self>, delay_seconds: f64) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed || state.fatal_error {
            return false;
        }
        let failed: Vec<ContentType> = state
            .media_states
            .iter()
            .filter(|(_, ms)| ms.has_error() && ms.update_timer.is_none())
            .map(|(ct, _)| *ct)
            .collect();
        for content_type in failed {
            debug!(content_type = %content_type, delay_seconds, "Retrying failed track");
            if let Some(ms) = state.media_states.get_mut(&content_type) {
                ms.phase = TrackPhase::Idle;
            }
            self.schedule_update(state, content_type, delay_seconds);
        }
        true
    }

    pub(super) async fn reset_media_source(self: &Arc<Self>, force: bool, clear_buffer: bool) -> bool {
        let (operations, streams) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.destroyed {
                return false;
            }
            if !force {
                let min_gap = duration_from_secs(state.config.min_time_between_recoveries);
                let too_soon = state
                    .last_media_source_reset
                    .is_some_and(|last| last.elapsed() < min_gap);
                if !state.config.allow_media_source_recoveries || too_soon {
                    debug!(too_soon, "Media source reset refused");
                    return false;
                }
                state.last_media_source_reset = Some(Instant::now());
            }

            let mut operations = Vec::new();
            for content_type in [ContentType::Audio, ContentType::Video] {
                let Some(ms) = state.media_states.get_mut(&content_type) else {
                    continue;
                };
                ms.forget_sink_parameters();
                operations.extend(Self::take_operation(ms));
                if clear_buffer {
                    self.force_clear_buffer(state, content_type);
                }
            }

            let mut streams = StreamsByType::new();
            if let Some(variant) = &state.current_variant {
                if let Some(audio) = &variant.audio {
                    streams.insert(ContentType::Audio, Arc::clone(audio));
                }
                if let Some(video) = &variant.video {
                    streams.insert(ContentType::Video, Arc::clone(video));
                }
            }
            (operations, streams)
        };

        for operation in operations {
            operation.abort_and_wait().await;
        }
        info!(tracks = streams.len(), "Resetting media source");
        if let Err(error) = self.sink.reset(&streams).await {
            warn!(error = %error, "Media source reset failed");
            return false;
        }
        self.metrics.record_media_source_reset();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for content_type in [ContentType::Video, ContentType::Audio] {
            let idle = state.media_states.get(&content_type).is_some_and(|ms| {
                matches!(ms.phase, TrackPhase::Idle | TrackPhase::Failed) && ms.update_timer.is_none()
            });
            if idle {
                if let Some(ms) = state.media_states.get_mut(&content_type) {
                    ms.phase = TrackPhase::Idle;
                }
                self.schedule_update(state, content_type, 0.0);
            }
        }
        true
    }
}

/// How long to disable a failing stream. Gaps are skipped for a second
/// even when disabling is turned off.
fn disabled_time(max_disabled_time: f64, error: &StreamingError) -> f64 {
    if max_disabled_time == 0.0 && matches!(error, StreamingError::SegmentMissing) {
        return 1.0;
    }
    max_disabled_time
}

/// Step the buffering goal scale down: 80, 60, 40, 20, 16, 12, 8, 4 percent,
/// then give up. Steps are taken in whole percents so they never drift.
fn reduced_buffering_scale(scale: f64) -> Option<f64> {
    let before = (scale * 100.0).round() as i64;
    let after = if before > 20 {
        before - 20
    } else if before > 4 {
        before - 4
    } else {
        return None;
    };
    Some(after as f64 / 100.0)
}
