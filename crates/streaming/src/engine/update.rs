use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::fetch::FetchJob;
use super::media_state::{MediaState, TrackPhase, UpdateTimer};
use super::{duration_from_secs, is_embedded_captions, EngineState, Inner, MAX_RUN_AHEAD_SEGMENTS};
use crate::error::StreamingError;
use crate::media::{ContentType, SegmentIndex, SegmentReference, Stream};

/// Two segment start times closer than this are the same segment.
const SAME_SEGMENT_TOLERANCE: f64 = 0.001;

enum Tick {
    Clear,
    Update { stream: Arc<Stream>, deferred_close: Vec<Arc<Stream>> },
}

enum TickResult {
    Done { end_of_stream: bool },
    Failed(StreamingError),
}

impl Inner {
    /// Arm the update timer of `content_type`, replacing any armed one.
    pub(super) fn schedule_update(self: &Arc<Self>, state: &mut EngineState, content_type: ContentType, delay: f64) {
        let id = state.next_timer_id;
        state.next_timer_id += 1;
        let Some(ms) = state.media_states.get_mut(&content_type) else {
            return;
        };
        ms.cancel_update();

        trace!(track = %ms.tag(), delay, "Scheduling update");
        let delay = duration_from_secs(if delay.is_finite() { delay } else { 0.0 });
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.on_update(content_type, id).await;
        });
        ms.update_timer = Some(UpdateTimer {
            id,
            handle: handle.abort_handle(),
        });
    }

    /// One firing of a track's update timer.
    async fn on_update(self: &Arc<Self>, content_type: ContentType, timer_id: u64) {
        let tick = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let Some(ms) = state.media_states.get_mut(&content_type) else {
                return;
            };
            // Disarm under the lock; from here on nobody aborts this task.
            if !ms.update_timer.as_ref().is_some_and(|timer| timer.id == timer_id) {
                return;
            }
            ms.update_timer = None;

            if ms.phase.is_performing_update() || ms.phase == TrackPhase::ClearingBuffer {
                debug!(track = %ms.tag(), phase = ?ms.phase, "Update fired while busy");
                return;
            }
            if ms.pending_clear.is_some() {
                Tick::Clear
            } else {
                Tick::Update {
                    stream: Arc::clone(&ms.stream),
                    deferred_close: std::mem::take(&mut ms.deferred_close),
                }
            }
        };

        let (stream, deferred_close) = match tick {
            Tick::Clear => {
                debug!(content_type = %content_type, "Clearing buffer instead of updating");
                self.clear_buffer(content_type).await;
                return;
            }
            Tick::Update { stream, deferred_close } => (stream, deferred_close),
        };

        for old in deferred_close {
            debug!(stream_id = old.id(), "Closing deferred segment index");
            old.close_segment_index();
        }

        if let Err(error) = stream.create_segment_index().await {
            self.handle_streaming_error(content_type, error).await;
            return;
        }

        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.destroyed {
                return;
            }
            let Some(ms) = state.media_states.get(&content_type) else {
                return;
            };
            let idle = matches!(ms.phase, TrackPhase::Idle | TrackPhase::Failed);
            if !Stream::same(&ms.stream, &stream) {
                // Switched while the index was being created.
                if idle && ms.update_timer.is_none() {
                    self.schedule_update(state, content_type, 0.0);
                }
                return;
            }
            if !idle || ms.update_timer.is_some() {
                return;
            }

            match self.update(state, content_type) {
                Ok(delay) => {
                    if let Some(delay) = delay {
                        self.schedule_update(state, content_type, delay);
                        if let Some(ms) = state.media_states.get_mut(&content_type) {
                            if ms.phase == TrackPhase::Failed {
                                ms.phase = TrackPhase::Idle;
                            }
                        }
                    }
                    let converged = state.startup_complete
                        && !state.media_states.is_empty()
                        && state.media_states.values().all(|ms| ms.end_of_stream);
                    let end_of_stream = converged && !state.end_of_stream_signalled;
                    if end_of_stream {
                        state.end_of_stream_signalled = true;
                    }
                    TickResult::Done { end_of_stream }
                }
                Err(error) => TickResult::Failed(error),
            }
        };

        match result {
            TickResult::Done { end_of_stream: true } => self.signal_end_of_stream().await,
            TickResult::Done { end_of_stream: false } => {}
            TickResult::Failed(error) => self.handle_streaming_error(content_type, error).await,
        }
    }

    /// Decide what `content_type` does next. Returns the delay before the
    /// next tick, or `None` when a fetch was started or the track reached
    /// the end of the presentation.
    fn update(
        self: &Arc<Self>,
        state: &mut EngineState,
        content_type: ContentType,
    ) -> Result<Option<f64>, StreamingError> {
        let rate = self.player.playback_rate();
        let reverse = rate < 0.0;
        let interval = state.config.update_interval_seconds / rate.abs().max(1.0);

        if content_type != ContentType::Text && !self.sink.is_streaming_allowed() {
            trace!(content_type = %content_type, "Sink not accepting data yet");
            return Ok(Some(interval / 2.0));
        }

        let presentation_time = self.player.presentation_time();
        if content_type == ContentType::Audio {
            for (_, prefetch) in state.audio_prefetch_map.values() {
                prefetch.evict(presentation_time, true);
                prefetch.prefetch_segments_by_time(presentation_time, false);
            }
        }

        let in_audio_map = state
            .media_states
            .get(&content_type)
            .is_some_and(|ms| state.in_audio_prefetch_map(&ms.stream));
        let config = &state.config;
        let Some(ms) = state.media_states.get_mut(&content_type) else {
            return Ok(None);
        };

        let time_needed = ms.time_needed(presentation_time, reverse);
        let buffered_ahead = self.sink.buffered_ahead_of(content_type, presentation_time);
        let unscaled_goal = self
            .manifest
            .min_buffer_time
            .max(config.rebuffering_goal)
            .max(config.buffering_goal);
        let scaled_goal = (unscaled_goal * state.buffering_scale).max(1.0);
        trace!(
            track = %ms.tag(),
            presentation_time,
            time_needed,
            buffered_ahead,
            scaled_goal,
            "Update"
        );

        if buffered_ahead >= scaled_goal {
            trace!(track = %ms.tag(), "Buffering goal met");
            return Ok(Some(interval / 2.0));
        }

        let time_until_end = self.manifest.timeline.duration() - time_needed;
        let buffer_end = self.sink.buffer_end(content_type);
        if time_until_end < config.end_of_presentation_epsilon && buffer_end.is_some() {
            debug!(track = %ms.tag(), "Buffered to end of presentation");
            ms.end_of_stream = true;
            return Ok(None);
        }
        if ms.end_of_stream {
            ms.end_of_stream = false;
            state.end_of_stream_signalled = false;
        }

        let index = ms.stream.segment_index().ok_or_else(|| StreamingError::SegmentIndex {
            reason: format!("stream {} has no segment index", ms.stream.id()),
        })?;
        let tolerance = if self.manifest.sequence_mode {
            0.0
        } else {
            config.inaccurate_manifest_tolerance
        };
        let stream_changed = ms.segment_iterator.is_none();
        let Some(reference) =
            segment_reference_needed(ms, &index, presentation_time, buffer_end, reverse, tolerance)
        else {
            trace!(track = %ms.tag(), "No segment available yet");
            return Ok(Some(interval));
        };

        if !reverse {
            let slowest = state
                .media_states
                .values()
                .filter(|other| !is_embedded_captions(&other.stream))
                .filter(|other| !other.segment_iterator.as_ref().is_some_and(|it| it.current().is_none()))
                .map(|other| other.time_needed(presentation_time, reverse))
                .fold(f64::INFINITY, f64::min);
            let max_run_ahead = self.manifest.timeline.max_segment_duration() * MAX_RUN_AHEAD_SEGMENTS;
            if time_needed > slowest + max_run_ahead {
                trace!(content_type = %content_type, time_needed, slowest, "Waiting for other tracks");
                return Ok(Some(interval));
            }
        }

        let Some(ms) = state.media_states.get_mut(&content_type) else {
            return Ok(None);
        };
        if let Some(prefetch) = &ms.segment_prefetch {
            if ms.segment_iterator.is_some() && !in_audio_map {
                prefetch.evict(reference.start_time(), false);
                prefetch.prefetch_segments_by_time(reference.start_time(), false);
            }
        }

        let position = ms
            .segment_iterator
            .as_ref()
            .map_or(0, |iterator| iterator.current_position());
        ms.phase = TrackPhase::Fetching;
        let job = FetchJob {
            content_type,
            stream: Arc::clone(&ms.stream),
            reference,
            position,
            presentation_time,
            stream_changed,
        };
        let inner = Arc::clone(self);
        tokio::spawn(inner.fetch_and_append(job));
        Ok(None)
    }

    /// Signal end of stream, shrinking the timeline to what the sink
    /// actually holds.
    async fn signal_end_of_stream(&self) {
        debug!("All tracks buffered to the end, signalling end of stream");
        if let Err(error) = self.sink.end_of_stream().await {
            warn!(error = %error, "Failed to signal end of stream");
            return;
        }
        let duration = self.sink.duration();
        if duration != 0.0 && duration < self.manifest.timeline.duration() {
            debug!(duration, "Shrinking presentation to buffered duration");
            self.manifest.timeline.set_duration(duration);
        }
    }
}

/// The next segment `ms` needs, positioning its iterator when there is none.
fn segment_reference_needed(
    ms: &mut MediaState,
    index: &Arc<SegmentIndex>,
    presentation_time: f64,
    buffer_end: Option<f64>,
    reverse: bool,
    tolerance: f64,
) -> Option<Arc<SegmentReference>> {
    if let Some(iterator) = ms.segment_iterator.as_mut() {
        // Something from this stream is buffered; continue where we are.
        let mut reference = iterator.current();
        if let (Some(current), Some(last)) = (&reference, &ms.last_segment_reference) {
            if (current.start_time() - last.start_time()).abs() < SAME_SEGMENT_TOLERANCE {
                reference = iterator.next();
            }
        }
        return reference;
    }

    let resume_at = ms
        .last_segment_reference
        .as_ref()
        .map(|last| if reverse { last.start_time() } else { last.end_time() })
        .or(buffer_end);
    if let Some(time) = resume_at {
        // Something is buffered from another stream.
        trace!(track = %ms.tag(), time, "Looking up segment in new stream");
        ms.segment_iterator = index.iterator_for_time(time, false, reverse);
        let reference = ms.segment_iterator.as_mut().and_then(Iterator::next);
        if reference.is_none() {
            debug!(track = %ms.tag(), time, "No segment at buffered end");
        }
        return reference;
    }

    // Nothing buffered: start at the playhead, backing off by the tolerance
    // in case the manifest times drift ahead of the media.
    let mut reference = None;
    if tolerance > 0.0 {
        let lookup_time = (presentation_time - tolerance).max(0.0);
        ms.segment_iterator = index.iterator_for_time(lookup_time, false, reverse);
        reference = ms.segment_iterator.as_mut().and_then(Iterator::next);
    }
    if reference.is_none() {
        ms.segment_iterator = index.iterator_for_time(presentation_time, false, reverse);
        reference = ms.segment_iterator.as_mut().and_then(Iterator::next);
    }
    if reference.is_none() {
        debug!(track = %ms.tag(), presentation_time, "No segment at playhead");
    }
    reference
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StaticSegmentIndex;

    fn track(bounds: &[(f64, f64)]) -> (MediaState, Arc<SegmentIndex>) {
        let references: Vec<_> = bounds
            .iter()
            .enumerate()
            .map(|(i, (start, end))| Arc::new(SegmentReference::new(*start, *end, vec![format!("s{i}")])))
            .collect();
        let index = Arc::new(SegmentIndex::new(references));
        let stream = Stream::builder(1, ContentType::Video, Arc::new(StaticSegmentIndex::default())).build();
        (MediaState::new(stream, None), index)
    }

    #[test]
    fn test_lookup_backs_off_by_tolerance() {
        let (mut ms, index) = track(&[(0.0, 4.0), (4.0, 8.0), (8.0, 12.0)]);
        let reference = segment_reference_needed(&mut ms, &index, 9.0, None, false, 2.0).unwrap();
        assert_eq!(reference.start_time(), 4.0);
    }

    #[test]
    fn test_lookup_without_tolerance_uses_playhead() {
        let (mut ms, index) = track(&[(0.0, 4.0), (4.0, 8.0), (8.0, 12.0)]);
        let reference = segment_reference_needed(&mut ms, &index, 9.0, None, false, 0.0).unwrap();
        assert_eq!(reference.start_time(), 8.0);
    }

    #[test]
    fn test_lookup_resumes_after_last_appended() {
        let (mut ms, index) = track(&[(0.0, 4.0), (4.0, 8.0), (8.0, 12.0)]);
        ms.last_segment_reference = index.get(0).cloned();
        let reference = segment_reference_needed(&mut ms, &index, 0.5, None, false, 2.0).unwrap();
        assert_eq!(reference.start_time(), 4.0);
    }

    #[test]
    fn test_existing_iterator_skips_already_appended() {
        let (mut ms, index) = track(&[(0.0, 4.0), (4.0, 8.0), (8.0, 12.0)]);
        let mut iterator = index.iterator_for_time(0.0, false, false).unwrap();
        iterator.next();
        ms.segment_iterator = Some(iterator);
        ms.last_segment_reference = index.get(0).cloned();
        let reference = segment_reference_needed(&mut ms, &index, 1.0, None, false, 2.0).unwrap();
        assert_eq!(reference.start_time(), 4.0);
    }

    #[test]
    fn test_resume_past_end_finds_nothing() {
        let (mut ms, index) = track(&[(0.0, 4.0), (4.0, 8.0)]);
        ms.last_segment_reference = index.get(1).cloned();
        assert!(segment_reference_needed(&mut ms, &index, 7.0, Some(8.0), false, 0.0).is_none());
    }
}
