use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::media_state::{MediaState, TrackPhase};
use super::{EngineState, Inner, LIVE_SINK_DURATION};
use crate::media::{ContentType, Stream, same_init_segment};

enum ClearStep {
    Run { flush: bool, safe_margin: f64 },
    Done,
}

impl Inner {
    /// Point the `stream`'s content type at `stream`.
    pub(super) fn switch_internal(
        self: &Arc<Self>,
        state: &mut EngineState,
        stream: Arc<Stream>,
        clear_buffer: bool,
        safe_margin: f64,
        force: bool,
        adaptation: bool,
    ) {
        let content_type = stream.content_type();
        if content_type == ContentType::Text && !state.media_states.contains_key(&ContentType::Text) {
            self.load_new_text_stream(state, stream);
            return;
        }
        let Some(ms) = state.media_states.get_mut(&content_type) else {
            return;
        };

        let mut stream = stream;
        if ms.restore_stream_after_trick_play.is_some() {
            debug!(stream_id = stream.id(), "Switch during trick play");
            match stream.trick_mode_video().cloned() {
                Some(trick) => {
                    ms.restore_stream_after_trick_play = Some(stream);
                    stream = trick;
                }
                None => ms.restore_stream_after_trick_play = None,
            }
        }

        if Stream::same(&ms.stream, &stream) && !force {
            trace!(track = %ms.tag(), "Already on requested stream");
            return;
        }
        debug!(track = %ms.tag(), to = stream.id(), clear_buffer, adaptation, "Switching stream");

        let old = Arc::clone(&ms.stream);
        let old_in_map = state.in_audio_prefetch_map(&old);
        let new_in_map = state.in_audio_prefetch_map(&stream);

        // The cross-language audio prefetchers stay with their streams.
        let prefetch = if new_in_map {
            state
                .audio_prefetch_map
                .get(&stream.id())
                .map(|(_, prefetch)| Arc::clone(prefetch))
        } else {
            let current = state
                .media_states
                .get(&content_type)
                .and_then(|ms| ms.segment_prefetch.clone());
            match current {
                Some(current) if !old_in_map => {
                    current.switch_stream(Arc::clone(&stream));
                    Some(current)
                }
                _ => {
                    if let Some(ms) = state.media_states.get_mut(&content_type) {
                        ms.segment_prefetch = None;
                    }
                    self.create_segment_prefetch(state, &stream)
                }
            }
        };

        let Some(ms) = state.media_states.get_mut(&content_type) else {
            return;
        };
        ms.segment_prefetch = prefetch;
        if content_type == ContentType::Text {
            ms.reinit_text = true;
        }

        if !old_in_map && !Stream::same(&old, &stream) {
            if ms.phase.is_performing_update() {
                ms.deferred_close.push(old);
            } else {
                old.close_segment_index();
            }
        }

        ms.stream = stream;
        ms.segment_iterator = None;
        ms.adaptation = adaptation;

        if clear_buffer {
            ms.request_clear(true, safe_margin);
            if ms.can_clear_now() {
                ms.cancel_update();
                self.spawn_clear_buffer(content_type);
            }
        } else if !ms.phase.is_performing_update()
            && ms.phase != TrackPhase::ClearingBuffer
            && ms.update_timer.is_none()
        {
            self.schedule_update(state, content_type, 0.0);
        }

        let has_operation = state
            .media_states
            .get(&content_type)
            .is_some_and(|ms| ms.operation.is_some());
        if has_operation {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.make_abort_decision(content_type).await });
        }
    }

    /// Load a text stream when no text track exists yet.
    fn load_new_text_stream(self: &Arc<Self>, state: &mut EngineState, stream: Arc<Stream>) {
        state.text_sequence_id += 1;
        let sequence_id = state.text_sequence_id;
        debug!(stream_id = stream.id(), sequence_id, "Loading text stream");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = inner.sink.clear(ContentType::Text).await {
                warn!(error = %error, "Failed to clear text buffer");
            }
            if let Err(error) = inner.sink.reinit_text(&stream, inner.manifest.sequence_mode).await {
                warn!(error = %error, "Failed to reinitialise text buffer");
                return;
            }

            let mut state = inner.state.lock();
            let wanted = inner.player.is_text_visible() || state.config.always_stream_text;
            let current = state
                .current_text_stream
                .as_ref()
                .is_some_and(|current| Stream::same(current, &stream));
            if state.destroyed
                || !wanted
                || !current
                || state.text_sequence_id != sequence_id
                || state.media_states.contains_key(&ContentType::Text)
            {
                debug!(stream_id = stream.id(), "Text load superseded or not needed");
                return;
            }
            let prefetch = inner.create_segment_prefetch(&state, &stream);
            state
                .media_states
                .insert(ContentType::Text, MediaState::new(stream, prefetch));
            inner.schedule_update(&mut state, ContentType::Text, 0.0);
        });
    }

    pub(super) fn unload_text_stream(&self) {
        let mut state = self.state.lock();
        state.text_sequence_id += 1;
        state.current_text_stream = None;
        if let Some(mut ms) = state.media_states.remove(&ContentType::Text) {
            debug!(track = %ms.tag(), "Unloading text stream");
            ms.cancel_update();
            Self::take_operation(&mut ms);
        }
    }

    /// Decide whether the in-flight fetch should give way to the stream
    /// just switched to.
    async fn make_abort_decision(self: &Arc<Self>, content_type: ContentType) {
        let (stream, operation) = {
            let state = self.state.lock();
            let Some(ms) = state.media_states.get(&content_type) else {
                return;
            };
            let Some(operation) = ms.operation.clone() else {
                return;
            };
            (Arc::clone(&ms.stream), operation)
        };
        if let Err(error) = stream.create_segment_index().await {
            warn!(stream_id = stream.id(), error = %error, "Failed to index stream for abort decision");
            return;
        }

        let state = self.state.lock();
        let Some(ms) = state.media_states.get(&content_type) else {
            return;
        };
        let unchanged = Stream::same(&ms.stream, &stream)
            && ms
                .operation
                .as_ref()
                .is_some_and(|op| Arc::ptr_eq(op.progress(), operation.progress()));
        if !unchanged {
            return;
        }

        let presentation_time = self.player.presentation_time();
        let reverse = self.player.playback_rate() < 0.0;
        let time_needed = ms.time_needed(presentation_time, reverse);
        let Some(index) = stream.segment_index() else {
            return;
        };
        let Some(reference) = index.find(time_needed).and_then(|position| index.get(position)) else {
            return;
        };
        let Some(mut size) = reference
            .size()
            .map(|size| size as f64)
            .or_else(|| stream.bandwidth().map(|bw| reference.duration() * bw as f64 / 8.0))
            .filter(|size| *size > 0.0)
        else {
            return;
        };
        if let Some(init) = reference.init_segment() {
            if !same_init_segment(Some(init), ms.last_init_segment_reference.as_ref()) {
                size += init.size().unwrap_or(0) as f64;
            }
        }

        let buffered_ahead = self.sink.buffer_end(content_type).unwrap_or(0.0) - presentation_time;
        let safety = self.manifest.min_buffer_time.max(state.config.rebuffering_goal);
        if should_abort(
            size,
            self.player.bandwidth_estimate(),
            buffered_ahead - safety,
            operation.bytes_remaining(),
        ) {
            debug!(track = %ms.tag(), new_segment_bytes = size, "Aborting in-flight fetch for switch");
            operation.abort();
        }
    }

    /// Drop everything `content_type` has buffered, even mid-update.
    pub(super) fn force_clear_buffer(self: &Arc<Self>, state: &mut EngineState, content_type: ContentType) {
        let Some(ms) = state.media_states.get_mut(&content_type) else {
            return;
        };
        debug!(track = %ms.tag(), "Forcing buffer clear");
        ms.last_segment_reference = None;
        ms.last_init_segment_reference = None;
        ms.segment_iterator = None;
        ms.cancel_update();
        ms.request_clear(false, 0.0);
        if ms.can_clear_now() {
            self.spawn_clear_buffer(content_type);
        }
    }

    fn spawn_clear_buffer(self: &Arc<Self>, content_type: ContentType) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.clear_buffer(content_type).await });
    }

    /// Perform queued buffer clears of `content_type`, then resume updates.
    ///
    /// A clear with a safe margin keeps `safe_margin` seconds ahead of the
    /// playhead; without one the whole buffer goes.
    pub(super) async fn clear_buffer(self: &Arc<Self>, content_type: ContentType) {
        loop {
            let step = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.destroyed {
                    return;
                }
                let Some(ms) = state.media_states.get_mut(&content_type) else {
                    return;
                };
                if !ms.can_clear_now() {
                    return;
                }
                match ms.pending_clear.take() {
                    Some(clear) => {
                        ms.cancel_update();
                        ms.phase = TrackPhase::ClearingBuffer;
                        ms.last_segment_reference = None;
                        ms.segment_iterator = None;
                        if clear.safe_margin == 0.0 {
                            ms.last_init_segment_reference = None;
                        }
                        if ms.end_of_stream {
                            ms.end_of_stream = false;
                            state.end_of_stream_signalled = false;
                        }
                        ClearStep::Run {
                            flush: clear.flush,
                            safe_margin: clear.safe_margin,
                        }
                    }
                    None => {
                        if ms.update_timer.is_none() {
                            self.schedule_update(state, content_type, 0.0);
                        }
                        ClearStep::Done
                    }
                }
            };
            let ClearStep::Run { flush, safe_margin } = step else {
                return;
            };

            debug!(content_type = %content_type, flush, safe_margin, "Clearing buffer");
            let result = if safe_margin == 0.0 {
                self.sink.clear(content_type).await
            } else {
                let start = self.player.presentation_time() + safe_margin;
                let duration = self.manifest.timeline.duration();
                let end = if duration.is_finite() { duration } else { LIVE_SINK_DURATION };
                if start < end {
                    self.sink.remove(content_type, start, end).await
                } else {
                    Ok(())
                }
            };
            let result = match result {
                Ok(()) if flush => self.sink.flush(content_type).await,
                other => other,
            };

            {
                let mut state = self.state.lock();
                if let Some(ms) = state.media_states.get_mut(&content_type) {
                    if ms.phase == TrackPhase::ClearingBuffer {
                        ms.phase = TrackPhase::Idle;
                    }
                }
            }
            if let Err(error) = result {
                warn!(content_type = %content_type, error = %error, "Buffer clear failed");
                self.handle_streaming_error(content_type, error).await;
                return;
            }
        }
    }

    /// React to the playhead having jumped.
    pub(super) fn seeked(self: &Arc<Self>) {
        let presentation_time = self.player.presentation_time();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return;
        }
        let types: Vec<ContentType> = state.media_states.keys().copied().collect();
        let mut cleared = false;
        for content_type in types {
            let buffered = self.sink.is_buffered(content_type, presentation_time);
            let something_buffered = self.sink.buffer_end(content_type).is_some();
            let Some(ms) = state.media_states.get_mut(&content_type) else {
                continue;
            };

            // An exhausted iterator restarts from the new position too.
            let outside = ms.segment_iterator.as_ref().is_some_and(|iterator| {
                iterator.current().is_none_or(|current| {
                    presentation_time < current.start_time() || presentation_time > current.end_time()
                })
            });
            if outside {
                ms.segment_iterator = None;
            }
            if buffered {
                continue;
            }

            if let Some(prefetch) = &ms.segment_prefetch {
                prefetch.reset_position();
            }
            ms.last_segment_reference = None;
            ms.last_init_segment_reference = None;
            ms.segment_iterator = None;
            let must_clear = something_buffered || ms.phase.is_performing_update();
            if Self::take_operation(ms).is_some() {
                trace!(content_type = %content_type, "Aborted in-flight fetch for seek");
            }
            ms.seeked = true;
            if content_type == ContentType::Text {
                self.sink.reset_caption_parser();
            }
            if content_type == ContentType::Audio {
                for (_, prefetch) in state.audio_prefetch_map.values() {
                    prefetch.reset_position();
                }
            }
            if must_clear {
                self.force_clear_buffer(state, content_type);
                cleared = true;
            }
        }
        if !cleared {
            trace!(presentation_time, "Seek within buffered range");
        }
    }

    pub(super) fn set_trick_play(self: &Arc<Self>, state: &mut EngineState, on: bool) {
        self.update_segment_iterator_reverse(state);
        let Some(ms) = state.media_states.get_mut(&ContentType::Video) else {
            return;
        };
        let stream = Arc::clone(&ms.stream);
        if on {
            let Some(trick) = stream.trick_mode_video().cloned() else {
                return;
            };
            if ms.restore_stream_after_trick_play.is_some() {
                return;
            }
            debug!(stream_id = trick.id(), "Engaging trick play");
            self.switch_internal(state, trick, false, 0.0, false, false);
            if let Some(ms) = state.media_states.get_mut(&ContentType::Video) {
                ms.restore_stream_after_trick_play = Some(stream);
            }
        } else {
            let Some(normal) = ms.restore_stream_after_trick_play.take() else {
                return;
            };
            debug!(stream_id = normal.id(), "Leaving trick play");
            self.switch_internal(state, normal, true, 0.0, false, false);
        }
    }

    pub(super) fn update_segment_iterator_reverse(&self, state: &mut EngineState) {
        let reverse = self.player.playback_rate() < 0.0;
        for ms in state.media_states.values_mut() {
            if let Some(iterator) = ms.segment_iterator.as_mut() {
                iterator.set_reverse(reverse);
            }
            if let Some(prefetch) = &ms.segment_prefetch {
                prefetch.set_reverse(reverse);
            }
        }
        for (_, prefetch) in state.audio_prefetch_map.values() {
            prefetch.set_reverse(reverse);
        }
    }
}

/// Whether an in-flight fetch should be abandoned for a segment of
/// `new_segment_bytes`.
///
/// `bandwidth_estimate` is in bits per second and `safe_buffered_ahead` in
/// seconds.
fn should_abort(
    new_segment_bytes: f64,
    bandwidth_estimate: f64,
    safe_buffered_ahead: f64,
    bytes_remaining: Option<u64>,
) -> bool {
    let time_to_fetch = new_segment_bytes * 8.0 / bandwidth_estimate;
    if time_to_fetch < safe_buffered_ahead {
        return true;
    }
    bytes_remaining.is_some_and(|remaining| (remaining as f64) < new_segment_bytes)
}
