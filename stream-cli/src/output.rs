//! File-backed media sink.
//!
//! Every content type is appended to its own file. The file only grows;
//! buffered ranges are modelled separately so eviction and clears behave
//! as they would in a real playback buffer.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use streaming_engine::media::{ContentType, ManifestKind, SegmentReference, Stream};
use streaming_engine::{
    AppendContext, BufferedInfo, MediaSink, StreamProperties, StreamingError, StreamsByType, TimeRanges,
};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Default)]
struct BufferState {
    ranges: BTreeMap<ContentType, TimeRanges>,
    duration: f64,
    bytes_written: u64,
}

pub struct FileSink {
    output_dir: PathBuf,
    base_name: String,
    files: tokio::sync::Mutex<HashMap<ContentType, File>>,
    state: Mutex<BufferState>,
}

impl FileSink {
    pub fn new(output_dir: PathBuf, base_name: String) -> Self {
        Self {
            output_dir,
            base_name,
            files: tokio::sync::Mutex::new(HashMap::new()),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    fn path_for(&self, stream: &Stream) -> PathBuf {
        let extension = match stream.content_type() {
            ContentType::Text => "vtt",
            _ if stream.is_mp4() => "mp4",
            _ => "ts",
        };
        self.output_dir.join(format!(
            "{}_{}.{extension}",
            self.base_name,
            stream.content_type()
        ))
    }

    async fn open(&self, stream: &Stream) -> Result<(), StreamingError> {
        let content_type = stream.content_type();
        let path = self.path_for(stream);
        let file = File::create(&path)
            .await
            .map_err(|e| StreamingError::sink(content_type, format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), content_type = %content_type, "Writing track");
        self.files.lock().await.insert(content_type, file);
        Ok(())
    }
}

#[async_trait]
impl MediaSink for FileSink {
    async fn init(
        &self,
        streams: &StreamsByType,
        _sequence_mode: bool,
        _manifest_kind: ManifestKind,
        _ignore_manifest_timestamps_in_segments_mode: bool,
    ) -> Result<(), StreamingError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| StreamingError::sink(ContentType::Video, e.to_string()))?;
        for stream in streams.values() {
            self.open(stream).await?;
        }
        Ok(())
    }

    async fn reinit_text(&self, stream: &Stream, _sequence_mode: bool) -> Result<(), StreamingError> {
        self.open(stream).await
    }

    async fn set_duration(&self, duration: f64) -> Result<(), StreamingError> {
        debug!(duration, "Duration updated");
        self.state.lock().duration = duration;
        Ok(())
    }

    fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    fn is_streaming_allowed(&self) -> bool {
        true
    }

    fn buffer_start(&self, content_type: ContentType) -> Option<f64> {
        self.state.lock().ranges.get(&content_type)?.start()
    }

    fn buffer_end(&self, content_type: ContentType) -> Option<f64> {
        self.state.lock().ranges.get(&content_type)?.end()
    }

    fn buffered_ahead_of(&self, content_type: ContentType, time: f64) -> f64 {
        self.state
            .lock()
            .ranges
            .get(&content_type)
            .map_or(0.0, |ranges| ranges.ahead_of(time))
    }

    fn is_buffered(&self, content_type: ContentType, time: f64) -> bool {
        self.buffered_ahead_of(content_type, time) > 0.0
    }

    async fn append_buffer(
        &self,
        content_type: ContentType,
        data: Bytes,
        reference: Option<&SegmentReference>,
        _stream: &Stream,
        _context: AppendContext,
    ) -> Result<(), StreamingError> {
        {
            let mut files = self.files.lock().await;
            let file = files
                .get_mut(&content_type)
                .ok_or_else(|| StreamingError::sink(content_type, "track was not initialised"))?;
            file.write_all(&data)
                .await
                .map_err(|e| StreamingError::sink(content_type, e.to_string()))?;
        }
        let mut state = self.state.lock();
        state.bytes_written += data.len() as u64;
        if let Some(reference) = reference {
            state
                .ranges
                .entry(content_type)
                .or_default()
                .add(reference.start_time(), reference.end_time());
        }
        Ok(())
    }

    async fn remove(&self, content_type: ContentType, start: f64, end: f64) -> Result<(), StreamingError> {
        if let Some(ranges) = self.state.lock().ranges.get_mut(&content_type) {
            ranges.remove(start, end);
        }
        Ok(())
    }

    async fn clear(&self, content_type: ContentType) -> Result<(), StreamingError> {
        self.state.lock().ranges.remove(&content_type);
        Ok(())
    }

    async fn flush(&self, content_type: ContentType) -> Result<(), StreamingError> {
        if let Some(file) = self.files.lock().await.get_mut(&content_type) {
            file.flush()
                .await
                .map_err(|e| StreamingError::sink(content_type, e.to_string()))?;
        }
        Ok(())
    }

    async fn end_of_stream(&self) -> Result<(), StreamingError> {
        for (content_type, file) in self.files.lock().await.iter_mut() {
            file.flush()
                .await
                .map_err(|e| StreamingError::sink(*content_type, e.to_string()))?;
        }
        let mut state = self.state.lock();
        let end = state
            .ranges
            .values()
            .filter_map(TimeRanges::end)
            .fold(0.0, f64::max);
        if end > 0.0 {
            state.duration = end;
        }
        info!(duration = state.duration, bytes = state.bytes_written, "End of stream");
        Ok(())
    }

    async fn set_stream_properties(
        &self,
        content_type: ContentType,
        properties: &StreamProperties,
    ) -> Result<(), StreamingError> {
        debug!(
            content_type = %content_type,
            mime_type = %properties.mime_type,
            codecs = %properties.codecs,
            timestamp_offset = properties.timestamp_offset,
            "Stream properties changed"
        );
        Ok(())
    }

    async fn reset(&self, _streams: &StreamsByType) -> Result<(), StreamingError> {
        for file in self.files.lock().await.values_mut() {
            file.flush()
                .await
                .map_err(|e| StreamingError::sink(ContentType::Video, e.to_string()))?;
        }
        self.state.lock().ranges.clear();
        info!("Sink reset");
        Ok(())
    }

    fn buffered_info(&self) -> BufferedInfo {
        self.state
            .lock()
            .ranges
            .iter()
            .map(|(ct, ranges)| (*ct, ranges.as_slice().to_vec()))
            .collect()
    }
}
