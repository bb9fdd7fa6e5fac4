// src/engine.rs
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::drivers::{
    ChannelStore, FrameDecoder, FrameSource, Schema, SignalDatabase, SlcanSource, SyntheticSource,
};
use crate::recorder::{open_replay, FrameRecorder};
use crate::types::StreamEvent;

/// Back-off when the source has nothing ready.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Handle to the producer thread. Dropping it stops ingestion.
pub struct IngestHandle<S: Schema> {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<FrameDecoder<S>>>,
}

impl<S: Schema> IngestHandle<S> {
    /// Frames pulled from the source so far, decodable or not.
    pub fn frames_seen(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Asks the loop to exit after the current frame, waits for it and
    /// hands the decoder back.
    pub fn stop(mut self) -> Option<FrameDecoder<S>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<FrameDecoder<S>> {
        self.stop.store(true, Ordering::Relaxed);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(decoder) => Some(decoder),
            Err(_) => {
                log::error!("ingest thread panicked");
                None
            }
        }
    }
}

impl<S: Schema> Drop for IngestHandle<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the single producer context: frames are recorded (if asked) and
/// decoded strictly one at a time, in arrival order.
///
/// A fatal transport error is reported through the decoder and ends the
/// loop; reconnecting is up to the caller.
pub fn spawn_ingest<F, S>(
    mut source: F,
    mut decoder: FrameDecoder<S>,
    mut recorder: Option<FrameRecorder>,
    events: Sender<StreamEvent>,
) -> IngestHandle<S>
where
    F: FrameSource + Send + 'static,
    S: Schema + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let frames = Arc::new(AtomicU64::new(0));
    let thread = {
        let stop = Arc::clone(&stop);
        let frames = Arc::clone(&frames);
        thread::spawn(move || {
            log::info!("ingest started");
            while !stop.load(Ordering::Relaxed) {
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        let failed = recorder.as_mut().and_then(|r| r.record(&frame).err());
                        if let Some(err) = failed {
                            log::error!("recording stopped: {err}");
                            recorder = None;
                        }
                        decoder.deliver(&frame);
                        frames.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => thread::sleep(IDLE_POLL),
                    Err(err) => {
                        let fatal = err.is_fatal();
                        decoder.report_error(err);
                        if fatal {
                            break;
                        }
                    }
                }
            }
            if let Some(recorder) = recorder {
                let recorded = recorder.frames();
                match recorder.finish() {
                    Ok(_) => log::info!("recording closed after {recorded} frames"),
                    Err(err) => log::error!("failed to flush recording: {err}"),
                }
            }
            log::info!(
                "ingest stopped after {} frames",
                frames.load(Ordering::Relaxed)
            );
            events.send(StreamEvent::Stopped).ok();
            decoder
        })
    };
    IngestHandle {
        stop,
        frames,
        thread: Some(thread),
    }
}

/// Where frames come from.
#[derive(Clone, Debug, PartialEq)]
pub enum Transport {
    Slcan {
        port: String,
        bitrate: u32,
    },
    Synthetic {
        max_messages: usize,
        interval: Duration,
        noise: f64,
    },
    /// Plays back a frame recording.
    Replay { path: PathBuf },
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub schema_path: PathBuf,
    pub transport: Transport,
    /// Directory for raw-frame recordings; `None` disables recording.
    pub record_dir: Option<PathBuf>,
}

/// Start/stop lifecycle around one store.
///
/// `start` stops any running producer, reloads the schema, clears the store
/// and spawns a fresh producer; the store is only cleared while no producer
/// is running. The decoder survives restarts and is re-armed with
/// `load_schema`.
pub struct Session {
    settings: SessionSettings,
    store: Arc<ChannelStore>,
    events: Sender<StreamEvent>,
    decoder: Option<FrameDecoder<SignalDatabase>>,
    ingest: Option<IngestHandle<SignalDatabase>>,
}

impl Session {
    pub fn new(settings: SessionSettings, store: Arc<ChannelStore>, events: Sender<StreamEvent>) -> Self {
        Self {
            settings,
            store,
            events,
            decoder: None,
            ingest: None,
        }
    }

    /// Recording applies from the next `start`.
    pub fn set_record_dir(&mut self, dir: Option<PathBuf>) {
        self.settings.record_dir = dir;
    }

    /// True while a producer thread is alive.
    pub fn is_running(&self) -> bool {
        self.ingest.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn frames_seen(&self) -> u64 {
        self.ingest.as_ref().map_or(0, IngestHandle::frames_seen)
    }

    pub fn start(&mut self) -> Result<()> {
        self.stop();
        let path = &self.settings.schema_path;
        let db = SignalDatabase::load(path)
            .with_context(|| format!("failed to load schema {}", path.display()))?;
        match self.settings.transport.clone() {
            Transport::Slcan { port, bitrate } => {
                let source = SlcanSource::open(&port, bitrate)
                    .with_context(|| format!("failed to open adapter on {port}"))?;
                self.launch(source, db)
            }
            Transport::Synthetic {
                max_messages,
                interval,
                noise,
            } => {
                let source = SyntheticSource::new(&db, max_messages, interval).with_noise(noise);
                self.launch(source, db)
            }
            Transport::Replay { path } => {
                let source = open_replay(&path)
                    .with_context(|| format!("failed to read recording {}", path.display()))?;
                self.launch(source, db)
            }
        }
    }

    fn launch<F>(&mut self, source: F, db: SignalDatabase) -> Result<()>
    where
        F: FrameSource + Send + 'static,
    {
        let recorder = match &self.settings.record_dir {
            Some(dir) => Some(
                FrameRecorder::create(dir)
                    .with_context(|| format!("failed to create recording in {}", dir.display()))?
                    .0,
            ),
            None => None,
        };
        // No producer is running here.
        self.store.clear();
        let decoder = match self.decoder.take() {
            Some(mut decoder) => {
                decoder.load_schema(db);
                decoder
            }
            None => FrameDecoder::new(db, Arc::clone(&self.store))
                .with_discovery(self.events.clone())
                .with_error_sink(self.events.clone()),
        };
        self.ingest = Some(spawn_ingest(source, decoder, recorder, self.events.clone()));
        log::info!("session started");
        Ok(())
    }

    /// Stops the producer and keeps its decoder for the next start.
    pub fn stop(&mut self) {
        if let Some(handle) = self.ingest.take() {
            self.decoder = handle.stop();
            log::info!("session stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::schema::tests::SAMPLE_DB;
    use crate::drivers::{ManualSource, TransportError};
    use crate::types::RawFrame;
    use std::fs;
    use std::sync::mpsc::channel;
    use std::time::Instant;

    fn schema() -> SignalDatabase {
        SignalDatabase::from_json(
            r#"{"messages":[{"name":"M","id":16,"length":1,"signals":[
                {"name":"Level","start_bit":0,"length":8}]}]}"#,
        )
        .unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("canscope_{tag}_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn frames_flow_into_store_in_order() {
        let store = Arc::new(ChannelStore::new(100).unwrap());
        let frames = (0..50u8).map(|i| RawFrame::new(16, [i], 10.0 + f64::from(i) * 0.1));
        let (tx, rx) = channel();
        let decoder = FrameDecoder::new(schema(), Arc::clone(&store)).with_discovery(tx.clone());
        let handle = spawn_ingest(ManualSource::new(frames), decoder, None, tx);
        wait_until(|| handle.frames_seen() == 50);
        assert!(handle.stop().is_some());

        let snap = store.snapshot("Level").unwrap();
        let expected: Vec<f64> = (0..50).map(f64::from).collect();
        assert_eq!(snap.values, expected);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(StreamEvent::NewChannels(names)) if names == &["Level"]));
        assert!(matches!(events.last(), Some(StreamEvent::Stopped)));
    }

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[test]
    fn fatal_transport_error_ends_ingest() {
        let store = Arc::new(ChannelStore::new(10).unwrap());
        let (tx, rx) = channel();
        let decoder = FrameDecoder::new(schema(), store).with_error_sink(tx.clone());
        let handle = spawn_ingest(FailingSource, decoder, None, tx);
        wait_until(|| handle.is_finished());
        assert!(matches!(
            rx.recv().unwrap(),
            StreamEvent::TransportFault(TransportError::Closed)
        ));
        assert!(matches!(rx.recv().unwrap(), StreamEvent::Stopped));
    }

    #[test]
    fn recorder_sees_every_frame_before_decoding() {
        let dir = scratch_dir("ingest_rec");
        let store = Arc::new(ChannelStore::new(10).unwrap());
        let (tx, _rx) = channel();
        let (recorder, path) = FrameRecorder::create(&dir).unwrap();
        let decoder = FrameDecoder::new(schema(), Arc::clone(&store));
        // Id 99 is unknown to the schema but still recorded.
        let frames = vec![RawFrame::new(16, [7], 1.0), RawFrame::new(99, [1, 2], 1.5)];
        let handle = spawn_ingest(ManualSource::new(frames), decoder, Some(recorder), tx);
        wait_until(|| handle.frames_seen() == 2);
        handle.stop();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "(1.000000) can0 010#07\n(1.500000) can0 063#0102\n"
        );
        assert_eq!(store.snapshot("Level").unwrap().values, vec![7.0]);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn restart_clears_store_and_rearms_decoder() {
        let dir = scratch_dir("session");
        let schema_path = dir.join("db.json");
        fs::write(&schema_path, SAMPLE_DB).unwrap();
        let settings = SessionSettings {
            schema_path,
            transport: Transport::Synthetic {
                max_messages: 5,
                interval: Duration::from_millis(5),
                noise: 0.0,
            },
            record_dir: Some(dir.join("recordings")),
        };
        let store = Arc::new(ChannelStore::new(10_000).unwrap());
        let (tx, rx) = channel();
        let mut session = Session::new(settings, Arc::clone(&store), tx);

        session.start().unwrap();
        assert!(session.is_running());
        wait_until(|| store.channel_count() == 3);
        session.stop();
        assert!(!session.is_running());
        let before = store.snapshot("EngineSpeed").unwrap().len();
        assert!(before > 0);
        let discovered: usize = rx
            .try_iter()
            .map(|e| match e {
                StreamEvent::NewChannels(names) => names.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(discovered, 3);

        // Quiesced: nothing is appended between stop and start.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(store.snapshot("EngineSpeed").unwrap().len(), before);

        session.start().unwrap();
        wait_until(|| store.channel_count() == 3);
        session.stop();
        // The re-armed decoder announces every channel again.
        let rediscovered: usize = rx
            .try_iter()
            .map(|e| match e {
                StreamEvent::NewChannels(names) => names.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(rediscovered, 3);

        let recordings = fs::read_dir(dir.join("recordings")).unwrap().count();
        assert!(recordings >= 1);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn replay_session_feeds_recorded_frames() {
        let dir = scratch_dir("replay");
        let schema_path = dir.join("db.json");
        fs::write(&schema_path, SAMPLE_DB).unwrap();
        let recording = dir.join("capture.log");
        // EngineSpeed 2000 rpm, CoolantTemp 90; then an unknown id.
        fs::write(
            &recording,
            "(100.000000) can0 100#401F820000000000\n(100.500000) can0 7FF#00\n",
        )
        .unwrap();
        let store = Arc::new(ChannelStore::new(16).unwrap());
        let (tx, _rx) = channel();
        let mut session = Session::new(
            SessionSettings {
                schema_path,
                transport: Transport::Replay { path: recording },
                record_dir: None,
            },
            Arc::clone(&store),
            tx,
        );
        session.start().unwrap();
        wait_until(|| session.frames_seen() == 2);
        session.stop();
        assert_eq!(store.snapshot("EngineSpeed").unwrap().values, vec![2000.0]);
        assert_eq!(store.snapshot("CoolantTemp").unwrap().values, vec![90.0]);
        assert_eq!(store.latest_timestamp(), Some(0.0));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_schema_fails_to_start() {
        let store = Arc::new(ChannelStore::new(10).unwrap());
        let (tx, _rx) = channel();
        let mut session = Session::new(
            SessionSettings {
                schema_path: PathBuf::from("/nonexistent/canscope/db.json"),
                transport: Transport::Synthetic {
                    max_messages: 1,
                    interval: Duration::from_millis(5),
                    noise: 0.0,
                },
                record_dir: None,
            },
            store,
            tx,
        );
        assert!(session.start().is_err());
        assert!(!session.is_running());
        assert_eq!(session.frames_seen(), 0);
    }
}
