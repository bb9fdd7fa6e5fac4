use std::collections::HashSet;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::drivers::{ChannelStore, DecodeError, MessageDescriptor, Schema, TransportError};
use crate::types::{RawFrame, StreamEvent};

/// Receives the names of channels the decoder has not seen before.
pub trait DiscoverySink {
    fn on_new_channels(&mut self, names: Vec<String>);
}

/// Receives transport faults reported by the frame source.
pub trait ErrorSink {
    fn on_transport_error(&mut self, err: TransportError);
}

/// Sink that drops every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl DiscoverySink for NoopSink {
    fn on_new_channels(&mut self, _names: Vec<String>) {}
}

impl ErrorSink for NoopSink {
    fn on_transport_error(&mut self, _err: TransportError) {}
}

impl DiscoverySink for Sender<StreamEvent> {
    fn on_new_channels(&mut self, names: Vec<String>) {
        self.send(StreamEvent::NewChannels(names)).ok();
    }
}

impl ErrorSink for Sender<StreamEvent> {
    fn on_transport_error(&mut self, err: TransportError) {
        self.send(StreamEvent::TransportFault(err)).ok();
    }
}

/// What happened to a single delivered frame.
#[derive(Debug, PartialEq)]
pub enum FrameOutcome {
    /// Signals were appended to the store.
    Stored { signals: usize, discovered: usize },
    /// First time this id failed to resolve; it is now cached.
    Unresolved,
    /// Id is in the unresolved cache; no work done.
    Ignored,
    /// Payload could not be decoded; the store was not touched.
    DecodeFailed(DecodeError),
}

/// Demultiplexes raw frames into named channels of a [`ChannelStore`].
///
/// Every per-frame error stays inside `deliver`; the producer loop never
/// sees one.
pub struct FrameDecoder<S: Schema> {
    schema: S,
    store: Arc<ChannelStore>,
    discovery: Box<dyn DiscoverySink + Send>,
    errors: Box<dyn ErrorSink + Send>,
    known_channels: HashSet<String>,
    unresolved_ids: HashSet<u32>,
}

impl<S: Schema> FrameDecoder<S> {
    pub fn new(schema: S, store: Arc<ChannelStore>) -> Self {
        Self {
            schema,
            store,
            discovery: Box::new(NoopSink),
            errors: Box::new(NoopSink),
            known_channels: HashSet::new(),
            unresolved_ids: HashSet::new(),
        }
    }

    pub fn with_discovery(mut self, sink: impl DiscoverySink + Send + 'static) -> Self {
        self.discovery = Box::new(sink);
        self
    }

    pub fn with_error_sink(mut self, sink: impl ErrorSink + Send + 'static) -> Self {
        self.errors = Box::new(sink);
        self
    }

    /// Starts a new decode session against `schema`, forgetting which
    /// channels and unresolved ids were seen under the previous one.
    pub fn load_schema(&mut self, schema: S) {
        self.schema = schema;
        self.known_channels.clear();
        self.unresolved_ids.clear();
    }

    pub fn deliver(&mut self, frame: &RawFrame) -> FrameOutcome {
        if self.unresolved_ids.contains(&frame.id) {
            return FrameOutcome::Ignored;
        }
        let Some(message) = self.schema.resolve(frame.id) else {
            log::info!(
                "cannot decode frame id {} (0x{:03X}), skipping",
                frame.id,
                frame.id
            );
            self.unresolved_ids.insert(frame.id);
            return FrameOutcome::Unresolved;
        };
        let signals = match message.decode(&frame.payload) {
            Ok(signals) => signals,
            Err(err) => {
                log::warn!("error decoding frame id 0x{:03X}: {err}", frame.id);
                return FrameOutcome::DecodeFailed(err);
            }
        };

        let mut discovered = Vec::new();
        for &(name, value) in &signals {
            self.store.append(name, frame.timestamp, value);
            if !self.known_channels.contains(name) {
                self.known_channels.insert(name.to_owned());
                discovered.push(name.to_owned());
            }
        }
        let outcome = FrameOutcome::Stored {
            signals: signals.len(),
            discovered: discovered.len(),
        };
        if !discovered.is_empty() {
            log::debug!("new channels discovered: {discovered:?}");
            self.discovery.on_new_channels(discovered);
        }
        outcome
    }

    /// Forwards a transport fault to the error sink. Not retried here.
    pub fn report_error(&mut self, err: TransportError) {
        log::error!("transport error: {err}");
        self.errors.on_transport_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::schema::tests::SAMPLE_DB;
    use crate::drivers::SignalDatabase;
    use std::sync::mpsc::{channel, Receiver};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<String>>>>);

    impl DiscoverySink for Recorder {
        fn on_new_channels(&mut self, names: Vec<String>) {
            self.0.lock().unwrap().push(names);
        }
    }

    /// Schema with two messages that each carry two single-byte signals.
    fn pair_schema() -> SignalDatabase {
        SignalDatabase::from_json(
            r#"{"messages":[
                {"name":"M1","id":1,"length":2,"signals":[
                    {"name":"A","start_bit":0,"length":8},
                    {"name":"B","start_bit":8,"length":8}]},
                {"name":"M2","id":2,"length":2,"signals":[
                    {"name":"B","start_bit":0,"length":8},
                    {"name":"C","start_bit":8,"length":8}]}]}"#,
        )
        .unwrap()
    }

    fn decoder_with_events(
        schema: SignalDatabase,
    ) -> (FrameDecoder<SignalDatabase>, Receiver<StreamEvent>) {
        let store = Arc::new(ChannelStore::new(32).unwrap());
        let (tx, rx) = channel();
        let decoder = FrameDecoder::new(schema, store)
            .with_discovery(tx.clone())
            .with_error_sink(tx);
        (decoder, rx)
    }

    #[test]
    fn discovery_batches_once_per_frame() {
        let recorder = Recorder::default();
        let store = Arc::new(ChannelStore::new(32).unwrap());
        let mut decoder = FrameDecoder::new(pair_schema(), Arc::clone(&store))
            .with_discovery(recorder.clone());
        decoder.deliver(&RawFrame::new(1, [10, 20], 5.0));
        decoder.deliver(&RawFrame::new(2, [30, 40], 5.5));
        decoder.deliver(&RawFrame::new(1, [11, 21], 6.0));
        let batches = recorder.0.lock().unwrap().clone();
        assert_eq!(
            batches,
            vec![vec!["A".to_owned(), "B".to_owned()], vec!["C".to_owned()]]
        );
        assert_eq!(store.snapshot("B").unwrap().values, vec![20.0, 30.0, 21.0]);
        assert_eq!(store.latest_timestamp(), Some(1.0));
    }

    #[test]
    fn unresolved_id_is_reported_once() {
        let (mut decoder, _rx) = decoder_with_events(pair_schema());
        let frame = RawFrame::new(0x123, [0, 0], 1.0);
        assert_eq!(decoder.deliver(&frame), FrameOutcome::Unresolved);
        assert_eq!(decoder.deliver(&frame), FrameOutcome::Ignored);
        assert_eq!(decoder.deliver(&frame), FrameOutcome::Ignored);
        assert!(decoder.store.channel_names().is_empty());
    }

    #[test]
    fn decode_failure_drops_frame_without_mutation() {
        let (mut decoder, rx) = decoder_with_events(pair_schema());
        let outcome = decoder.deliver(&RawFrame::new(1, [10], 1.0));
        assert_eq!(
            outcome,
            FrameOutcome::DecodeFailed(DecodeError::PayloadTooShort { needed: 2, actual: 1 })
        );
        assert!(decoder.store.latest_timestamp().is_none());
        assert!(rx.try_recv().is_err());
        // The producer keeps going after a bad frame.
        assert_eq!(
            decoder.deliver(&RawFrame::new(1, [10, 20], 2.0)),
            FrameOutcome::Stored { signals: 2, discovered: 2 }
        );
    }

    #[test]
    fn transport_errors_are_forwarded_verbatim() {
        let (mut decoder, rx) = decoder_with_events(pair_schema());
        decoder.report_error(TransportError::Closed);
        match rx.try_recv() {
            Ok(StreamEvent::TransportFault(TransportError::Closed)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn loading_a_schema_starts_a_new_session() {
        let (mut decoder, rx) = decoder_with_events(pair_schema());
        assert_eq!(decoder.deliver(&RawFrame::new(256, [0; 8], 0.0)), FrameOutcome::Unresolved);
        decoder.deliver(&RawFrame::new(1, [1, 2], 0.0));
        decoder.load_schema(SignalDatabase::from_json(SAMPLE_DB).unwrap());
        assert!(matches!(
            decoder.deliver(&RawFrame::new(256, [0x40, 0x1F, 130, 0, 0, 0, 0, 0], 1.0)),
            FrameOutcome::Stored { signals: 2, discovered: 2 }
        ));
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
    }
}
