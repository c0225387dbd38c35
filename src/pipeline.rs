//! The per-device processing chain.
//!
//! ```text
//! Inbound ──▶ decode ──▶ heart-rate merge ──▶ validate ──▶ aggregate ──▶ export
//!                 │                                            │            │
//!                 └──────────────── PipelineEvent ◀────────────┴────────────┘
//! ```
//!
//! [`WorkoutPipeline`] owns every stage and processes one message at a time,
//! so frames for a device are never reordered. [`spawn`] runs it on a tokio
//! task fed by an unbounded channel.
//!
//! Once a strap has reported, machine samples wait for the heart-rate merge
//! to settle: a reading at or after the sample, or the end of its skew
//! window, releases it. A transport gap or the end of the workout releases
//! everything still waiting.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{collections::VecDeque, time::Instant};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::PipelineConfig,
    error::{BridgeError, ConfigError, DecodeError},
    export::{self, ExportedActivity},
    heart_rate::HeartRateMerger,
    identity::DeviceIdentity,
    protocol,
    session::{PhaseTransition, SessionAggregator},
    types::{FrameKind, MachineClass, MetricSample, SessionSummary},
    validator::{SampleValidator, ValidationStats},
};

/// Messages accepted from the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A raw notification value
    Frame {
        /// Characteristic the value arrived on
        kind: FrameKind,
        /// Notification payload
        data: Bytes,
        /// Arrival time
        at: Instant,
    },
    /// The transport lost `missed` machine frames
    TransportGap {
        /// Number of frames lost
        missed: usize,
    },
    /// The workout is over
    End {
        /// Set when the connection dropped rather than the user stopping
        early: bool,
    },
}

/// Events published by the pipeline
#[derive(Debug)]
pub enum PipelineEvent {
    /// A validated sample entered the session
    Sample(MetricSample),
    /// A frame could not be decoded and was skipped
    FrameDropped {
        /// Characteristic of the frame
        kind: FrameKind,
        /// Why it was dropped
        error: DecodeError,
    },
    /// The workout moved to another phase
    PhaseChanged(PhaseTransition),
    /// The session was finalized
    SessionFinished(Box<SessionSummary>),
    /// The activity file was produced and passed self-validation
    Exported(Box<ExportedActivity>),
    /// No activity file was produced
    ExportFailed(BridgeError),
}

impl PipelineEvent {
    /// Whether this event ends the event stream
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exported(_) | Self::ExportFailed(_))
    }
}

/// Decoder, merger, validator and aggregator for one machine
#[derive(Debug)]
pub struct WorkoutPipeline {
    config: PipelineConfig,
    identity: DeviceIdentity,
    merger: HeartRateMerger,
    held: VecDeque<MetricSample>,
    validator: SampleValidator,
    aggregator: SessionAggregator,
    dropped_frames: u64,
    finished: bool,
}

impl WorkoutPipeline {
    /// Build a pipeline recording for `identity`
    ///
    /// The machine class is taken from the identity.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the configuration is inconsistent.
    pub fn new(config: PipelineConfig, identity: DeviceIdentity) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            merger: HeartRateMerger::new(&config.heart_rate),
            held: VecDeque::new(),
            validator: SampleValidator::new(config.validator.clone()),
            aggregator: SessionAggregator::new(identity.machine_class, config.phases.clone()),
            config,
            identity,
            dropped_frames: 0,
            finished: false,
        })
    }

    /// Fix the wall-clock start of the session
    #[must_use]
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.aggregator = self.aggregator.with_started_at(started_at);
        self
    }

    /// Machine class being recorded
    #[must_use]
    pub const fn machine_class(&self) -> MachineClass {
        self.identity.machine_class
    }

    /// Frames dropped so far
    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Validator counters
    #[must_use]
    pub const fn validation_stats(&self) -> ValidationStats {
        self.validator.stats()
    }

    /// Decoded samples waiting for a later strap reading
    #[must_use]
    pub fn held_samples(&self) -> usize {
        self.held.len()
    }

    /// Whether the session has ended
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process one inbound message
    pub fn handle(&mut self, message: Inbound) -> Vec<PipelineEvent> {
        if self.finished {
            debug!("Ignoring {message:?} after session end");
            return Vec::new();
        }

        match message {
            Inbound::Frame { kind, data, at } => self.on_frame(kind, &data, at),
            Inbound::TransportGap { missed } => {
                let mut events = self.release_held(None);
                let released = self.validator.note_transport_gap(missed);
                events.extend(self.aggregate(released));
                events
            }
            Inbound::End { early } => self.on_end(early),
        }
    }

    fn drop_frame(&mut self, kind: FrameKind, error: DecodeError) -> Vec<PipelineEvent> {
        self.dropped_frames += 1;
        warn!("Dropping {kind:?} frame: {error}");
        vec![PipelineEvent::FrameDropped { kind, error }]
    }

    fn on_frame(&mut self, kind: FrameKind, data: &[u8], at: Instant) -> Vec<PipelineEvent> {
        if kind == FrameKind::HeartRateMeasurement {
            return match protocol::decode_heart_rate(data, at) {
                Ok(reading) => {
                    self.merger.push(reading);
                    self.release_held(Some(at))
                }
                Err(e) => self.drop_frame(kind, e),
            };
        }

        if kind.machine_class() != Some(self.machine_class()) {
            return self.drop_frame(kind, DecodeError::UnknownClass(kind.characteristic()));
        }

        match protocol::decode_at(self.machine_class(), data, at) {
            Ok(sample) => {
                self.held.push_back(sample);
                self.release_held(Some(at))
            }
            Err(e) => self.drop_frame(kind, e),
        }
    }

    /// Merge and validate held samples in arrival order
    ///
    /// With `now` set, stops at the first sample whose merge could still
    /// change. Without it, releases everything.
    fn release_held(&mut self, now: Option<Instant>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(front) = self.held.front() {
            if now.is_some_and(|now| !self.merger.is_settled(front.timestamp, now)) {
                break;
            }
            let Some(mut sample) = self.held.pop_front() else {
                break;
            };
            self.merger.merge(&mut sample);
            let released = self.validator.push(sample);
            events.extend(self.aggregate(released));
        }
        events
    }

    fn aggregate(&mut self, samples: Vec<MetricSample>) -> Vec<PipelineEvent> {
        let mut events = Vec::with_capacity(samples.len());
        for sample in samples {
            match self.aggregator.ingest(sample.clone()) {
                Ok(transitions) => {
                    events.push(PipelineEvent::Sample(sample));
                    events.extend(transitions.into_iter().map(PipelineEvent::PhaseChanged));
                }
                Err(e) => error!("Sample rejected by aggregator: {e}"),
            }
        }
        events
    }

    fn on_end(&mut self, early: bool) -> Vec<PipelineEvent> {
        if early {
            warn!("Session ended early by the transport");
        }
        let mut events = self.release_held(None);
        let released = self.validator.flush();
        events.extend(self.aggregate(released));
        self.finished = true;

        let finished = match self.aggregator.finalize() {
            Ok(finished) => finished,
            Err(e) => {
                error!("Cannot finalize session: {e}");
                events.push(PipelineEvent::ExportFailed(e.into()));
                return events;
            }
        };
        if let Some(transition) = self.aggregator.transitions().last() {
            events.push(PipelineEvent::PhaseChanged(*transition));
        }

        let stats = self.validator.stats();
        info!(
            "Validated {} samples: {} out of range, {} outliers, {} interpolated, {} unfilled",
            stats.total, stats.out_of_range, stats.outliers_corrected, stats.interpolated, stats.unfilled
        );

        let exported = export::encode_with(
            &finished.session,
            &finished.summary,
            &self.identity,
            &self.config.export,
        );
        events.push(PipelineEvent::SessionFinished(Box::new(finished.summary)));
        events.push(match exported {
            Ok(activity) => PipelineEvent::Exported(Box::new(activity)),
            Err(e) => {
                error!("Export failed: {e}");
                PipelineEvent::ExportFailed(e.into())
            }
        });
        events
    }
}

/// Channels and task of a spawned pipeline
#[derive(Debug)]
pub struct PipelineHandle {
    /// Feed for transport messages
    pub sender: mpsc::UnboundedSender<Inbound>,
    /// Published events
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
    /// The processing task, yielding the final validator counters
    pub task: JoinHandle<ValidationStats>,
}

/// Run a pipeline on its own tokio task
///
/// The task stops after the session ends. Dropping every sender counts as
/// an early end.
#[must_use]
pub fn spawn(mut pipeline: WorkoutPipeline) -> PipelineHandle {
    let (sender, mut inbound) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        info!("Pipeline started for {}", pipeline.machine_class());
        while !pipeline.is_finished() {
            let message = inbound.recv().await.unwrap_or_else(|| {
                debug!("All transport senders dropped");
                Inbound::End { early: true }
            });
            for event in pipeline.handle(message) {
                if events_tx.send(event).is_err() {
                    debug!("Event receiver dropped");
                }
            }
        }
        pipeline.validation_stats()
    });

    PipelineHandle {
        sender,
        events,
        task,
    }
}
