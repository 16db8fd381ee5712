//!
//! # Gaugeworks Core
//!
//! A dynamic, typed metrics pipeline: gauge instruments are created at
//! runtime in a concurrent registry, observation sources supply attributed
//! measurements on demand, and a mapping layer translates between a source's
//! native attributes and an instrument's declared attributes with
//! type-checked conversion. A replication layer mirrors the authoritative
//! registry onto read-only client views over any reliable ordered message
//! channel.
//!
//! The aggregation side is deliberately absent: an external collector calls
//! [`InstrumentRegistry::collect`] whenever it wants current values and does
//! whatever it likes with them.
//!
//! ## Basic example
//!
//! ```
//! use std::sync::Arc;
//!
//! use gw_core::{
//! 	AttributeSet, GaugeRecorder, GaugeValue, InstrumentRegistration, InstrumentRegistry,
//! 	PipelineConfig, RecordedSample,
//! };
//!
//! let registry = InstrumentRegistry::new(Arc::new(PipelineConfig::default()));
//!
//! registry
//! 	.register_immutable(
//! 		registry.gauge("game.test.counter").description("tick counter"),
//! 		|_: &InstrumentRegistration, recorder: &mut dyn GaugeRecorder| {
//! 			recorder.record(GaugeValue::Long(42), &AttributeSet::new());
//! 		},
//! 	)
//! 	.unwrap();
//!
//! let mut samples = Vec::<RecordedSample>::new();
//! registry.collect(&mut samples);
//! assert_eq!(samples[0].value, GaugeValue::Long(42));
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod attribute;
mod config;
mod container;
mod definition;
mod instrument;
mod mapping;
mod persist;
mod registry;
pub mod replication;
mod source;
mod state;

pub use attribute::{AttributeKey, AttributeSet, AttributeType, AttributeValue, ConversionPath};
pub use config::{ConfigError, PipelineConfig};
pub use container::SourceContainer;
pub use definition::{
	DefinitionError, InstrumentDefinition, InstrumentKind, MAX_ATTRIBUTES,
};
pub use instrument::{
	CallbackHandle, GaugeCallback, GaugeRecorder, GaugeValue, InstrumentRegistration,
	MutableInstrument, RecordedSample,
};
pub use mapping::{AttributeMapping, MappingPair};
pub use persist::{FileStore, MemoryStore, PersistError, PersistenceStore};
pub use registry::{
	AvailabilityListener, AvailabilityPhase, InstrumentBuilder, InstrumentRegistry,
	ListenerHandle, RegistryError,
};
pub use source::{ObservationSource, ObserveError, SourceId, SourceRecorder, UnusedAttributes};
pub use state::{Diagnostic, ErrorState, SourceConfiguration, SourceState};
