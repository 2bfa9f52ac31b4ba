//! Execution traces: the event model, fetching and wrap/unwrap classification.

pub mod classifier;
pub mod event;
pub mod fetcher;

pub use classifier::{Classification, ClassificationContext, Classifier, ClassifierConfig, ReviewItem};
pub use event::{RawAmount, TraceEvent, Transfer, parse_amount, parse_trace};
pub use fetcher::{
	BlockTraceStrategy, FetchReport, FetchedTrace, OutpointTraceStrategy, TraceFailure, TraceMode,
	TraceRequest, TraceStrategy,
};
