//! Database access for clipq-seq
//!
//! Schema creation lives in `clipq_common::db`; this module holds the
//! sequencer's own result tables.

pub mod feedback;

pub use feedback::{FeedbackSink, SegmentFeedback, SessionSummary};
