//! Runtime log handling: frame demultiplexing and timestamp-ordered merge.

pub mod demux;
pub mod merge;

pub use demux::{LogDemuxer, demux_stream};
pub use merge::{MergeOptions, merge_ordered};
