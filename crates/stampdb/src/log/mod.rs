//! The log-structured storage layer: page formats and the segment ring.

pub mod page;
pub mod ring;

pub use page::{PageBuilder, PageHeader, SegmentFooter, SeriesFilter};
pub use ring::{BlockLocation, SegmentRing, SegmentState, SegmentSummary};
