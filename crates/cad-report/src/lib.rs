//! Read-side of Cloud Advisor Digest: snapshot comparison and Markdown digests.

pub mod assemble;
pub mod compare;
pub mod normalize;
pub mod trend;

pub use assemble::{format_counts, render_comparison, ReportAssembler, ReportRequest, NO_DATA};
pub use compare::{count_deltas, CompareError, ComparisonEngine, PreviousDate, Snapshot};
pub use normalize::{count_findings, normalize_summary, NormalizedSummary};
pub use trend::{SeriesTrend, TrendDirection, TrendPoint, DEFAULT_TREND_WINDOW};

pub const CRATE_NAME: &str = "cad-report";
