//! Multi-snapshot trend of one report series.

use std::fmt;

use cad_core::{SeriesKey, Severity, SeverityCounts};
use chrono::NaiveDate;
use serde::Serialize;

use crate::compare::{CompareError, ComparisonEngine};

/// Snapshots considered when no window is given.
pub const DEFAULT_TREND_WINDOW: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    SignificantlyIncreasing,
    Increasing,
    Stable,
    Decreasing,
    SignificantlyDecreasing,
}

impl TrendDirection {
    /// Classifies a percentage change between the last two snapshots.
    pub fn from_change_rate(rate: f64) -> Self {
        if rate.abs() < 5.0 {
            TrendDirection::Stable
        } else if rate > 20.0 {
            TrendDirection::SignificantlyIncreasing
        } else if rate > 0.0 {
            TrendDirection::Increasing
        } else if rate < -20.0 {
            TrendDirection::SignificantlyDecreasing
        } else {
            TrendDirection::Decreasing
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrendDirection::SignificantlyIncreasing => "significantly increasing",
            TrendDirection::Increasing => "increasing",
            TrendDirection::Stable => "stable",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::SignificantlyDecreasing => "significantly decreasing",
        }
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub total: u64,
    /// Critical plus high findings.
    pub severe: u64,
}

impl TrendPoint {
    fn new(date: NaiveDate, counts: &SeverityCounts) -> Self {
        let count = |severity| counts.get(&severity).copied().unwrap_or(0);
        Self {
            date,
            total: counts.values().sum(),
            severe: count(Severity::Critical) + count(Severity::High),
        }
    }

    fn severe_percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.severe as f64 / self.total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesTrend {
    pub series: SeriesKey,
    /// Oldest first; the last point is the current date.
    pub points: Vec<TrendPoint>,
    /// Percent change of the total between the last two points; 0 when the
    /// earlier total is 0.
    pub change_rate: f64,
    pub direction: TrendDirection,
    /// Latest critical/high share against the mean share of the earlier points.
    pub severe_share: TrendDirection,
}

impl SeriesTrend {
    pub fn from_points(series: SeriesKey, points: Vec<TrendPoint>) -> Self {
        let change_rate = match points.as_slice() {
            [.., previous, latest] if previous.total > 0 => {
                (latest.total as f64 - previous.total as f64) / previous.total as f64 * 100.0
            }
            _ => 0.0,
        };
        let severe_share = severe_share_direction(&points);
        Self {
            series,
            points,
            change_rate,
            direction: TrendDirection::from_change_rate(change_rate),
            severe_share,
        }
    }
}

fn severe_share_direction(points: &[TrendPoint]) -> TrendDirection {
    let shares: Vec<f64> = points.iter().filter_map(TrendPoint::severe_percent).collect();
    let Some((latest, earlier)) = shares.split_last().filter(|(_, earlier)| !earlier.is_empty())
    else {
        return TrendDirection::Stable;
    };
    let mean = earlier.iter().sum::<f64>() / earlier.len() as f64;
    if *latest > mean * 1.2 {
        TrendDirection::Increasing
    } else if *latest < mean * 0.8 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

impl ComparisonEngine {
    /// Trend over the last `window` snapshots up to and including `current`.
    pub async fn series_trend(
        &self,
        series: &SeriesKey,
        current: NaiveDate,
        window: usize,
    ) -> Result<SeriesTrend, CompareError> {
        let dates: Vec<NaiveDate> = self
            .snapshot_dates(series)
            .await?
            .into_iter()
            .filter(|date| *date <= current)
            .collect();
        if dates.last() != Some(&current) {
            return Err(CompareError::NoData {
                series: series.clone(),
                date: current,
            });
        }
        if dates.len() < 2 {
            return Err(CompareError::NoPriorData {
                series: series.clone(),
                current,
            });
        }

        let start = dates.len().saturating_sub(window.max(2));
        let mut points = Vec::with_capacity(dates.len() - start);
        for date in &dates[start..] {
            if let Some(snapshot) = self.load_snapshot(series, *date).await? {
                points.push(TrendPoint::new(*date, &snapshot.counts));
            }
        }
        Ok(SeriesTrend::from_points(series.clone(), points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_core::ReportType;

    fn point(day: u32, total: u64, severe: u64) -> TrendPoint {
        TrendPoint {
            date: NaiveDate::from_ymd_opt(2026, 2, day).unwrap(),
            total,
            severe,
        }
    }

    fn series() -> SeriesKey {
        SeriesKey::new("100", ReportType::Risk, "arch-a")
    }

    #[test]
    fn change_rate_thresholds() {
        assert_eq!(TrendDirection::from_change_rate(0.0), TrendDirection::Stable);
        assert_eq!(TrendDirection::from_change_rate(-4.9), TrendDirection::Stable);
        assert_eq!(TrendDirection::from_change_rate(5.0), TrendDirection::Increasing);
        assert_eq!(TrendDirection::from_change_rate(20.0), TrendDirection::Increasing);
        assert_eq!(
            TrendDirection::from_change_rate(25.0),
            TrendDirection::SignificantlyIncreasing
        );
        assert_eq!(TrendDirection::from_change_rate(-5.0), TrendDirection::Decreasing);
        assert_eq!(
            TrendDirection::from_change_rate(-50.0),
            TrendDirection::SignificantlyDecreasing
        );
    }

    #[test]
    fn rate_uses_the_last_two_points() {
        let trend = SeriesTrend::from_points(
            series(),
            vec![point(20, 10, 1), point(23, 4, 2), point(25, 5, 1)],
        );
        assert_eq!(trend.change_rate, 25.0);
        assert_eq!(trend.direction, TrendDirection::SignificantlyIncreasing);
    }

    #[test]
    fn growth_from_zero_is_stable() {
        let trend = SeriesTrend::from_points(series(), vec![point(20, 0, 0), point(23, 3, 1)]);
        assert_eq!(trend.change_rate, 0.0);
        assert_eq!(trend.direction, TrendDirection::Stable);
    }

    #[test]
    fn severe_share_compares_latest_with_earlier_mean() {
        // Earlier shares 20% and 40% average 30%; 50% is above 36%.
        let rising = SeriesTrend::from_points(
            series(),
            vec![point(20, 5, 1), point(23, 5, 2), point(25, 4, 2)],
        );
        assert_eq!(rising.severe_share, TrendDirection::Increasing);

        let falling = SeriesTrend::from_points(series(), vec![point(20, 2, 2), point(23, 4, 1)]);
        assert_eq!(falling.severe_share, TrendDirection::Decreasing);

        // Empty snapshots carry no share.
        let sparse = SeriesTrend::from_points(series(), vec![point(20, 0, 0), point(23, 4, 1)]);
        assert_eq!(sparse.severe_share, TrendDirection::Stable);
    }
}
