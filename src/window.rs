//! The grid of time windows that vehicles are counted in.
//!
//! A [`WindowGrid`] covers `[begin, end)` with consecutive windows of the resolution's width.
//! Each window is closed on the left and labelled by its beginning. When the range is not a whole
//! number of windows, the [`TailPolicy`] decides what happens to the remainder.
use std::str::FromStr;

use chrono::{NaiveDateTime, TimeDelta};

use crate::{Direction, FlowError, Resolution, VehicleCategory};

/// The half-open interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeWindow {
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn duration(&self) -> TimeDelta {
        self.end - self.begin
    }

    pub fn midpoint(&self) -> NaiveDateTime {
        self.begin + self.duration() / 2
    }

    pub fn contains(&self, datetime: NaiveDateTime) -> bool {
        self.begin <= datetime && datetime < self.end
    }
}

/// What to do with the end of a range that is shorter than the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailPolicy {
    /// Emit one final, shorter window `[last_begin, end)`.
    #[default]
    ShortFinal,
    /// Only emit full windows; the remainder (and any vehicles in it) is dropped.
    FullOnly,
}

impl FromStr for TailPolicy {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short" => Ok(TailPolicy::ShortFinal),
            "full" => Ok(TailPolicy::FullOnly),
            _ => Err(FlowError::InvalidConfig {
                name: "TAIL_POLICY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// The count of one window/direction/category combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountCell {
    pub window: TimeWindow,
    pub direction: Direction,
    pub category: VehicleCategory,
    pub count: u32,
}

/// Dense, gap-free, ascending sequence of windows over a range.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowGrid {
    resolution: Resolution,
    windows: Vec<TimeWindow>,
}

impl WindowGrid {
    pub fn new(
        begin: NaiveDateTime,
        end: NaiveDateTime,
        resolution: Resolution,
        tail: TailPolicy,
    ) -> Result<Self, FlowError> {
        if begin >= end {
            return Err(FlowError::InvalidRange { begin, end });
        }
        let delta = resolution.delta();

        let mut windows = vec![];
        let mut window_begin = begin;
        while window_begin < end {
            let window_end = window_begin + delta;
            if window_end <= end {
                windows.push(TimeWindow {
                    begin: window_begin,
                    end: window_end,
                });
            } else if tail == TailPolicy::ShortFinal {
                windows.push(TimeWindow {
                    begin: window_begin,
                    end,
                });
            }
            window_begin = window_end;
        }

        Ok(Self {
            resolution,
            windows,
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Index of the window containing `datetime`, if any.
    pub fn window_of(&self, datetime: NaiveDateTime) -> Option<usize> {
        let first = self.windows.first()?;
        if datetime < first.begin {
            return None;
        }
        let offset = (datetime - first.begin).num_milliseconds();
        let index = (offset / self.resolution.delta().num_milliseconds()) as usize;
        if index < self.windows.len() && self.windows[index].contains(datetime) {
            Some(index)
        } else {
            None
        }
    }

    /// Every window/direction/category combination, with a count of 0.
    ///
    /// Ordered by window, then direction, then category.
    pub fn empty_template(&self) -> Vec<CountCell> {
        let mut cells =
            Vec::with_capacity(self.windows.len() * Direction::ALL.len() * VehicleCategory::ALL.len());
        for window in &self.windows {
            for direction in Direction::ALL {
                for category in VehicleCategory::ALL {
                    cells.push(CountCell {
                        window: *window,
                        direction,
                        category,
                        count: 0,
                    });
                }
            }
        }
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn check_covers_exactly(grid: &WindowGrid, begin: NaiveDateTime, end: NaiveDateTime) {
        let windows = grid.windows();
        let delta = grid.resolution().delta();
        assert_eq!(windows.first().unwrap().begin, begin);
        assert_eq!(windows.last().unwrap().end, end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].begin);
            assert_eq!(pair[0].duration(), delta);
        }
        assert!(windows.last().unwrap().duration() <= delta);
        assert!(windows.last().unwrap().duration() > TimeDelta::zero());
    }

    #[test]
    fn grid_covers_range_without_gaps() {
        let cases = [
            ("2020-01-01 00:00", "2020-01-01 02:00", "1h"),
            ("2020-01-01 00:00", "2020-01-02 00:00", "15m"),
            ("2020-01-01 00:00", "2020-01-01 02:10", "1h"),
            ("2020-01-01 00:07", "2020-01-03 13:00", "1d"),
            ("2020-01-01 00:00", "2020-01-01 00:05", "1h"),
            ("2020-02-28 00:00", "2020-03-02 00:00", "7h13m"),
        ];
        for (begin, end, res) in cases {
            let grid =
                WindowGrid::new(dt(begin), dt(end), res.parse().unwrap(), TailPolicy::ShortFinal)
                    .unwrap();
            check_covers_exactly(&grid, dt(begin), dt(end));
        }
    }

    #[test]
    fn grid_has_short_final_window() {
        let grid = WindowGrid::new(
            dt("2020-01-01 00:00"),
            dt("2020-01-01 02:30"),
            "1h".parse().unwrap(),
            TailPolicy::ShortFinal,
        )
        .unwrap();
        assert_eq!(grid.len(), 3);
        assert_eq!(
            grid.windows()[2],
            TimeWindow {
                begin: dt("2020-01-01 02:00"),
                end: dt("2020-01-01 02:30")
            }
        );
    }

    #[test]
    fn grid_full_only_drops_tail() {
        let grid = WindowGrid::new(
            dt("2020-01-01 00:00"),
            dt("2020-01-01 02:30"),
            "1h".parse().unwrap(),
            TailPolicy::FullOnly,
        )
        .unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.windows()[1].end, dt("2020-01-01 02:00"));
    }

    #[test]
    fn grid_is_idempotent() {
        let make = || {
            WindowGrid::new(
                dt("2020-01-01 00:00"),
                dt("2020-01-05 03:00"),
                "2h".parse().unwrap(),
                TailPolicy::ShortFinal,
            )
            .unwrap()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn grid_errs_on_empty_range() {
        let res = "1h".parse().unwrap();
        assert!(matches!(
            WindowGrid::new(dt("2020-01-01 00:00"), dt("2020-01-01 00:00"), res, TailPolicy::ShortFinal),
            Err(FlowError::InvalidRange { .. })
        ));
        assert!(matches!(
            WindowGrid::new(dt("2020-01-02 00:00"), dt("2020-01-01 00:00"), res, TailPolicy::ShortFinal),
            Err(FlowError::InvalidRange { .. })
        ));
    }

    #[test]
    fn window_of_finds_containing_window() {
        let grid = WindowGrid::new(
            dt("2020-01-01 00:00"),
            dt("2020-01-01 02:30"),
            "1h".parse().unwrap(),
            TailPolicy::ShortFinal,
        )
        .unwrap();
        assert_eq!(grid.window_of(dt("2020-01-01 00:00")), Some(0));
        assert_eq!(grid.window_of(dt("2020-01-01 00:59")), Some(0));
        assert_eq!(grid.window_of(dt("2020-01-01 01:00")), Some(1));
        assert_eq!(grid.window_of(dt("2020-01-01 02:29")), Some(2));
        assert_eq!(grid.window_of(dt("2020-01-01 02:30")), None);
        assert_eq!(grid.window_of(dt("2019-12-31 23:59")), None);
    }

    #[test]
    fn empty_template_has_full_cardinality() {
        let grid = WindowGrid::new(
            dt("2020-01-01 00:00"),
            dt("2020-01-01 02:00"),
            "1h".parse().unwrap(),
            TailPolicy::ShortFinal,
        )
        .unwrap();
        let template = grid.empty_template();
        assert_eq!(template.len(), 2 * 2 * 7);
        assert!(template.iter().all(|c| c.count == 0));
        assert_eq!(template[0].direction, Direction::One);
        assert_eq!(template[0].category, VehicleCategory::Car);
        assert_eq!(template[13].direction, Direction::Two);
        assert_eq!(template[13].category, VehicleCategory::CarWithCaravan);
        assert_eq!(template[14].window.begin, dt("2020-01-01 01:00"));
    }

    #[test]
    fn midpoint_is_center_of_window() {
        let window = TimeWindow {
            begin: dt("2020-01-01 00:00"),
            end: dt("2020-01-01 01:00"),
        };
        assert_eq!(window.midpoint(), dt("2020-01-01 00:30"));
    }
}
