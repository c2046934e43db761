/* Copyright 2025 Bruce Merry
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
 * more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::VecDeque;

/// Fixed-capacity window of the most recent samples.
#[derive(Clone, Debug)]
pub struct SlidingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the samples, rounded to 2 decimal places.
    ///
    /// Returns None if the window is empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        Some(round2(mean))
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Metric {
    House,
    Grid,
    Ac,
    AcApparent,
    AcCurrent,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::House,
        Metric::Grid,
        Metric::Ac,
        Metric::AcApparent,
        Metric::AcCurrent,
    ];
}

/// Smoothed values at one point in time. None for metrics without samples.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Smoothed {
    pub house: Option<f64>,
    pub grid: Option<f64>,
    pub ac: Option<f64>,
    pub ac_apparent: Option<f64>,
    pub ac_current: Option<f64>,
}

/// One sliding window per metric.
#[derive(Clone, Debug)]
pub struct Telemetry {
    house: SlidingWindow,
    grid: SlidingWindow,
    ac: SlidingWindow,
    ac_apparent: SlidingWindow,
    ac_current: SlidingWindow,
}

impl Telemetry {
    pub fn new(capacity: usize) -> Self {
        Self {
            house: SlidingWindow::new(capacity),
            grid: SlidingWindow::new(capacity),
            ac: SlidingWindow::new(capacity),
            ac_apparent: SlidingWindow::new(capacity),
            ac_current: SlidingWindow::new(capacity),
        }
    }

    pub fn window(&self, metric: Metric) -> &SlidingWindow {
        match metric {
            Metric::House => &self.house,
            Metric::Grid => &self.grid,
            Metric::Ac => &self.ac,
            Metric::AcApparent => &self.ac_apparent,
            Metric::AcCurrent => &self.ac_current,
        }
    }

    fn window_mut(&mut self, metric: Metric) -> &mut SlidingWindow {
        match metric {
            Metric::House => &mut self.house,
            Metric::Grid => &mut self.grid,
            Metric::Ac => &mut self.ac,
            Metric::AcApparent => &mut self.ac_apparent,
            Metric::AcCurrent => &mut self.ac_current,
        }
    }

    pub fn update(&mut self, metric: Metric, sample: f64) {
        self.window_mut(metric).push(sample);
    }

    pub fn mean(&self, metric: Metric) -> Option<f64> {
        self.window(metric).mean()
    }

    pub fn clear(&mut self, metric: Metric) {
        self.window_mut(metric).clear();
    }

    pub fn clear_all(&mut self) {
        for metric in Metric::ALL {
            self.clear(metric);
        }
    }

    pub fn smoothed(&self) -> Smoothed {
        Smoothed {
            house: self.house.mean(),
            grid: self.grid.mean(),
            ac: self.ac.mean(),
            ac_apparent: self.ac_apparent.mean(),
            ac_current: self.ac_current.mean(),
        }
    }
}
