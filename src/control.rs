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

use chrono::naive::{NaiveDateTime, NaiveTime};
use chrono::{Local, Timelike};
use log::{info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Tuning;
use crate::decision::{decide, Decision, Inputs};
use crate::device::{Device, DeviceState};
use crate::error::{Error, Result};
use crate::forecast::{ForecastTable, Forecaster};
use crate::smoothing::{Metric, Telemetry};

/// Mutable state carried from one cycle to the next.
pub struct ControlState {
    pub telemetry: Telemetry,
    /// Start the next charge from zero once limits are off
    pub needs_initial_charge_reset: bool,
    pub next_decision_at: NaiveDateTime,
    pub next_forecast_at: NaiveDateTime,
}

impl ControlState {
    pub fn new(window_size: usize, now: NaiveDateTime) -> Self {
        Self {
            telemetry: Telemetry::new(window_size),
            needs_initial_charge_reset: true,
            next_decision_at: now,
            next_forecast_at: now,
        }
    }

    /// Forget everything learnt during the day.
    pub fn reset(&mut self) {
        self.telemetry.clear_all();
        self.needs_initial_charge_reset = true;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// The battery was discharging, so the readings were thrown away
    Discharging,
    /// Readings were added but it was too early to decide anything
    Observed,
    Decided(Decision),
}

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

// Only fails for durations that don't fit in i64 milliseconds
fn delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

pub fn in_active_hours(tuning: &Tuning, time: NaiveTime) -> bool {
    tuning.active_start <= time && time < tuning.active_end
}

/// The first time after `now` that the clock shows `at`.
pub fn next_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// When to start the next cycle. The wake-up is pulled forward to the start
/// of the quiet hours if the cycle would otherwise run past them.
pub fn next_wake(tuning: &Tuning, now: NaiveDateTime, pause: Duration) -> NaiveDateTime {
    let wake = now + delta(pause) + delta(tuning.polling_cycle);
    let quiet = now.date().and_time(tuning.active_end);
    if now < quiet && wake > quiet {
        quiet
    } else {
        wake
    }
}

struct Reading {
    house: f64,
    grid: f64,
    ac: f64,
    ac_apparent: f64,
    ac_current: f64,
    device: DeviceState,
}

pub struct Controller {
    device: Box<dyn Device>,
    forecaster: Box<dyn Forecaster>,
    tuning: Tuning,
    forecast: ForecastTable,
    state: ControlState,
}

impl Controller {
    pub fn new(
        device: Box<dyn Device>,
        forecaster: Box<dyn Forecaster>,
        tuning: Tuning,
        now: NaiveDateTime,
    ) -> Self {
        let state = ControlState::new(tuning.window_size, now);
        Self {
            device,
            forecaster,
            tuning,
            forecast: ForecastTable::default(),
            state,
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn forecast(&self) -> &ForecastTable {
        &self.forecast
    }

    /// Fetch a new forecast if one is due. On failure the old one is kept.
    async fn refresh_forecast(&mut self, now: NaiveDateTime) {
        if now < self.state.next_forecast_at {
            return;
        }
        self.state.next_forecast_at = now + delta(self.tuning.forecast_interval);
        match self.forecaster.refresh(now).await {
            Ok(forecast) => {
                self.forecast = forecast;
                info!("Successfully updated solar forecast");
            }
            Err(Error::RateLimited { retry_after }) => {
                warn!(
                    "Forecast rate limit reached, keeping old forecast (retry in {}s)",
                    retry_after.as_secs()
                );
            }
            Err(err) => {
                warn!("Failed to update forecast, keeping old forecast: {err}");
            }
        }
    }

    /// Read everything needed for one cycle, or None if the battery is
    /// discharging.
    async fn read_device(&mut self) -> Result<Option<Reading>> {
        let poll = self.device.poll().await?;
        if poll.consumption.battery < 0.0 {
            return Ok(None);
        }
        let pvi = self.device.pvi_data().await?;
        let phase = pvi.phase("0")?;
        let settings = self.device.power_settings().await?;
        let status = self.device.system_status().await?;
        Ok(Some(Reading {
            house: poll.consumption.house,
            grid: poll.production.grid,
            ac: phase.power,
            ac_apparent: phase.apparent_power,
            ac_current: phase.current,
            device: DeviceState {
                settings,
                state_of_charge: poll.state_of_charge,
                pv_derated: status.pv_derated,
            },
        }))
    }

    fn log_inputs(&self, now: NaiveDateTime, reading: &Reading) {
        let telemetry = &self.state.telemetry;
        let headroom = self.forecast.battery_headroom(
            now.hour() as usize,
            self.tuning.active_end.hour() as usize,
            self.tuning.headroom_baseline,
        );
        info!("### next cycle");
        info!("Forecast watts: {:?}", self.forecast.watts());
        info!("Forecast day total: {}", self.forecast.daily_total());
        info!("Forecast battery headroom: {headroom}");
        info!("Grid mean: {:?}", telemetry.mean(Metric::Grid));
        info!("House mean: {:?}", telemetry.mean(Metric::House));
        info!("AC: {} (mean {:?})", reading.ac, telemetry.mean(Metric::Ac));
        info!(
            "AC apparent: {} (mean {:?})",
            reading.ac_apparent,
            telemetry.mean(Metric::AcApparent)
        );
        info!(
            "AC current: {} (mean {:?})",
            reading.ac_current,
            telemetry.mean(Metric::AcCurrent)
        );
        info!("State of charge: {}", reading.device.state_of_charge);
        info!("PV derated: {}", reading.device.pv_derated);
        info!(
            "Power limits used: {}, max charge power: {}",
            reading.device.settings.power_limits_used, reading.device.settings.max_charge_power
        );
    }

    /// Run one poll/decide cycle at local time `now`.
    pub async fn cycle(&mut self, now: NaiveDateTime) -> Result<CycleOutcome> {
        self.refresh_forecast(now).await;

        let Some(reading) = self.read_device().await? else {
            info!("Skipping cycle due to battery discharge");
            return Ok(CycleOutcome::Discharging);
        };

        let telemetry = &mut self.state.telemetry;
        telemetry.update(Metric::House, reading.house);
        telemetry.update(Metric::Grid, reading.grid);
        telemetry.update(Metric::Ac, reading.ac);
        telemetry.update(Metric::AcApparent, reading.ac_apparent);
        telemetry.update(Metric::AcCurrent, reading.ac_current);

        if now < self.state.next_decision_at {
            return Ok(CycleOutcome::Observed);
        }

        self.log_inputs(now, &reading);
        let decision = decide(
            &self.tuning,
            &Inputs {
                smoothed: self.state.telemetry.smoothed(),
                forecast: &self.forecast,
                device: reading.device,
                time: now.time(),
                needs_initial_charge_reset: self.state.needs_initial_charge_reset,
            },
        );
        info!("Decision: {:?}", decision.rule);
        self.state.needs_initial_charge_reset = decision.needs_initial_charge_reset;

        if decision.push {
            let target = decision.target;
            let applied = self
                .device
                .set_power_limits(target.power_limits_used, target.max_charge_power, false)
                .await?;
            if !applied {
                warn!("Device did not apply power limits, will check again after settling");
            }
            // Judge the new setting only on readings taken after it
            self.state.telemetry.clear(Metric::AcApparent);
            self.state.next_decision_at = now + delta(self.tuning.settle_time());
        }
        Ok(CycleOutcome::Decided(decision))
    }

    /// Switch off limits and start the day over.
    pub async fn enter_quiet_hours(&mut self) -> Result<()> {
        info!(
            "Outside {}-{}, disabling power limits",
            self.tuning.active_start, self.tuning.active_end
        );
        let applied = self
            .device
            .set_power_limits(false, self.tuning.charge_power_ceiling, false)
            .await?;
        if !applied {
            warn!("Device did not apply the nightly power limit reset");
        }
        self.state.reset();
        Ok(())
    }

    /// Run until cancelled, or until the device cannot be reached.
    pub async fn run(&mut self, token: CancellationToken) -> Result<()> {
        loop {
            let now = local_now();
            let wake = if in_active_hours(&self.tuning, now.time()) {
                let pause = match self.cycle(now).await? {
                    CycleOutcome::Decided(decision) => decision.pause,
                    _ => Duration::ZERO,
                };
                if !pause.is_zero() {
                    info!("Sleeping {} seconds", pause.as_secs());
                }
                next_wake(&self.tuning, now, pause)
            } else {
                self.enter_quiet_hours().await?;
                let wake = next_occurrence(now, self.tuning.active_start);
                info!("Sleeping until {wake}");
                wake
            };

            let duration = (wake - local_now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(duration) => {},
            }
        }
    }
}
