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

//! The per-cycle charge limit rules.
//!
//! The rules are checked in order and the first one that applies decides the
//! outcome:
//! 1. Too little solar forecast before the afternoon: stop limiting and look
//!    again in an hour.
//! 2. Battery almost empty: stop limiting and ramp up again from zero later.
//! 3. The PV inverter is derating or close to the line limit: raise the
//!    charge power so that the surplus goes into the battery, until the
//!    ceiling is reached.
//! 4. At the start of a day (or after a reset): start limiting from zero.

use chrono::naive::NaiveTime;
use std::time::Duration;

use crate::config::Tuning;
use crate::device::{DeviceState, PowerSettings};
use crate::forecast::ForecastTable;
use crate::smoothing::Smoothed;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rule {
    InsufficientForecast,
    LowSoc,
    Derate,
    CeilingReached,
    InitialChargeReset,
    NoChange,
}

#[derive(Clone, Debug)]
pub struct Inputs<'a> {
    pub smoothed: Smoothed,
    pub forecast: &'a ForecastTable,
    pub device: DeviceState,
    pub time: NaiveTime, // local
    pub needs_initial_charge_reset: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub rule: Rule,
    pub target: PowerSettings,
    /// Whether `target` differs from what the device reported
    pub push: bool,
    /// Extra time to wait before the next cycle
    pub pause: Duration,
    pub needs_initial_charge_reset: bool,
}

/// Current charge power plus `step`, rounded down to a multiple of 100 W.
fn raise(current: i32, step: i32) -> i32 {
    (current + step).div_euclid(100) * 100
}

fn until(now: NaiveTime, end: NaiveTime) -> Duration {
    (end - now).to_std().unwrap_or(Duration::ZERO)
}

pub fn decide(tuning: &Tuning, inputs: &Inputs) -> Decision {
    let current = inputs.device.settings;
    let mut target = current;
    let mut pause = Duration::ZERO;
    let mut needs_reset = inputs.needs_initial_charge_reset;

    let forecast = inputs.forecast.total_before(tuning.forecast_horizon);
    let near_limit = inputs
        .smoothed
        .ac_apparent
        .is_some_and(|apparent| apparent >= tuning.apparent_power_limit);

    let rule = if forecast < tuning.forecast_threshold {
        target.power_limits_used = false;
        pause = tuning.insufficient_forecast_pause;
        Rule::InsufficientForecast
    } else if inputs.device.state_of_charge < tuning.min_soc {
        target.power_limits_used = false;
        needs_reset = true;
        Rule::LowSoc
    } else if inputs.device.pv_derated || near_limit {
        let raised = raise(current.max_charge_power, tuning.charge_step);
        if raised < tuning.charge_power_ceiling {
            target.power_limits_used = true;
            target.max_charge_power = raised;
            Rule::Derate
        } else {
            // Charging at full power from here on; nothing left to control today
            target.power_limits_used = false;
            target.max_charge_power = tuning.charge_power_ceiling;
            pause = until(inputs.time, tuning.active_end);
            Rule::CeilingReached
        }
    } else if !current.power_limits_used
        && needs_reset
        && inputs.device.state_of_charge < tuning.reset_soc_limit
    {
        target.power_limits_used = true;
        target.max_charge_power = 0;
        needs_reset = false;
        Rule::InitialChargeReset
    } else {
        Rule::NoChange
    };

    Decision {
        rule,
        target,
        push: target != current,
        pause,
        needs_initial_charge_reset: needs_reset,
    }
}
