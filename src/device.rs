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

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Consumption {
    pub house: f64,   // W
    pub battery: f64, // W, negative while discharging
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Production {
    pub grid: f64,  // W
    pub solar: f64, // W
}

/// Response to `GET /api/poll`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub consumption: Consumption,
    pub production: Production,
    pub state_of_charge: f64, // %
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub apparent_power: f64, // VA
    pub power: f64,          // W
    pub current: f64,        // A
}

/// Response to `GET /api/pvi_data`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PviData {
    pub phases: BTreeMap<String, Phase>,
}

impl PviData {
    pub fn phase(&self, id: &str) -> Result<&Phase> {
        self.phases
            .get(id)
            .ok_or_else(|| Error::MissingPhase(id.to_owned()))
    }
}

/// Response to `GET /api/power_settings`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerSettings {
    pub power_limits_used: bool,
    pub max_charge_power: i32, // W
}

/// Body of `POST /api/power_settings`.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerSettingsRequest {
    pub power_limits_used: bool,
    pub max_charge_power: i32,
    pub weather_regulated_charge_enabled: bool,
}

/// Response to `GET /api/system_info`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub derate_power: f64,         // W
    pub installed_peak_power: f64, // Wp
    pub max_bat_charge_power: f64, // W
}

/// Response to `GET /api/system_status`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub pv_derated: bool,
}

/// Everything the controller reads from the device in one cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceState {
    pub settings: PowerSettings,
    pub state_of_charge: f64,
    pub pv_derated: bool,
}

#[async_trait]
pub trait Device: Send {
    async fn poll(&mut self) -> Result<Poll>;
    async fn pvi_data(&mut self) -> Result<PviData>;
    async fn power_settings(&mut self) -> Result<PowerSettings>;
    async fn system_info(&mut self) -> Result<SystemInfo>;
    async fn system_status(&mut self) -> Result<SystemStatus>;

    /// Returns false if the device refused the settings.
    async fn set_power_limits(
        &mut self,
        used: bool,
        max_charge_power: i32,
        weather_regulated: bool,
    ) -> Result<bool>;
}

/// Reads from the wrapped device but only logs writes.
pub struct DryrunDevice<D: Device> {
    base: D,
}

impl<D: Device> DryrunDevice<D> {
    pub fn new(base: D) -> Self {
        Self { base }
    }
}

#[async_trait]
impl<D: Device> Device for DryrunDevice<D> {
    async fn poll(&mut self) -> Result<Poll> {
        self.base.poll().await
    }

    async fn pvi_data(&mut self) -> Result<PviData> {
        self.base.pvi_data().await
    }

    async fn power_settings(&mut self) -> Result<PowerSettings> {
        self.base.power_settings().await
    }

    async fn system_info(&mut self) -> Result<SystemInfo> {
        self.base.system_info().await
    }

    async fn system_status(&mut self) -> Result<SystemStatus> {
        self.base.system_status().await
    }

    async fn set_power_limits(
        &mut self,
        used: bool,
        max_charge_power: i32,
        weather_regulated: bool,
    ) -> Result<bool> {
        info!(
            "Dry run: would set power limits to {used}, max charge power {max_charge_power} \
             (weather regulated: {weather_regulated})"
        );
        Ok(true)
    }
}
