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

use chrono::naive::NaiveTime;
use clap::{Args, Parser};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::Backoff;

/// Where the device and the panels are. Read from the environment.
#[derive(Args, Clone, Debug)]
pub struct Site {
    /// Base URL of the device REST API
    #[arg(long, env = "REST_URL")]
    pub url: String,
    #[arg(long, env = "REST_USERNAME")]
    pub username: String,
    #[arg(long, env = "REST_PASSWORD", hide_env_values = true)]
    pub password: String,
    /// Accept self-signed certificates from the device
    #[arg(long, env = "REST_INSECURE", default_value_t = false)]
    pub insecure: bool,
    #[arg(long, env = "FORECAST_LAT", allow_hyphen_values = true)]
    pub latitude: f64,
    #[arg(long, env = "FORECAST_LON", allow_hyphen_values = true)]
    pub longitude: f64,
    /// Panel declination (0 = horizontal, 90 = vertical)
    #[arg(long, env = "FORECAST_DEC")]
    pub declination: f64,
    /// Panel azimuth (-180 = north, -90 = east, 0 = south, 90 = west)
    #[arg(long, env = "FORECAST_AZ", allow_hyphen_values = true)]
    pub azimuth: f64,
}

#[derive(Parser, Debug)]
#[clap(author, version)]
pub struct Cli {
    #[command(flatten)]
    pub site: Site,
    /// TOML file overriding the control thresholds
    #[arg(long, env = "PVCHARGE_TUNING")]
    pub tuning: Option<PathBuf>,
    /// Log power setting changes without applying them
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

/// Control thresholds and timing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    #[serde(with = "humantime_serde")]
    pub polling_cycle: Duration,
    pub window_size: usize,
    #[serde(with = "humantime_serde")]
    pub forecast_interval: Duration,
    pub forecast_max_calls: usize,
    #[serde(with = "humantime_serde")]
    pub forecast_period: Duration,
    /// Start of the daily control window (local time)
    pub active_start: NaiveTime,
    /// End of the daily control window (local time)
    pub active_end: NaiveTime,
    pub forecast_threshold: f64, // Wh before forecast_horizon
    pub forecast_horizon: usize,  // hour of day, exclusive
    #[serde(with = "humantime_serde")]
    pub insufficient_forecast_pause: Duration,
    pub min_soc: f64,              // %
    pub apparent_power_limit: f64, // VA
    pub charge_step: i32,          // W
    pub charge_power_ceiling: i32, // W
    pub reset_soc_limit: f64,      // %
    pub headroom_baseline: f64,    // W
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            polling_cycle: Duration::from_secs(15),
            window_size: 20,
            forecast_interval: Duration::from_secs(1800),
            forecast_max_calls: 12,
            forecast_period: Duration::from_secs(3600),
            active_start: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or_default(),
            active_end: NaiveTime::from_hms_opt(13, 0, 0).unwrap_or_default(),
            forecast_threshold: 25000.0,
            forecast_horizon: 15,
            insufficient_forecast_pause: Duration::from_secs(3600),
            min_soc: 10.0,
            apparent_power_limit: 4400.0,
            charge_step: 200,
            charge_power_ceiling: 1500,
            reset_soc_limit: 85.0,
            headroom_baseline: 4600.0,
            retry_attempts: 8,
            retry_base: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Tuning {
    pub fn from_toml(text: &str) -> Result<Self> {
        let tuning: Tuning = toml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn validate(&self) -> Result<()> {
        if self.active_start >= self.active_end {
            return Err(Error::Config(
                "active_start must be before active_end".to_owned(),
            ));
        }
        if self.window_size == 0 {
            return Err(Error::Config("window_size must be positive".to_owned()));
        }
        if self.forecast_max_calls == 0 {
            return Err(Error::Config(
                "forecast_max_calls must be positive".to_owned(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(Error::Config("retry_attempts must be positive".to_owned()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            max_attempts: self.retry_attempts,
            base: self.retry_base,
            max_delay: self.retry_max_delay,
        }
    }

    /// Time to let the smoothing window refill after a change.
    pub fn settle_time(&self) -> Duration {
        self.polling_cycle * (self.window_size / 2) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let tuning = Tuning::from_toml("").unwrap();
        assert_eq!(tuning.polling_cycle, Duration::from_secs(15));
        assert_eq!(tuning.charge_power_ceiling, 1500);
        assert_eq!(tuning.settle_time(), Duration::from_secs(150));
    }

    #[test]
    fn overrides() {
        let tuning = Tuning::from_toml(
            r#"
            polling_cycle = "10s"
            apparent_power_limit = 4450.0
            active_end = "14:00:00"
            "#,
        )
        .unwrap();
        assert_eq!(tuning.polling_cycle, Duration::from_secs(10));
        assert_eq!(tuning.apparent_power_limit, 4450.0);
        assert_eq!(tuning.active_end, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(tuning.settle_time(), Duration::from_secs(100));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(Tuning::from_toml("bogus = 1").is_err());
    }

    #[test]
    fn inverted_window_rejected() {
        assert!(Tuning::from_toml(r#"active_start = "14:00:00""#).is_err());
    }

    #[test]
    fn site_from_args() {
        let cli = Cli::try_parse_from([
            "pvcharge",
            "--url",
            "https://e3dc.local",
            "--username",
            "admin",
            "--password",
            "secret",
            "--latitude",
            "52.5",
            "--longitude",
            "13.4",
            "--declination",
            "30",
            "--azimuth",
            "-10",
        ])
        .unwrap();
        assert_eq!(cli.site.azimuth, -10.0);
        assert!(!cli.dry_run);
        assert!(cli.tuning.is_none());
    }
}
