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

//! Solar production forecast from forecast.solar.

use async_trait::async_trait;
use chrono::naive::{NaiveDate, NaiveDateTime};
use chrono::Timelike;
use log::info;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{Site, Tuning};
use crate::error::{Error, Result};
use crate::retry::{retry, Backoff, RateLimit};

pub const HOURS: usize = 24;

#[derive(Clone, Debug, Deserialize)]
pub struct Estimate {
    /// Keyed by local "YYYY-MM-DD HH:MM:SS"
    pub watts: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EstimateResponse {
    pub result: Estimate,
}

/// Forecast power for each hour of the local day.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForecastTable {
    watts: [f64; HOURS],
}

/// Extract the hour from a key of the form "<today> HH...".
fn parse_hour(key: &str, today: &str) -> Option<usize> {
    let rest = key.strip_prefix(today)?.strip_prefix(' ')?;
    let digits = rest.get(0..2)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: usize = digits.parse().ok()?;
    (hour < HOURS).then_some(hour)
}

impl ForecastTable {
    pub fn new(watts: [f64; HOURS]) -> Self {
        Self { watts }
    }

    /// Build the table from the entries for `today`. Other dates and
    /// malformed keys are skipped, and hours without an entry are zero.
    pub fn from_estimate(estimate: &Estimate, today: NaiveDate) -> Self {
        let today = today.format("%Y-%m-%d").to_string();
        let mut watts = [0.0; HOURS];
        for (key, value) in &estimate.watts {
            if let Some(hour) = parse_hour(key, &today) {
                watts[hour] = *value;
            }
        }
        Self { watts }
    }

    pub fn watts(&self) -> &[f64; HOURS] {
        &self.watts
    }

    pub fn daily_total(&self) -> f64 {
        self.watts.iter().sum()
    }

    /// Sum over the hours before `hour`.
    pub fn total_before(&self, hour: usize) -> f64 {
        self.watts[..hour.min(HOURS)].iter().sum()
    }

    /// Production above `baseline` from `from_hour` up to and including
    /// `until_hour`, which is what the battery can absorb.
    pub fn battery_headroom(&self, from_hour: usize, until_hour: usize, baseline: f64) -> f64 {
        if from_hour > until_hour {
            return 0.0;
        }
        self.watts[from_hour.min(HOURS)..(until_hour + 1).min(HOURS)]
            .iter()
            .map(|w| (w - baseline).max(0.0))
            .sum()
    }
}

/// Source of forecasts for the controller.
#[async_trait]
pub trait Forecaster: Send {
    async fn refresh(&mut self, now: NaiveDateTime) -> Result<ForecastTable>;
}

pub struct ForecastClient {
    client: Client,
    url: String,
    limit: RateLimit,
    backoff: Backoff,
}

/// Wait suggested after an HTTP 429: until the top of the next hour.
fn rate_limit_wait(now: NaiveDateTime) -> Duration {
    Duration::from_secs(u64::from(60 - now.minute()) * 60)
}

pub fn estimate_url(site: &Site, kwp: f64) -> String {
    format!(
        "https://api.forecast.solar/estimate/{}/{}/{}/{}/{}",
        site.latitude, site.longitude, site.declination, site.azimuth, kwp
    )
}

impl ForecastClient {
    pub fn new(site: &Site, kwp: f64, tuning: &Tuning) -> reqwest::Result<Self> {
        Self::with_url(estimate_url(site, kwp), tuning)
    }

    pub fn with_url(url: impl Into<String>, tuning: &Tuning) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::ClientBuilder::new()
                .timeout(tuning.request_timeout)
                .build()?,
            url: url.into(),
            limit: RateLimit::new(tuning.forecast_max_calls, tuning.forecast_period),
            backoff: tuning.backoff(),
        })
    }

    async fn estimate(&mut self, now: NaiveDateTime) -> Result<EstimateResponse> {
        let client = &self.client;
        let url = self.url.as_str();
        let limit = &mut self.limit;
        retry(&self.backoff, "forecast request", || {
            let permit = limit.acquire(Instant::now());
            async move {
                permit.map_err(|retry_after| Error::RateLimited { retry_after })?;
                let response = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|err| Error::transport(url, err))?;
                if response.status() == StatusCode::TOO_MANY_REQUESTS {
                    return Err(Error::RateLimited {
                        retry_after: rate_limit_wait(now),
                    });
                }
                response
                    .error_for_status()
                    .map_err(|err| Error::transport(url, err))?
                    .json()
                    .await
                    .map_err(|err| Error::transport(url, err))
            }
        })
        .await
    }
}

#[async_trait]
impl Forecaster for ForecastClient {
    async fn refresh(&mut self, now: NaiveDateTime) -> Result<ForecastTable> {
        info!("Getting solar forecast");
        let response = self.estimate(now).await?;
        Ok(ForecastTable::from_estimate(&response.result, now.date()))
    }
}
