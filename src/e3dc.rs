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

//! REST access to an E3/DC home power station.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::device::{
    Device, PowerSettings, PowerSettingsRequest, Poll, PviData, SystemInfo, SystemStatus,
};
use crate::config::{Site, Tuning};
use crate::error::{Error, Result};
use crate::retry::{retry, Backoff};

const PATH_POLL: &str = "/api/poll";
const PATH_PVI: &str = "/api/pvi_data";
const PATH_POWER_SETTINGS: &str = "/api/power_settings";
const PATH_SYSTEM_INFO: &str = "/api/system_info";
const PATH_SYSTEM_STATUS: &str = "/api/system_status";

pub struct E3dc {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    backoff: Backoff,
}

impl E3dc {
    pub fn new(site: &Site, tuning: &Tuning) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::ClientBuilder::new()
                .timeout(tuning.request_timeout)
                .danger_accept_invalid_certs(site.insecure)
                .build()?,
            base_url: site.url.trim_end_matches('/').to_owned(),
            username: site.username.clone(),
            password: site.password.clone(),
            backoff: tuning.backoff(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let url = url.as_str();
        retry(&self.backoff, path, move || async move {
            debug!("Requesting {url}");
            self.client
                .get(url)
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|err| Error::transport(path, err))?
                .json()
                .await
                .map_err(|err| Error::transport(path, err))
        })
        .await
    }

    /// Push settings once; a response with an error status is reported,
    /// not retried.
    async fn post_power_settings(&self, body: &PowerSettingsRequest) -> Result<()> {
        let url = self.url(PATH_POWER_SETTINGS);
        let url = url.as_str();
        let response = retry(&self.backoff, PATH_POWER_SETTINGS, move || async move {
            self.client
                .post(url)
                .basic_auth(&self.username, Some(&self.password))
                .json(body)
                .send()
                .await
                .map_err(|err| Error::transport(PATH_POWER_SETTINGS, err))
        })
        .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::SettingsRejected { status })
        }
    }
}

#[async_trait]
impl Device for E3dc {
    async fn poll(&mut self) -> Result<Poll> {
        self.get(PATH_POLL).await
    }

    async fn pvi_data(&mut self) -> Result<PviData> {
        self.get(PATH_PVI).await
    }

    async fn power_settings(&mut self) -> Result<PowerSettings> {
        self.get(PATH_POWER_SETTINGS).await
    }

    async fn system_info(&mut self) -> Result<SystemInfo> {
        self.get(PATH_SYSTEM_INFO).await
    }

    async fn system_status(&mut self) -> Result<SystemStatus> {
        self.get(PATH_SYSTEM_STATUS).await
    }

    async fn set_power_limits(
        &mut self,
        used: bool,
        max_charge_power: i32,
        weather_regulated: bool,
    ) -> Result<bool> {
        let body = PowerSettingsRequest {
            power_limits_used: used,
            max_charge_power,
            weather_regulated_charge_enabled: weather_regulated,
        };
        match self.post_power_settings(&body).await {
            Ok(()) => {
                info!("Power limits set to {used} and max charge power to {max_charge_power}");
                Ok(true)
            }
            Err(err @ Error::SettingsRejected { .. }) => {
                warn!("Failed to set power limits: {err}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestServer;
    use std::time::Duration;

    fn device(server: &TestServer) -> E3dc {
        let site = Site {
            url: server.base_url().to_owned(),
            username: "admin".to_owned(),
            password: "secret".to_owned(),
            insecure: false,
            latitude: 52.5,
            longitude: 13.4,
            declination: 30.0,
            azimuth: 0.0,
        };
        let tuning = Tuning {
            retry_attempts: 3,
            retry_base: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(1),
            ..Tuning::default()
        };
        E3dc::new(&site, &tuning).unwrap()
    }

    #[tokio::test]
    async fn rejected_settings_are_not_retried() {
        let server = TestServer::start(500, "").await;
        let mut device = device(&server);
        let applied = device.set_power_limits(true, 500, false).await.unwrap();
        assert!(!applied);
        assert_eq!(server.requests(), 1);
    }

    #[tokio::test]
    async fn accepted_settings() {
        let server = TestServer::start(200, "{}").await;
        let mut device = device(&server);
        assert!(device.set_power_limits(false, 1500, false).await.unwrap());
        assert_eq!(server.requests(), 1);
    }

    #[tokio::test]
    async fn failed_reads_are_retried() {
        let server = TestServer::start(500, "").await;
        let mut device = device(&server);
        let err = device.poll().await.unwrap_err();
        assert!(matches!(err, Error::Transport { ref endpoint, .. } if endpoint == PATH_POLL));
        assert_eq!(server.requests(), 3);
    }

    #[tokio::test]
    async fn read_poll() {
        let server = TestServer::start(
            200,
            r#"{"consumption": {"house": 610, "battery": 1200},
                "production": {"grid": -300, "solar": 4800},
                "stateOfCharge": 42}"#,
        )
        .await;
        let mut device = device(&server);
        let poll = device.poll().await.unwrap();
        assert_eq!(poll.consumption.battery, 1200.0);
        assert_eq!(poll.state_of_charge, 42.0);
        assert_eq!(server.requests(), 1);
    }
}
