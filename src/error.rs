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

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network or HTTP failure. Retried before it reaches the caller.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("rate limited, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("power settings rejected with status {status}")]
    SettingsRejected { status: reqwest::StatusCode },

    #[error("phase {0} missing from PV inverter data")]
    MissingPhase(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn transport(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        Error::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Whether repeating the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
