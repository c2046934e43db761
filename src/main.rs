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

use clap::Parser;
use log::info;

use pvcharge::config::{Cli, Tuning};
use pvcharge::control::{local_now, Controller};
use pvcharge::device::{Device, DryrunDevice};
use pvcharge::e3dc::E3dc;
use pvcharge::forecast::ForecastClient;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
async fn wait_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    };
    Ok(())
}

#[cfg(not(unix))]
async fn wait_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let tuning = match &cli.tuning {
        Some(path) => Tuning::from_toml(&std::fs::read_to_string(path)?)?,
        None => Tuning::default(),
    };

    let mut device = E3dc::new(&cli.site, &tuning)?;
    let system_info = device.system_info().await?;
    info!(
        "Derate power {} W, installed peak power {} Wp, max battery charge power {} W",
        system_info.derate_power, system_info.installed_peak_power, system_info.max_bat_charge_power
    );
    let forecaster = ForecastClient::new(
        &cli.site,
        system_info.installed_peak_power / 1000.0,
        &tuning,
    )?;

    let device: Box<dyn Device> = if cli.dry_run {
        Box::new(DryrunDevice::new(device))
    } else {
        Box::new(device)
    };
    let mut controller = Controller::new(device, Box::new(forecaster), tuning, local_now());

    let token = CancellationToken::new();
    let control_token = token.clone();
    let mut control_handle = tokio::spawn(async move { controller.run(control_token).await });

    tokio::select! {
        // The controller only stops by itself on a fatal error
        result = &mut control_handle => return Ok(result??),
        result = wait_shutdown() => result?,
    }
    info!("Shutting down");
    token.cancel();
    control_handle.await??;
    Ok(())
}
