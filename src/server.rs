//! Wiring: turns a loaded [`Config`] into the full set of spawned tasks —
//! one function that builds every collaborator and starts every task.

use std::sync::Arc;

use session::SessionTable;

use crate::{clock::Clock, config::Config, gc, tcp, udp};

/// Builds every collaborator and starts every background task, then
/// blocks on the one thing that's expected to run forever and signal a
/// real failure if it ever returns: the TCP invite listener.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    crate::debug::init(config.debug.show_slots, config.debug.show_stats);

    let offset_millis = if config.clock.clock_is_perfect || config.pps.enabled {
        log::info!("skipping ntp calibration (clock-is-perfect or pps enabled)");
        0
    } else {
        crate::ntp::estimate_offset_millis().await?
    };

    let clock = Clock::new(offset_millis);
    let table = Arc::new(SessionTable::new());
    let project_url: Arc<str> = Arc::from(config.peering.project_url.as_str());

    let socket = udp::bind(config.peering.listen).await?;
    let limiter = Arc::new(udp::TokenBucket::new(config.peering.udp_pps));
    tokio::spawn(udp::run_receiver(socket.clone(), table.clone(), clock.clone(), limiter));

    tokio::spawn(gc::run(table.clone()));
    spawn_ticker(&config, clock.clone(), table.clone())?;

    #[cfg(feature = "metrics")]
    {
        let metrics_listen = config.metrics.listen;
        let telemetry_path = config.metrics.telemetry_path.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::run(metrics_listen, telemetry_path).await {
                log::error!("metrics server exited: {e}");
            }
        });
    }

    for peer_ip in config.peering.peers.clone() {
        let table = table.clone();
        let clock = clock.clone();
        let socket = socket.clone();
        let project_url = project_url.clone();

        tokio::spawn(async move {
            let session = tcp::dial_peer(peer_ip, project_url, table).await;
            crate::engine::run_handshake_phase(session, socket, clock).await;
        });
    }

    tcp::run_invite_listener(config.peering.listen, project_url, table, socket, clock).await
}

fn spawn_ticker(config: &Config, clock: Arc<Clock>, table: Arc<SessionTable>) -> anyhow::Result<()> {
    if config.pps.enabled {
        #[cfg(feature = "pps")]
        {
            let source = crate::clock::pps::LinuxPpsSource::open(&config.pps.path)?;
            tokio::spawn(crate::clock::pps::run_pps_ticker(source, clock, table));
            return Ok(());
        }

        #[cfg(not(feature = "pps"))]
        anyhow::bail!("pps.enabled is set but this binary was built without the `pps` feature");
    }

    tokio::spawn(crate::clock::run_system_ticker(clock, table));
    Ok(())
}
