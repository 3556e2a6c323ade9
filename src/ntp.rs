//! One-shot NTP offset calibration against a fixed stratum-1 pool.
//!
//! Built on `rsntp`'s async client, reading `clock_offset()` and
//! `round_trip_delay()` off each probe result. Probes are fanned out with
//! a `tokio::task::JoinSet` since every host's probes run independently
//! and the whole thing degrades gracefully on error rather than needing a
//! `Result`-collecting `join_all`.

use std::time::Duration;

use rand::Rng;
use rsntp::AsyncSntpClient;

/// A fixed pool of stratum-1 / well-known public NTP servers. This is a
/// startup calibration pass, not a continuously steered NTP client, so
/// there's no pool-management logic to speak of.
const NTP_POOL: &[&str] = &[
    "time.cloudflare.com",
    "time.google.com",
    "time.nist.gov",
    "ntp.nict.jp",
    "pool.ntp.org",
    "time.windows.com",
];

const PROBES_PER_HOST: usize = 2;
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const CANDIDATE_POOL_SIZE: usize = 5;
/// Startup is aborted if the chosen offset exceeds this.
pub const MAX_ACCEPTABLE_OFFSET_MILLIS: i64 = 1_000;

#[derive(Debug, Clone, Copy)]
struct HostResult {
    offset_millis: f64,
    rtt_millis: f64,
}

async fn probe_once(host: &str) -> Option<HostResult> {
    let client = AsyncSntpClient::new();
    let result = tokio::time::timeout(PROBE_TIMEOUT, client.synchronize(host))
        .await
        .ok()?
        .ok()?;

    Some(HostResult {
        offset_millis: result.clock_offset().as_secs_f64() * 1000.0,
        rtt_millis: result.round_trip_delay().as_secs_f64() * 1000.0,
    })
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let len = values.len();
    if len % 2 == 1 {
        values[len / 2]
    } else {
        (values[len / 2 - 1] + values[len / 2]) / 2.0
    }
}

/// Queries one host `PROBES_PER_HOST` times, spaced by a 10-60ms jitter,
/// and retains the median of `{offset, rtt}` across the probes that
/// actually came back.
async fn probe_host(host: &'static str) -> Option<HostResult> {
    let mut offsets = Vec::with_capacity(PROBES_PER_HOST);
    let mut rtts = Vec::with_capacity(PROBES_PER_HOST);

    for probe in 0..PROBES_PER_HOST {
        if probe > 0 {
            let jitter_millis = rand::thread_rng().gen_range(10..=60);
            tokio::time::sleep(Duration::from_millis(jitter_millis)).await;
        }

        if let Some(result) = probe_once(host).await {
            offsets.push(result.offset_millis);
            rtts.push(result.rtt_millis);
        }
    }

    if offsets.is_empty() {
        log::debug!("ntp: no responses from {host}");
        return None;
    }

    Some(HostResult {
        offset_millis: median(offsets),
        rtt_millis: median(rtts),
    })
}

/// Runs the full calibration pass: queries every pool host concurrently,
/// ranks by RTT, takes the 5 lowest-RTT responders, re-ranks those by
/// offset, and returns the median-offset entry.
///
/// Returns `Err` if the chosen offset exceeds
/// [`MAX_ACCEPTABLE_OFFSET_MILLIS`], treated as fatal at startup since
/// the local clock is too far out for one-way measurement to mean
/// anything.
pub async fn estimate_offset_millis() -> anyhow::Result<i64> {
    let mut join_set = tokio::task::JoinSet::new();
    for host in NTP_POOL {
        join_set.spawn(probe_host(host));
    }

    let mut results = Vec::new();
    while let Some(outcome) = join_set.join_next().await {
        if let Ok(Some(result)) = outcome {
            results.push(result);
        }
    }

    if results.len() < CANDIDATE_POOL_SIZE {
        log::warn!(
            "ntp: only {} of {} pool hosts responded; continuing with what we have",
            results.len(),
            NTP_POOL.len()
        );
    }

    anyhow::ensure!(!results.is_empty(), "no NTP pool host responded");

    results.sort_by(|a, b| a.rtt_millis.partial_cmp(&b.rtt_millis).unwrap());
    results.truncate(CANDIDATE_POOL_SIZE);
    results.sort_by(|a, b| a.offset_millis.partial_cmp(&b.offset_millis).unwrap());

    let chosen = results[results.len() / 2];
    let offset_millis = chosen.offset_millis.round() as i64;

    anyhow::ensure!(
        offset_millis.abs() <= MAX_ACCEPTABLE_OFFSET_MILLIS,
        "clock offset {offset_millis}ms exceeds the {MAX_ACCEPTABLE_OFFSET_MILLIS}ms startup ceiling"
    );

    log::info!(
        "ntp: calibrated offset {offset_millis}ms from {} of {} pool hosts",
        results.len().min(CANDIDATE_POOL_SIZE),
        NTP_POOL.len()
    );

    Ok(offset_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_odd_and_even_lengths() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(median(vec![5.0]), 5.0);
    }
}
