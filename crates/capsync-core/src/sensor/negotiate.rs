// ── Characteristic negotiation ──
//
// Sensors ship with several firmware variants that stream on different
// characteristics. Instead of knowing the variant up front, each data
// candidate is probed: subscribe, START, wait for a frame, STOP.

use std::future::Future;
use std::time::Duration;

use capsync_link::{LinkError, SensorLink};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{GattLayout, SensorConfig};
use crate::error::CoreError;
use crate::model::DeviceId;

/// Run one wireless operation with an upper bound.
pub(crate) async fn bounded<T>(
    limit: Duration,
    target: &str,
    op: impl Future<Output = Result<T, LinkError>>,
) -> Result<T, LinkError> {
    timeout(limit, op).await.unwrap_or_else(|_| {
        Err(LinkError::Io {
            target: target.to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "operation timed out"),
        })
    })
}

/// Write the configuration payload to the first candidate that accepts it.
///
/// Best effort: returns the accepting characteristic, or `None` after
/// `configure_attempts` full passes over the candidates.
pub async fn configure<L: SensorLink>(link: &mut L, config: &SensorConfig) -> Option<Uuid> {
    let gatt = &config.gatt;
    for attempt in 1..=config.configure_attempts {
        for &candidate in &gatt.config_candidates {
            let address = link.address().to_owned();
            match bounded(
                config.op_timeout,
                &address,
                link.write(candidate, &gatt.config_payload),
            )
            .await
            {
                Ok(()) => {
                    debug!(device = %address, characteristic = %candidate, "sensor configured");
                    return Some(candidate);
                }
                Err(e) => {
                    debug!(device = %address, characteristic = %candidate, error = %e, "configuration rejected");
                }
            }
        }
        if attempt < config.configure_attempts {
            sleep(config.configure_pause).await;
        }
    }
    warn!(device = %link.address(), "sensor configuration failed, probing anyway");
    None
}

/// Find the data characteristic that actually streams.
///
/// The winning candidate stays subscribed; every other probed candidate
/// is unsubscribed again. Candidates after the winner are never touched.
pub async fn negotiate<L: SensorLink>(link: &mut L, config: &SensorConfig) -> Result<Uuid, CoreError> {
    let gatt = &config.gatt;
    let address = link.address().to_owned();

    for &candidate in &gatt.data_candidates {
        if let Err(e) = bounded(config.op_timeout, &address, link.subscribe(candidate)).await {
            debug!(device = %address, characteristic = %candidate, error = %e, "subscribe failed");
            continue;
        }

        let hit = match bounded(
            config.op_timeout,
            &address,
            link.write(gatt.control, &gatt.start_opcode),
        )
        .await
        {
            Ok(()) => probe(link, candidate, config.probe_window).await,
            Err(e) => {
                debug!(device = %address, error = %e, "start opcode rejected");
                false
            }
        };

        stop_streaming(link, gatt, config.op_timeout).await;

        if hit {
            info!(device = %address, characteristic = %candidate, "data channel bound");
            return Ok(candidate);
        }
        if let Err(e) = bounded(config.op_timeout, &address, link.unsubscribe(candidate)).await {
            debug!(device = %address, characteristic = %candidate, error = %e, "unsubscribe failed");
        }
    }

    Err(CoreError::Negotiation {
        device: DeviceId::from(address),
        reason: format!(
            "none of {} candidate characteristic(s) produced notifications",
            gatt.data_candidates.len()
        ),
    })
}

/// Wait up to `window` for a notification on `candidate`. Frames from
/// other characteristics are ignored.
async fn probe<L: SensorLink>(link: &mut L, candidate: Uuid, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        match timeout_at(deadline, link.next_notification()).await {
            Ok(Some(n)) if n.characteristic == candidate => return true,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return false,
        }
    }
}

async fn stop_streaming<L: SensorLink>(link: &mut L, gatt: &GattLayout, limit: Duration) {
    let address = link.address().to_owned();
    if let Err(e) = bounded(limit, &address, link.write(gatt.control, &gatt.stop_opcode)).await {
        debug!(device = %address, error = %e, "stop opcode rejected");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::FakeSensor;
    use pretty_assertions::assert_eq;

    fn fast_config() -> SensorConfig {
        SensorConfig {
            probe_window: Duration::from_millis(50),
            configure_pause: Duration::from_millis(5),
            op_timeout: Duration::from_secs(1),
            ..SensorConfig::default()
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
    }

    #[test]
    fn binds_the_candidate_that_streams() {
        let config = fast_config();
        let data = GattLayout::DATA;
        let mut link = FakeSensor::new("AA:01", "Movella DOT").streaming_on(data[1]);

        let bound = rt().block_on(negotiate(&mut link, &config)).unwrap();

        assert_eq!(bound, data[1]);
        let state = link.state();
        assert_eq!(state.subscribed, vec![data[1]]);
        assert_eq!(state.unsubscribed, vec![data[0]]);
        assert!(!state.ever_subscribed.contains(&data[2]));
        assert!(!state.streaming, "probe must leave the sensor stopped");
    }

    #[test]
    fn no_streaming_candidate_is_a_negotiation_failure() {
        let config = fast_config();
        let mut link = FakeSensor::new("AA:02", "Movella DOT");

        let err = rt().block_on(negotiate(&mut link, &config)).unwrap_err();

        assert!(matches!(err, CoreError::Negotiation { .. }));
        assert!(link.state().subscribed.is_empty());
    }

    #[test]
    fn configuration_takes_first_accepting_candidate() {
        let config = fast_config();
        let mut link = FakeSensor::new("AA:03", "Movella DOT")
            .rejecting_writes_to(GattLayout::CONFIG[0]);

        let chosen = rt().block_on(configure(&mut link, &config));

        assert_eq!(chosen, Some(GattLayout::CONFIG[1]));
    }

    #[test]
    fn configuration_is_best_effort() {
        let config = fast_config();
        let mut link = GattLayout::CONFIG
            .iter()
            .fold(FakeSensor::new("AA:04", "Movella DOT"), |l, c| {
                l.rejecting_writes_to(*c)
            });
        assert_eq!(rt().block_on(configure(&mut link, &config)), None);
        let writes = link.state().writes.len();
        assert_eq!(writes, GattLayout::CONFIG.len() * 3);
    }
}
