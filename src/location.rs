use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current(&self) -> Result<Coordinates>;
}

/// Kiosk position from configuration; absent when the kiosk was not placed.
#[derive(Debug, Clone, Default)]
pub struct FixedLocation {
    coords: Option<Coordinates>,
}

impl FixedLocation {
    pub fn new(coords: Option<(f64, f64)>) -> Self {
        Self {
            coords: coords.map(|(latitude, longitude)| Coordinates {
                latitude,
                longitude,
            }),
        }
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current(&self) -> Result<Coordinates> {
        match self.coords {
            Some(coords) => Ok(coords),
            None => bail!("kiosk location is not configured"),
        }
    }
}

/// Best-effort lookup bounded by `limit`. Location never blocks an upload,
/// so every failure collapses to `None`.
pub async fn locate(provider: &dyn LocationProvider, limit: Duration) -> Option<Coordinates> {
    match timeout(limit, provider.current()).await {
        Ok(Ok(coords)) => Some(coords),
        Ok(Err(err)) => {
            warn!("location unavailable: {err:#}");
            None
        }
        Err(_) => {
            warn!("location lookup timed out after {}ms", limit.as_millis());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{Coordinates, FixedLocation, LocationProvider, locate};

    struct Stalled;

    #[async_trait]
    impl LocationProvider for Stalled {
        async fn current(&self) -> anyhow::Result<Coordinates> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::bail!("unreachable")
        }
    }

    #[tokio::test]
    async fn configured_location_is_reported() {
        let provider = FixedLocation::new(Some((35.1, 129.0)));
        let coords = locate(&provider, Duration::from_secs(1)).await;
        assert_eq!(
            coords,
            Some(Coordinates {
                latitude: 35.1,
                longitude: 129.0
            })
        );
    }

    #[tokio::test]
    async fn missing_location_is_none() {
        assert!(locate(&FixedLocation::default(), Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_lookup_gives_up_at_the_limit() {
        assert!(locate(&Stalled, Duration::from_millis(8_000)).await.is_none());
    }
}
