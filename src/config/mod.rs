use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, bail};
use url::Url;

use crate::camera::traits::FacingMode;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub bind_addr: SocketAddr,
    pub public_origin: Url,
    pub api_base_url: Url,
    pub api_token: Option<String>,
    pub api_timeout: Duration,
    pub user_id: Option<String>,
    pub festival_id: Option<String>,
    pub camera_device: Option<String>,
    pub camera_input_format: String,
    pub camera_facing: FacingMode,
    pub camera_width: u32,
    pub camera_height: u32,
    pub camera_acquire_timeout: Duration,
    pub capture_timeout: Duration,
    pub jpeg_quality: u8,
    pub scan_debounce: Duration,
    pub geolocation_timeout: Duration,
    pub kiosk_coords: Option<(f64, f64)>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn millis_or(key: &str, default: u64) -> Duration {
    Duration::from_millis(parsed_or(key, default))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let app_name = var_or("APP_NAME", "Cash-Up Kiosk");
        let bind_addr = var_or("BIND_ADDR", "0.0.0.0:8080")
            .parse()
            .context("BIND_ADDR is not a socket address")?;
        let public_origin = Url::parse(&var_or("PUBLIC_ORIGIN", "http://localhost:8080"))
            .context("PUBLIC_ORIGIN is not a valid url")?;
        let api_base_url = Url::parse(&var_or("API_BASE_URL", "http://localhost:8000"))
            .context("API_BASE_URL is not a valid url")?;

        let camera_facing = match var_or("CAMERA_FACING", "environment").as_str() {
            "environment" | "rear" | "back" => FacingMode::Environment,
            "user" | "front" => FacingMode::User,
            "any" => FacingMode::Any,
            other => bail!("unknown CAMERA_FACING value: {other}"),
        };

        let jpeg_quality = parsed_or::<u8>("JPEG_QUALITY", 85).clamp(1, 100);

        let kiosk_coords = match (non_empty("KIOSK_LAT"), non_empty("KIOSK_LNG")) {
            (Some(lat), Some(lng)) => Some((
                lat.trim().parse().context("KIOSK_LAT is not a number")?,
                lng.trim().parse().context("KIOSK_LNG is not a number")?,
            )),
            _ => None,
        };

        Ok(Self {
            app_name,
            bind_addr,
            public_origin,
            api_base_url,
            api_token: non_empty("API_TOKEN"),
            api_timeout: millis_or("API_TIMEOUT_MS", 15_000),
            user_id: non_empty("USER_ID"),
            festival_id: non_empty("FESTIVAL_ID"),
            camera_device: non_empty("CAMERA_DEVICE").filter(|v| v != "auto"),
            camera_input_format: var_or("CAMERA_INPUT_FORMAT", "mjpeg"),
            camera_facing,
            camera_width: parsed_or("CAMERA_WIDTH", 1280),
            camera_height: parsed_or("CAMERA_HEIGHT", 720),
            camera_acquire_timeout: millis_or("CAMERA_ACQUIRE_TIMEOUT_MS", 10_000),
            capture_timeout: millis_or("CAPTURE_TIMEOUT_MS", 3_000),
            jpeg_quality,
            scan_debounce: millis_or("SCAN_DEBOUNCE_MS", 400),
            geolocation_timeout: millis_or("GEOLOCATION_TIMEOUT_MS", 8_000),
            kiosk_coords,
        })
    }
}
