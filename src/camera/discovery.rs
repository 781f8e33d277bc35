use std::collections::BTreeSet;

use anyhow::Result;
use serde::Serialize;
use tokio::process::Command;

use super::traits::{CameraConstraints, CameraDeviceInfo, FacingMode};

#[derive(Debug, Clone, Serialize)]
pub struct CameraProbeInfo {
    pub name: String,
    pub devices: Vec<CameraDeviceInfo>,
}

pub async fn probe_cameras() -> Result<Vec<CameraProbeInfo>> {
    match v4l2_probe().await {
        Ok(list) if !list.is_empty() => Ok(list),
        _ => fallback_probe_from_dev().await,
    }
}

/// Guesses which way a device faces from its driver-reported name.
pub fn infer_facing(name: &str) -> Option<FacingMode> {
    let name = name.to_lowercase();
    if ["back", "rear", "world", "environment"]
        .iter()
        .any(|hint| name.contains(hint))
    {
        return Some(FacingMode::Environment);
    }
    if ["front", "user", "facetime", "integrated", "webcam"]
        .iter()
        .any(|hint| name.contains(hint))
    {
        return Some(FacingMode::User);
    }
    None
}

/// Picks the device for `constraints`: a pinned path wins, then the first
/// device facing the requested way, then any device at all.
pub fn select_device(
    devices: &[CameraDeviceInfo],
    constraints: &CameraConstraints,
) -> Option<CameraDeviceInfo> {
    if let Some(path) = &constraints.device {
        return Some(
            devices
                .iter()
                .find(|d| &d.path == path)
                .cloned()
                .unwrap_or_else(|| CameraDeviceInfo {
                    path: path.clone(),
                    name: path.clone(),
                    facing: None,
                    formats: Vec::new(),
                }),
        );
    }

    if constraints.facing != FacingMode::Any {
        if let Some(found) = devices
            .iter()
            .find(|d| d.facing == Some(constraints.facing))
        {
            return Some(found.clone());
        }
    }

    devices.first().cloned()
}

pub fn flatten(probe: Vec<CameraProbeInfo>) -> Vec<CameraDeviceInfo> {
    probe.into_iter().flat_map(|group| group.devices).collect()
}

async fn v4l2_probe() -> Result<Vec<CameraProbeInfo>> {
    let output = Command::new("v4l2-ctl")
        .arg("--list-devices")
        .output()
        .await?;
    if !output.status.success() {
        return Ok(Vec::new());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut output = Vec::new();
    for (name, paths) in parse_device_groups(&stdout) {
        let facing = infer_facing(&name);
        let mut devices = Vec::new();
        for path in paths {
            let formats = probe_formats(&path).await.unwrap_or_default();
            devices.push(CameraDeviceInfo {
                path,
                name: name.clone(),
                facing,
                formats,
            });
        }
        output.push(CameraProbeInfo { name, devices });
    }

    Ok(output)
}

fn parse_device_groups(listing: &str) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for raw in listing.lines() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }

        if raw.starts_with(' ') || raw.starts_with('\t') {
            let value = line.trim();
            if !value.starts_with("/dev/video") {
                continue;
            }
            if let Some((_, paths)) = groups.last_mut() {
                paths.push(value.to_string());
            }
        } else {
            groups.push((line.trim_end_matches(':').to_string(), Vec::new()));
        }
    }
    groups.retain(|(_, paths)| !paths.is_empty());
    groups
}

async fn probe_formats(device_path: &str) -> Result<Vec<String>> {
    let output = Command::new("v4l2-ctl")
        .args(["--list-formats-ext", "-d", device_path])
        .output()
        .await?;
    if !output.status.success() {
        return Ok(Vec::new());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let formats: BTreeSet<String> = stdout
        .lines()
        .filter_map(|line| {
            let tail = &line[line.find('\'')? + 1..];
            let value = tail[..tail.find('\'')?].trim();
            (!value.is_empty()).then(|| value.to_string())
        })
        .collect();
    Ok(formats.into_iter().collect())
}

async fn fallback_probe_from_dev() -> Result<Vec<CameraProbeInfo>> {
    let mut paths = Vec::new();
    let mut dir = tokio::fs::read_dir("/dev").await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("video") {
            paths.push(format!("/dev/{name}"));
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Ok(Vec::new());
    }

    let devices = paths
        .into_iter()
        .map(|path| CameraDeviceInfo {
            name: path.clone(),
            path,
            facing: None,
            formats: Vec::new(),
        })
        .collect();
    Ok(vec![CameraProbeInfo {
        name: "Detected video devices".to_string(),
        devices,
    }])
}
