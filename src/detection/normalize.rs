use serde::Serialize;
use serde_json::{Map, Value};

/// Box encodings emitted by the detector versions we have seen. The
/// encoding is resolved once, when the raw record is parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawBox {
    /// Absolute pixel corners.
    CornersPx { x1: f64, y1: f64, x2: f64, y2: f64 },
    /// Absolute pixel center and size.
    CenterPx { cx: f64, cy: f64, w: f64, h: f64 },
    /// Corners already divided by the source size.
    CornersNorm { x1: f64, y1: f64, x2: f64, y2: f64 },
    /// Center and size already divided by the source size.
    CenterNorm { cx: f64, cy: f64, w: f64, h: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: Option<String>,
    pub confidence: Option<f64>,
    pub geometry: Option<RawBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PctBox {
    pub x_pct: f64,
    pub y_pct: f64,
    pub w_pct: f64,
    pub h_pct: f64,
}

/// A detection in fractions of the source image it was detected on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    #[serde(rename = "box")]
    pub bbox: PctBox,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn count(&self) -> usize {
        self.detections.len()
    }

    pub fn max_confidence(&self) -> f64 {
        self.detections
            .iter()
            .map(|d| d.confidence)
            .fold(0.0, f64::max)
    }
}

const LABEL_KEYS: [&str; 4] = ["class", "label", "name", "class_name"];
const CONFIDENCE_KEYS: [&str; 3] = ["conf", "confidence", "score"];

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| obj.get(*key).and_then(number))
}

fn quad(obj: &Map<String, Value>, key: &str) -> Option<[f64; 4]> {
    let items = obj.get(key)?.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut out = [0.0; 4];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = number(item)?;
    }
    Some(out)
}

/// `inherited` carries a `normalized` flag set on an enclosing record.
fn geometry(obj: &Map<String, Value>, inherited: bool) -> Option<RawBox> {
    let normalized = inherited || obj.get("normalized").and_then(Value::as_bool) == Some(true);
    if let Some(inner) = obj.get("box").and_then(Value::as_object) {
        return geometry(inner, normalized);
    }

    let pixel = if let (Some(x1), Some(y1), Some(x2), Some(y2)) = (
        field(obj, &["x1", "xmin"]),
        field(obj, &["y1", "ymin"]),
        field(obj, &["x2", "xmax"]),
        field(obj, &["y2", "ymax"]),
    ) {
        Some(RawBox::CornersPx { x1, y1, x2, y2 })
    } else if let Some([x1, y1, x2, y2]) = quad(obj, "xyxy")
        .or_else(|| quad(obj, "bbox"))
        .or_else(|| quad(obj, "box"))
    {
        Some(RawBox::CornersPx { x1, y1, x2, y2 })
    } else if let Some([x1, y1, x2, y2]) = quad(obj, "xyxyn") {
        return Some(RawBox::CornersNorm { x1, y1, x2, y2 });
    } else if let Some([cx, cy, w, h]) = quad(obj, "xywhn") {
        return Some(RawBox::CenterNorm { cx, cy, w, h });
    } else if let Some([cx, cy, w, h]) = quad(obj, "xywh") {
        Some(RawBox::CenterPx { cx, cy, w, h })
    } else if let (Some(cx), Some(cy), Some(w), Some(h)) = (
        field(obj, &["cx", "x_center", "x"]),
        field(obj, &["cy", "y_center", "y"]),
        field(obj, &["w", "width"]),
        field(obj, &["h", "height"]),
    ) {
        Some(RawBox::CenterPx { cx, cy, w, h })
    } else {
        None
    };

    match (pixel, normalized) {
        (Some(RawBox::CornersPx { x1, y1, x2, y2 }), true) => {
            Some(RawBox::CornersNorm { x1, y1, x2, y2 })
        }
        (Some(RawBox::CenterPx { cx, cy, w, h }), true) => Some(RawBox::CenterNorm { cx, cy, w, h }),
        (other, _) => other,
    }
}

impl RawDetection {
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self {
                label: None,
                confidence: None,
                geometry: None,
            };
        };

        let label = LABEL_KEYS.iter().find_map(|key| match obj.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        Self {
            label,
            confidence: field(obj, &CONFIDENCE_KEYS),
            geometry: geometry(obj, false),
        }
    }
}

/// Reads the detector's `yoloRaw` payload: a bare array, or an object
/// wrapping one under `detections`/`raw_detections`. Anything else is empty.
pub fn parse_yolo_raw(value: &Value) -> Vec<RawDetection> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj
            .get("detections")
            .or_else(|| obj.get("raw_detections"))
        {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items.iter().map(RawDetection::from_value).collect()
}

impl RawBox {
    /// Corners in source units, plus the divisor that turns them into
    /// fractions of the source image.
    fn corners(self, source_width: f64, source_height: f64) -> ([f64; 4], f64, f64) {
        match self {
            Self::CornersPx { x1, y1, x2, y2 } => ([x1, y1, x2, y2], source_width, source_height),
            Self::CenterPx { cx, cy, w, h } => (
                [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                source_width,
                source_height,
            ),
            Self::CornersNorm { x1, y1, x2, y2 } => ([x1, y1, x2, y2], 1.0, 1.0),
            Self::CenterNorm { cx, cy, w, h } => (
                [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                1.0,
                1.0,
            ),
        }
    }

    fn to_pct(self, source_width: f64, source_height: f64) -> Option<PctBox> {
        let ([x1, y1, x2, y2], basis_w, basis_h) = self.corners(source_width, source_height);
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return None;
        }
        // Detectors overshoot the frame edge by a few pixels; trim the origin.
        let (x1, y1) = (x1.max(0.0), y1.max(0.0));
        let (w, h) = (x2 - x1, y2 - y1);
        if w <= 0.0 || h <= 0.0 {
            return None;
        }
        Some(PctBox {
            x_pct: x1 / basis_w,
            y_pct: y1 / basis_h,
            w_pct: w / basis_w,
            h_pct: h / basis_h,
        })
    }
}

/// Converts raw detector records into canonical detections, keeping input
/// order. Records without usable geometry are dropped.
pub fn normalize(raw: &[RawDetection], source_width: u32, source_height: u32) -> DetectionSet {
    if source_width == 0 || source_height == 0 {
        return DetectionSet::default();
    }
    let (width, height) = (f64::from(source_width), f64::from(source_height));

    let detections = raw
        .iter()
        .filter_map(|record| {
            let bbox = record.geometry?.to_pct(width, height)?;
            let confidence = record
                .confidence
                .filter(|c| c.is_finite())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            Some(Detection {
                label: record.label.clone().unwrap_or_else(|| "unknown".to_string()),
                confidence,
                bbox,
            })
        })
        .collect();

    DetectionSet { detections }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{PctBox, RawBox, RawDetection, normalize, parse_yolo_raw};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn pixel_corners_become_source_fractions() {
        let raw = parse_yolo_raw(&json!([
            {"class": "trash", "conf": 0.87, "x1": 10, "y1": 20, "x2": 110, "y2": 220}
        ]));
        let set = normalize(&raw, 400, 800);

        assert_eq!(set.count(), 1);
        let detection = &set.detections[0];
        assert_eq!(detection.label, "trash");
        assert!(approx(detection.confidence, 0.87));
        let PctBox {
            x_pct,
            y_pct,
            w_pct,
            h_pct,
        } = detection.bbox;
        assert!(approx(x_pct, 0.025));
        assert!(approx(y_pct, 0.025));
        assert!(approx(w_pct, 0.25));
        assert!(approx(h_pct, 0.25));
    }

    #[test]
    fn center_size_matches_the_equivalent_corners() {
        let raw = parse_yolo_raw(&json!([
            {"label": "can", "score": 0.5, "cx": 60, "cy": 120, "w": 100, "h": 200},
            {"label": "can", "score": 0.5, "xyxy": [10, 20, 110, 220]}
        ]));
        let set = normalize(&raw, 400, 800);
        assert_eq!(set.count(), 2);
        assert_eq!(set.detections[0].bbox, set.detections[1].bbox);
    }

    #[test]
    fn normalized_encodings_are_not_divided_again() {
        let raw = parse_yolo_raw(&json!([
            {"name": "bottle", "confidence": 0.4, "xyxyn": [0.1, 0.2, 0.3, 0.6]},
            {"name": "bottle", "confidence": 0.4, "x1": 0.1, "y1": 0.2, "x2": 0.3, "y2": 0.6, "normalized": true}
        ]));
        let set = normalize(&raw, 640, 480);
        assert_eq!(set.count(), 2);
        for detection in &set.detections {
            assert!(approx(detection.bbox.x_pct, 0.1));
            assert!(approx(detection.bbox.h_pct, 0.4));
        }
    }

    #[test]
    fn outer_normalized_flag_applies_to_a_nested_box() {
        let raw = parse_yolo_raw(&json!([
            {"label": "cup", "score": 0.6, "normalized": true,
             "box": {"x1": 0.25, "y1": 0.5, "x2": 0.75, "y2": 1.0}}
        ]));
        let set = normalize(&raw, 640, 480);
        assert_eq!(set.count(), 1);
        let bbox = set.detections[0].bbox;
        assert!(approx(bbox.x_pct, 0.25));
        assert!(approx(bbox.y_pct, 0.5));
        assert!(approx(bbox.w_pct, 0.5));
        assert!(approx(bbox.h_pct, 0.5));
    }

    #[test]
    fn invalid_geometry_is_dropped_and_order_kept() {
        let raw = parse_yolo_raw(&json!([
            {"class": "a", "conf": 0.2, "x1": 0, "y1": 0, "x2": 10, "y2": 10},
            {"class": "no-box", "conf": 0.9},
            {"class": "inverted", "conf": 0.9, "x1": 50, "y1": 50, "x2": 10, "y2": 60},
            "not an object",
            {"class": "b", "conf": 0.6, "bbox": [20, 20, 40, 40]}
        ]));
        let set = normalize(&raw, 100, 100);
        let labels: Vec<&str> = set.detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "b"]);
        assert!(approx(set.max_confidence(), 0.6));
    }

    #[test]
    fn negative_origin_is_trimmed_to_the_frame_edge() {
        let raw = vec![RawDetection {
            label: Some("trash".to_string()),
            confidence: Some(1.7),
            geometry: Some(RawBox::CornersPx {
                x1: -10.0,
                y1: 5.0,
                x2: 50.0,
                y2: 25.0,
            }),
        }];
        let set = normalize(&raw, 100, 100);
        let detection = &set.detections[0];
        assert!(approx(detection.bbox.x_pct, 0.0));
        assert!(approx(detection.bbox.w_pct, 0.5));
        assert!(approx(detection.confidence, 1.0));
    }

    #[test]
    fn boxes_past_the_far_edge_are_kept() {
        let raw = parse_yolo_raw(&json!([{"class": "t", "conf": 0.3, "x1": 90, "y1": 90, "x2": 150, "y2": 130}]));
        let set = normalize(&raw, 100, 100);
        assert!(set.detections[0].bbox.x_pct + set.detections[0].bbox.w_pct > 1.0);
    }

    #[test]
    fn empty_input_and_zero_source_yield_nothing() {
        let set = normalize(&[], 400, 800);
        assert_eq!(set.count(), 0);
        assert_eq!(set.max_confidence(), 0.0);

        let raw = parse_yolo_raw(&json!([{"class": "t", "x1": 1, "y1": 1, "x2": 2, "y2": 2}]));
        assert_eq!(normalize(&raw, 0, 800).count(), 0);
    }

    #[test]
    fn wrapped_and_null_payloads_are_tolerated() {
        let wrapped = json!({"detections": [{"class": "t", "conf": "0.5", "xywh": [5, 5, 2, 2]}]});
        assert_eq!(parse_yolo_raw(&wrapped).len(), 1);
        assert!(parse_yolo_raw(&json!(null)).is_empty());
        assert!(parse_yolo_raw(&json!({"message": "no detections"})).is_empty());
    }
}
