use image::{Rgb, RgbImage};
use serde::Serialize;

use super::normalize::Detection;

/// A detection placed on the currently displayed image, in display pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayBox {
    pub left_px: f64,
    pub top_px: f64,
    pub width_px: f64,
    pub height_px: f64,
    pub label: String,
    pub confidence: f64,
}

/// Scales canonical detections onto a display of the given size. Call again
/// on every layout change; boxes outside the frame are passed through as-is.
pub fn project(detections: &[Detection], display_width: f64, display_height: f64) -> Vec<OverlayBox> {
    detections
        .iter()
        .map(|d| OverlayBox {
            left_px: d.bbox.x_pct * display_width,
            top_px: d.bbox.y_pct * display_height,
            width_px: d.bbox.w_pct * display_width,
            height_px: d.bbox.h_pct * display_height,
            label: d.label.clone(),
            confidence: d.confidence,
        })
        .collect()
}

pub const BOX_COLOR: Rgb<u8> = Rgb([46, 204, 113]);

/// Burns box outlines into `img`, clipping at the image edge.
pub fn draw_boxes(img: &mut RgbImage, boxes: &[OverlayBox], color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clip = |v: f64, max: u32| -> i64 { (v.round() as i64).clamp(-1, i64::from(max)) };

    for b in boxes {
        let x0 = clip(b.left_px, w);
        let y0 = clip(b.top_px, h);
        let x1 = clip(b.left_px + b.width_px, w) - 1;
        let y1 = clip(b.top_px + b.height_px, h) - 1;
        if x1 < x0 || y1 < y0 {
            continue;
        }

        for t in 0..i64::from(thickness) {
            let (lx, rx, ty, by) = (x0 + t, x1 - t, y0 + t, y1 - t);
            if lx > rx || ty > by {
                break;
            }
            for x in lx..=rx {
                put(img, x, ty, color);
                put(img, x, by, color);
            }
            for y in ty..=by {
                put(img, lx, y, color);
                put(img, rx, y, color);
            }
        }
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x < 0 || y < 0 || x >= i64::from(img.width()) || y >= i64::from(img.height()) {
        return;
    }
    img.put_pixel(x as u32, y as u32, color);
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use crate::detection::normalize::{Detection, PctBox};

    use super::{OverlayBox, draw_boxes, project};

    fn detection(x: f64, y: f64, w: f64, h: f64) -> Detection {
        Detection {
            label: "trash".to_string(),
            confidence: 0.87,
            bbox: PctBox {
                x_pct: x,
                y_pct: y,
                w_pct: w,
                h_pct: h,
            },
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn projects_fractions_onto_display_pixels() {
        let boxes = project(&[detection(0.025, 0.025, 0.25, 0.25)], 800.0, 1600.0);
        let b = &boxes[0];
        assert!(approx(b.left_px, 20.0));
        assert!(approx(b.top_px, 40.0));
        assert!(approx(b.width_px, 200.0));
        assert!(approx(b.height_px, 400.0));
    }

    #[test]
    fn doubling_width_doubles_horizontal_geometry_only() {
        let detections = [detection(0.1, 0.2, 0.3, 0.4), detection(0.5, 0.5, 0.7, 0.1)];
        let narrow = project(&detections, 320.0, 240.0);
        let wide = project(&detections, 640.0, 240.0);
        for (n, w) in narrow.iter().zip(&wide) {
            assert!(approx(w.left_px, n.left_px * 2.0));
            assert!(approx(w.width_px, n.width_px * 2.0));
            assert!(approx(w.top_px, n.top_px));
            assert!(approx(w.height_px, n.height_px));
        }
    }

    #[test]
    fn out_of_frame_boxes_are_not_clamped() {
        let boxes = project(&[detection(0.9, 0.9, 0.5, 0.5)], 100.0, 100.0);
        assert!(approx(boxes[0].left_px + boxes[0].width_px, 140.0));
    }

    #[test]
    fn draws_outline_and_clips_overflow() {
        let mut img = RgbImage::new(20, 20);
        let color = Rgb([255, 0, 0]);
        let boxes = [
            OverlayBox {
                left_px: 2.0,
                top_px: 2.0,
                width_px: 6.0,
                height_px: 6.0,
                label: "t".to_string(),
                confidence: 1.0,
            },
            OverlayBox {
                left_px: 15.0,
                top_px: 15.0,
                width_px: 50.0,
                height_px: 50.0,
                label: "t".to_string(),
                confidence: 1.0,
            },
        ];
        draw_boxes(&mut img, &boxes, color, 1);

        assert_eq!(img.get_pixel(2, 2), &color);
        assert_eq!(img.get_pixel(7, 7), &color);
        assert_eq!(img.get_pixel(4, 4), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(15, 19), &color);
        assert_eq!(img.get_pixel(19, 15), &color);
    }
}
