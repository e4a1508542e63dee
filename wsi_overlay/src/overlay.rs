#![allow(missing_docs)]

use crate::nucleus::{Nucleus, NucleusArtifact};
use image::RgbImage;
use imageproc::drawing::draw_line_segment_mut;

/// Offsets covering a stroke `thickness` pixels wide around the centre line.
fn stroke_offsets(thickness: u32) -> std::ops::RangeInclusive<i32> {
    let thickness = thickness.max(1) as i32;
    -((thickness - 1) / 2)..=thickness / 2
}

/// Outline one nucleus in its class colour. Background nuclei are skipped.
pub fn draw_nucleus(tile: &mut RgbImage, nucleus: &Nucleus, thickness: u32) {
    let Some(colour) = nucleus.class.colour() else {
        return;
    };
    let offsets = stroke_offsets(thickness);
    for line in nucleus.contour.exterior().lines() {
        for dx in offsets.clone() {
            for dy in offsets.clone() {
                let (dx, dy) = (dx as f32, dy as f32);
                draw_line_segment_mut(
                    tile,
                    (line.start.x as f32 + dx, line.start.y as f32 + dy),
                    (line.end.x as f32 + dx, line.end.y as f32 + dy),
                    colour,
                );
            }
        }
    }
}

/// Copy of `tile` with every nucleus contour of `artifact` drawn on it.
pub fn render_overlay(tile: &RgbImage, artifact: &NucleusArtifact, thickness: u32) -> RgbImage {
    let mut overlay = tile.clone();
    for nucleus in &artifact.nuclei {
        draw_nucleus(&mut overlay, nucleus, thickness);
    }
    overlay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nucleus::NucleusClass;
    use geo_types::{LineString, Polygon};
    use image::Rgb;

    fn square(class: NucleusClass, at: f64, side: f64) -> Nucleus {
        Nucleus {
            id: "1".to_string(),
            class,
            contour: Polygon::new(
                LineString::from(vec![
                    (at, at),
                    (at + side, at),
                    (at + side, at + side),
                    (at, at + side),
                ]),
                vec![],
            ),
        }
    }

    #[test]
    fn test_stroke_width() {
        assert_eq!(stroke_offsets(1), 0..=0);
        assert_eq!(stroke_offsets(4), -1..=2);
        assert_eq!(stroke_offsets(0), 0..=0);
    }

    #[test]
    fn test_contour_drawn_in_class_colour() {
        let tile = RgbImage::new(40, 40);
        let artifact = NucleusArtifact {
            nuclei: vec![square(NucleusClass::Epithelial, 10.0, 20.0)],
        };
        let overlay = render_overlay(&tile, &artifact, 4);
        let red = Rgb([255, 0, 0]);
        assert_eq!(overlay[(20, 10)], red);
        assert_eq!(overlay[(20, 9)], red);
        assert_eq!(overlay[(20, 12)], red);
        assert_eq!(overlay[(20, 13)], Rgb([0, 0, 0]));
        assert_eq!(overlay[(20, 20)], Rgb([0, 0, 0]));
        assert_eq!(overlay[(30, 20)], red);
        // the source tile is not modified
        assert_eq!(tile[(20, 10)], Rgb([0, 0, 0]));
    }

    #[test]
    fn test_background_is_transparent() {
        let tile = RgbImage::from_pixel(40, 40, Rgb([7, 7, 7]));
        let artifact = NucleusArtifact {
            nuclei: vec![square(NucleusClass::Background, 10.0, 20.0)],
        };
        assert_eq!(render_overlay(&tile, &artifact, 4), tile);
    }

    #[test]
    fn test_contour_clipped_at_tile_edge() {
        let tile = RgbImage::new(16, 16);
        let artifact = NucleusArtifact {
            nuclei: vec![square(NucleusClass::Neutrophil, 8.0, 20.0)],
        };
        let overlay = render_overlay(&tile, &artifact, 1);
        assert_eq!(overlay[(12, 8)], Rgb([0, 0, 255]));
    }
}
