use crate::{
    mask::ClassMask,
    palette::{ClassPalette, MAX_CLASSES},
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationStats {
    pub total_pixels: u64,
    pub segmented_pixels: u64,
    pub segmentation_ratio: f64,
    pub unique_classes: usize,
    /// Fraction of all pixels per class; classes absent from the mask are omitted.
    pub class_distribution: BTreeMap<String, f64>,
    pub class_pixel_counts: BTreeMap<String, u64>,
}

/// Headline numbers without the per-class tables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total_pixels: u64,
    pub segmented_pixels: u64,
    pub segmentation_ratio: f64,
    pub unique_classes: usize,
}

impl SegmentationStats {
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            total_pixels: self.total_pixels,
            segmented_pixels: self.segmented_pixels,
            segmentation_ratio: self.segmentation_ratio,
            unique_classes: self.unique_classes,
        }
    }
}

pub fn aggregate_stats(mask: &ClassMask, palette: &ClassPalette) -> SegmentationStats {
    let mut histogram = [0u64; MAX_CLASSES];
    for id in mask.iter() {
        histogram[id as usize] += 1;
    }

    let total_pixels = mask.len() as u64;
    let mut background_pixels = 0;
    let mut unique_classes = 0;
    let mut class_distribution = BTreeMap::new();
    let mut class_pixel_counts = BTreeMap::new();

    for (index, &count) in histogram.iter().enumerate() {
        if count == 0 {
            continue;
        }
        if palette.is_background(index) {
            background_pixels += count;
        }
        unique_classes += 1;

        let name = palette
            .name(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{}", index));
        class_distribution.insert(name.clone(), count as f64 / total_pixels as f64);
        class_pixel_counts.insert(name, count);
    }

    let segmented_pixels = total_pixels - background_pixels;
    let segmentation_ratio = if total_pixels == 0 {
        0.0
    } else {
        segmented_pixels as f64 / total_pixels as f64
    };

    SegmentationStats {
        total_pixels,
        segmented_pixels,
        segmentation_ratio,
        unique_classes,
        class_distribution,
        class_pixel_counts,
    }
}
