use crate::palette::ClassPalette;
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3, ArrayView1, Axis};

/// Per-pixel class scores shaped `(H, W, num_classes)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilities(Array3<f32>);

impl ClassProbabilities {
    pub fn new(scores: Array3<f32>) -> Self {
        Self(scores)
    }

    #[cfg(test)]
    pub fn dim(&self) -> (usize, usize, usize) {
        self.0.dim()
    }
}

/// Grid of class ids, each a valid index into the palette it was decoded for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMask(Array2<u8>);

impl ClassMask {
    #[cfg(test)]
    pub fn new(ids: Array2<u8>) -> Self {
        Self(ids)
    }

    pub fn height(&self) -> usize {
        self.0.nrows()
    }

    pub fn width(&self) -> usize {
        self.0.ncols()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn ids(&self) -> ndarray::ArrayView2<'_, u8> {
        self.0.view()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }
}

/// Highest scoring class per pixel. Ties go to the lowest class index and NaN
/// scores never win.
pub fn argmax(probabilities: &ClassProbabilities) -> ClassMask {
    ClassMask(probabilities.0.map_axis(Axis(2), argmax_lane))
}

fn argmax_lane(scores: ArrayView1<'_, f32>) -> u8 {
    let mut best_index = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (index, &score) in scores.iter().enumerate() {
        if score > best_score {
            best_score = score;
            best_index = index;
        }
    }
    // the inference service caps num_classes at 256
    best_index as u8
}

/// Nearest-neighbour rescale of the class ids. Resizing ids instead of colors
/// keeps class boundaries free of blended colors.
pub fn resize_nearest(mask: &ClassMask, width: u32, height: u32) -> ClassMask {
    let (src_height, src_width) = mask.0.dim();
    let (width, height) = (width as usize, height as usize);
    if (src_height, src_width) == (height, width) {
        return mask.clone();
    }

    ClassMask(Array2::from_shape_fn((height, width), |(y, x)| {
        mask.0[[y * src_height / height, x * src_width / width]]
    }))
}

pub fn colorize(mask: &ClassMask, palette: &ClassPalette) -> RgbImage {
    RgbImage::from_fn(mask.width() as u32, mask.height() as u32, |x, y| {
        Rgb(palette.color(mask.0[[y as usize, x as usize]] as usize))
    })
}
