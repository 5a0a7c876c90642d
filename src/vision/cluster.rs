//! Colour simplification by k-means clustering
//!
//! Repaints every pixel with the centroid of its colour cluster, flattening
//! scan noise and gradients while keeping large uniform areas (lines, boxes).
//!
//! Clusters are refitted on every call. Unless a seed is configured the
//! k-means++ initialisation is random, so repeated runs may number the
//! clusters differently; the resulting partition of the image is what matters.

use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView1, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Instant;
use tracing::debug;

use crate::error::{FormError, Result};
use crate::vision::preprocess::ensure_not_empty;

/// Centroid movement below which the fit is considered converged
const CONVERGENCE_TOLERANCE: f32 = 1e-4;

/// Fitted cluster centres, one row per cluster
#[derive(Debug, Clone)]
pub struct KMeans {
    centroids: Array2<f32>,
}

impl KMeans {
    /// Fit `k` clusters to the rows of `points` with k-means++ seeding
    pub fn fit<R: Rng + ?Sized>(
        points: &Array2<f32>,
        k: usize,
        max_iterations: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if k == 0 {
            return Err(FormError::invalid("cluster count must be at least 1"));
        }
        if points.nrows() == 0 {
            return Err(FormError::invalid("cannot cluster an empty point set"));
        }

        let mut centroids = init_plus_plus(points, k, rng);
        let mut labels = vec![0usize; points.nrows()];

        for iteration in 0..max_iterations {
            for (label, point) in labels.iter_mut().zip(points.outer_iter()) {
                *label = nearest(&centroids, point).0;
            }

            let mut sums = Array2::<f32>::zeros(centroids.raw_dim());
            let mut counts = vec![0usize; k];
            for (&label, point) in labels.iter().zip(points.outer_iter()) {
                let mut row = sums.row_mut(label);
                row += &point;
                counts[label] += 1;
            }

            let mut shift = 0.0f32;
            for (c, count) in counts.iter().enumerate() {
                // Empty clusters keep their previous centre
                if *count == 0 {
                    continue;
                }
                let mean = sums.row(c).mapv(|v| v / *count as f32);
                shift = shift.max(squared_distance(centroids.row(c), mean.view()));
                centroids.row_mut(c).assign(&mean);
            }

            if shift < CONVERGENCE_TOLERANCE {
                debug!("k-means converged after {} iterations", iteration + 1);
                break;
            }
        }

        Ok(Self { centroids })
    }

    /// Index of the closest centre for every row of `points`
    pub fn predict(&self, points: &Array2<f32>) -> Vec<usize> {
        points
            .outer_iter()
            .map(|point| nearest(&self.centroids, point).0)
            .collect()
    }

    pub fn centroids(&self) -> &Array2<f32> {
        &self.centroids
    }
}

/// k-means++ seeding: each new centre is drawn with probability proportional
/// to its squared distance from the centres chosen so far
fn init_plus_plus<R: Rng + ?Sized>(points: &Array2<f32>, k: usize, rng: &mut R) -> Array2<f32> {
    let n = points.nrows();
    let mut centroids = Array2::<f32>::zeros((k, points.ncols()));
    centroids
        .row_mut(0)
        .assign(&points.row(rng.random_range(0..n)));

    let mut distances: Vec<f32> = points
        .outer_iter()
        .map(|p| squared_distance(p, centroids.row(0)))
        .collect();

    for c in 1..k {
        let total: f32 = distances.iter().sum();
        let pick = if total <= 0.0 {
            // Fewer distinct colours than clusters
            rng.random_range(0..n)
        } else {
            let mut draw = rng.random::<f32>() * total;
            let mut index = n - 1;
            for (i, d) in distances.iter().enumerate() {
                draw -= d;
                if draw <= 0.0 {
                    index = i;
                    break;
                }
            }
            index
        };

        centroids.row_mut(c).assign(&points.row(pick));
        for (d, p) in distances.iter_mut().zip(points.outer_iter()) {
            *d = (*d).min(squared_distance(p, centroids.row(c)));
        }
    }

    centroids
}

fn nearest(centroids: &Array2<f32>, point: ArrayView1<f32>) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, centre) in centroids.outer_iter().enumerate() {
        let d = squared_distance(point, centre);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Pixels as an `n x 3` matrix of RGB samples
pub fn pixel_matrix(image: &RgbImage) -> Result<Array2<f32>> {
    let n = image.width() as usize * image.height() as usize;
    let samples: Vec<f32> = image.as_raw().iter().map(|&v| v as f32).collect();
    Array2::from_shape_vec((n, 3), samples).map_err(|e| {
        FormError::invalid(format!(
            "pixel buffer does not match {}x{}: {}",
            image.width(),
            image.height(),
            e
        ))
    })
}

/// Reduces an image to at most `clusters` colours
#[derive(Debug, Clone)]
pub struct ColorSimplifier {
    /// Number of colour clusters
    pub clusters: usize,
    /// Maximum Lloyd iterations per fit
    pub max_iterations: usize,
    /// Fit on a random subset of this many pixels (all pixels are repainted)
    pub max_samples: Option<usize>,
    /// Fixed seed for reproducible initialisation
    pub seed: Option<u64>,
}

impl ColorSimplifier {
    pub fn new(clusters: usize) -> Self {
        Self {
            clusters,
            max_iterations: 100,
            max_samples: None,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_samples(mut self, max_samples: Option<usize>) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Repaint each pixel with its cluster centroid
    pub fn simplify(&self, image: &RgbImage) -> Result<RgbImage> {
        if self.clusters < 1 {
            return Err(FormError::invalid("colour cluster count must be at least 1"));
        }
        ensure_not_empty(image.width(), image.height())?;

        let start = Instant::now();
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        let pixels = pixel_matrix(image)?;
        let model = match self.max_samples {
            Some(limit) if limit < pixels.nrows() => {
                let picked: Vec<usize> =
                    rand::seq::index::sample(&mut rng, pixels.nrows(), limit).into_vec();
                let sample = pixels.select(Axis(0), &picked);
                KMeans::fit(&sample, self.clusters, self.max_iterations, &mut rng)?
            }
            _ => KMeans::fit(&pixels, self.clusters, self.max_iterations, &mut rng)?,
        };

        let palette: Vec<Rgb<u8>> = model
            .centroids()
            .outer_iter()
            .map(|c| Rgb([to_channel(c[0]), to_channel(c[1]), to_channel(c[2])]))
            .collect();

        let labels = model.predict(&pixels);
        let mut repainted = RgbImage::new(image.width(), image.height());
        for (pixel, label) in repainted.pixels_mut().zip(labels) {
            *pixel = palette[label];
        }

        debug!(
            "Colour simplification to {} clusters complete in {:?}",
            self.clusters,
            start.elapsed()
        );

        Ok(repainted)
    }
}

fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
