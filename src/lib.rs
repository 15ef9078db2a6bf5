/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of spatial-emb-cluster.

  spatial-emb-cluster is free software: you can redistribute it and/or modify
  it under the terms of the European Union Public License version 1.2 or
  later, as published by the European Commission.

  spatial-emb-cluster is distributed in the hope that it will be useful, but
  WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
  or FITNESS FOR A PARTICULAR PURPOSE. See the European Union Public License
  for more details.

  You should have received a copy of the EUPL in an/all official language(s)
  of the European Union along with spatial-emb-cluster. If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Spatial-emb-cluster is a pure-rust implementation of gaussian
//! spatial-embedding clustering: it converts a dense per-pixel network
//! prediction (embedding offsets, margins and objectness scores) into a
//! discrete set of object instances, across space and time (video volumes).
//!
//! # Features
//! The crate revolves around two clustering routines:
//! 1. *Greedy seed-driven clustering*, which discovers object instances
//! without any label information by repeatedly growing a gaussian proposal
//! around the most confident remaining seed pixel.
//! 2. *Label-supervised clustering*, which renders an instance map from a
//! known label volume by thresholding gaussian similarity to each labelled
//! object's mean embedding. This is a diagnostic routine for inspecting the
//! embedding space against ground truth.
//!
//! Discovered instances can be matched against ground-truth masks with the
//! overlap-scoring utilities, which feed a thread-safe running accuracy
//! meter. Additional functionality is available behind cargo feature gates
//! ([listed below](#cargo-feature-gates)).
//!
//! # Quickstart
//! To use the latest release of spatial-emb-cluster in a cargo project, add
//! the crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! spatial-emb-cluster = "0.1"
//! ```
//!
//! ## Short example: clustering a prediction volume
//! Clustering is configured with the commonly used "builder pattern". To
//! configure a clusterer, create an instance of the `ClusterBuilder` struct.
//! Once you are done specifying options using its associated functions, call
//! `build_volumetric()` (or `build_per_frame()`) to generate a
//! (`Sync`&`Send`) clusterer which owns its coordinate map and can be shared
//! between evaluation threads.
//!
//! In this example, we cluster a prediction volume whose seed channel marks
//! every pixel as a confident candidate:
//! ```rust
//! use spatial_emb_cluster::prelude::*;
//! use ndarray as nd;
//!
//! //A prediction volume with 3 offset channels, 1 margin channel and 1 seed
//! //channel, on 2 frames of 8x8 pixels
//! let mut prediction = nd::Array4::<f32>::zeros((5, 2, 8, 8));
//! prediction.slice_mut(nd::s![4, .., .., ..]).fill(0.9);
//!
//! //Set-up the clusterer
//! let clusterer = ClusterBuilder::new()
//!   .set_min_pixels(4)
//!   .build_volumetric(2, 8, 8)
//!   .unwrap();
//!
//! //Discover instances
//! let (instance_map, instances) = clusterer.cluster(prediction.view()).unwrap();
//! assert_eq!(instance_map.dim(), (2, 8, 8));
//! assert!(!instances.is_empty());
//! ```
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! From the jemalloc website: *"jemalloc is a general purpose `malloc`(3)
//! implementation that emphasizes fragmentation avoidance and scalable
//! concurrency support."*. Jemalloc is enabled though usage of the `jemalloc`
//! crate, which increases compile times considerably. However, enabling this
//! feature can also greatly improve run-time performance, especially on
//! machines with more (>6 or so) cores. To compile `spatial-emb-cluster`
//! with the `jemalloc` feature, jemalloc must be installed on the host
//! system.
//! - `progress`: this feature enables a progress bar tracking how many
//! foreground pixels each clustering call has consumed. Enabling this
//! feature adds the `indicatif` crate as a dependency, which should not
//! considerably slow down compile times.
//! - `debug`: this feature enables debug and performance monitoring output.
//! This can negatively impact performance. Enabling this feature does not
//! add additional dependencies.

//Unconditional imports
use ndarray as nd;
use num_traits::{Num, ToPrimitive};
use rayon::prelude::*;
use thiserror::Error;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

//Progress bar (conditional)
#[cfg(feature = "progress")]
use indicatif;

//Label reserved for background/unassigned pixels
const BACKGROUND: usize = 0;

//Fixed coordinate ranges per axis. These are design constants: they keep the
//(tanh-bounded) embedding offsets small relative to the coordinate spread.
const X_RANGE: (f32, f32) = (0.0, 2.0);
const Y_RANGE: (f32, f32) = (0.0, 1.0);
const Z_RANGE: (f32, f32) = (0.0, 0.1);

//Raw margins are log-space; exp(10·σ) turns them into gaussian precisions.
//The factor 10 tunes cluster tightness and carries no physical unit.
const SIGMA_SCALE: f32 = 10.0;

//Gaussian similarity above which a pixel joins a proposal
const PROPOSAL_THRESHOLD: f32 = 0.5;
//Fraction of a proposal that must still be unclustered for acceptance
const PURITY_THRESHOLD: f32 = 0.5;

const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const DEFAULT_MIN_PIXELS: usize = 128;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::{
    best_overlap, mask_iou, score_and_record, AverageMeter, ClusterBuilder, ClusterError,
    ClusterUtils, DecodedFrame, DecodedVolume, ForegroundPolicy, FrameClusterer,
    FrameCoordinates, Instance, VolumeClusterer, VolumeCoordinates,
  };
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
fn set_up_bar(foreground_px: u64) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] clustered px {pos}/{len}{bar:60}";
  let style = indicatif::ProgressStyle::with_template(TEMPLATE);
  let bar = indicatif::ProgressBar::new(foreground_px);
  bar.set_style(style.unwrap());
  return bar;
}

#[inline]
fn neighbours_8con(index: &(usize, usize)) -> Vec<(usize, usize)> {
  let (x, y): (isize, isize) = (index.0 as isize, index.1 as isize);
  [
    (x + 1, y),
    (x + 1, y + 1),
    (x + 1, y - 1),
    (x, y + 1),
    (x, y - 1),
    (x - 1, y),
    (x - 1, y + 1),
    (x - 1, y - 1),
  ]
  .iter()
  .filter_map(|&(x, y)| if x < 0 || y < 0 { None } else { Some((x as usize, y as usize)) })
  .collect()
}

//Linear ramp over [range.0, range.1] with `steps` samples, endpoint included
#[inline]
fn axis_ramp(range: (f32, f32), steps: usize, idx: usize) -> f32 {
  if steps <= 1 {
    range.0
  } else {
    range.0 + (range.1 - range.0) * idx as f32 / (steps - 1) as f32
  }
}

#[inline]
fn unravel3(flat: usize, height: usize, width: usize) -> (usize, usize, usize) {
  let frame = height * width;
  (flat / frame, (flat % frame) / width, flat % width)
}

#[inline]
fn unravel2(flat: usize, width: usize) -> (usize, usize) {
  (flat / width, flat % width)
}

//A single raw margin is broadcast over all embedding channels
#[inline]
fn margin_at(margins: &[f32], channel: usize) -> f32 {
  if margins.len() == 1 {
    margins[0]
  } else {
    margins[channel]
  }
}

#[inline]
fn gaussian_similarity(px: nd::ArrayView1<f32>, centre: &[f32], margins: &[f32]) -> f32 {
  let mut dist = 0.0f32;
  for (channel, (&emb, &ctr)) in px.iter().zip(centre.iter()).enumerate() {
    let diff = emb - ctr;
    dist += diff * diff * margin_at(margins, channel);
  }
  (-dist).exp()
}

fn check_extent(
  what: &'static str,
  expected: &[usize],
  actual: &[usize],
) -> Result<(), ClusterError> {
  if expected == actual {
    Ok(())
  } else {
    Err(ClusterError::ShapeMismatch {
      what,
      expected: format!("{expected:?}"),
      actual: format!("{actual:?}"),
    })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                             OPTIONAL MODULES                               //
////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub proposal_mus: Vec<usize>,
    pub iterations: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub undersized: usize,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn proposal_avg(&self) -> f64 {
      let num = self.proposal_mus.len() as f64;
      self.proposal_mus.iter().map(|&x| x as f64).sum::<f64>() / num
    }
    pub fn proposal_total(&self) -> f64 {
      self.proposal_mus.iter().map(|&x| x as f64).sum()
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Clustering Summary]---------")?;
      writeln!(f, ">  Looped {}x", self.iterations)?;
      writeln!(
        f,
        ">  Proposals: {} accepted; {} impure; {} undersized",
        self.accepted, self.rejected, self.undersized
      )?;
      writeln!(
        f,
        ">  Proposal Average: {:.1}µs; Σ {:.0}µs",
        self.proposal_avg(),
        self.proposal_total()
      )?;
      writeln!(f, ">--------------------------------+ total")?;
      writeln!(
        f,
        ">  {}ms with {:.1}ms overhead (Δt)",
        self.total_ms,
        self.total_ms as f64 - self.proposal_total() / 1000.0
      )
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  ERRORS                                    //
////////////////////////////////////////////////////////////////////////////////

/// Errors produced by the clustering components.
///
/// Every variant is a caller contract violation: nothing is retried and no
/// partial results are returned. All clustering operations are pure tensor
/// math over in-memory data, so no transient failure modes exist.
#[derive(Debug, Error)]
pub enum ClusterError {
  /// An input tensor disagrees with the declared channel layout or with the
  /// other tensors of the same call.
  #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
  ShapeMismatch { what: &'static str, expected: String, actual: String },

  /// A coordinate-map slice was requested beyond the built extent. The
  /// coordinate map has to be (re)built with a larger extent.
  #[error("requested extent {requested:?} exceeds the built coordinate extent {built:?}")]
  OutOfRange { requested: Vec<usize>, built: Vec<usize> },

  /// The builder was asked for an unusable configuration.
  #[error("invalid clusterer configuration: {0}")]
  Config(String),
}

////////////////////////////////////////////////////////////////////////////////
//                             COORDINATE MAPS                                //
////////////////////////////////////////////////////////////////////////////////

/// Precomputed spatiotemporal coordinate volume.
///
/// Holds a `(3, time, height, width)` grid whose channels are linear ramps:
/// x ∈ \[0,2\] along the width axis, y ∈ \[0,1\] along the height axis and
/// z ∈ \[0,0.1\] along the time axis. The grid is built once with the
/// maximum extents a clusterer has to support and never written afterwards,
/// so views of it can be shared freely between concurrent clustering calls.
#[derive(Debug, Clone)]
pub struct VolumeCoordinates {
  grid: nd::Array4<f32>,
}

impl VolumeCoordinates {
  /// Builds the coordinate volume for the given maximum extents.
  pub fn build(time: usize, height: usize, width: usize) -> Self {
    let grid = nd::Array4::from_shape_fn((3, time, height, width), |(c, t, y, x)| match c {
      0 => axis_ramp(X_RANGE, width, x),
      1 => axis_ramp(Y_RANGE, height, y),
      _ => axis_ramp(Z_RANGE, time, t),
    });
    VolumeCoordinates { grid }
  }

  /// Returns a read-only view of the leading `(time, height, width)`
  /// sub-volume. Requesting an extent larger than the built volume is a
  /// configuration error upstream and yields `ClusterError::OutOfRange`.
  pub fn slice(
    &self,
    time: usize,
    height: usize,
    width: usize,
  ) -> Result<nd::ArrayView4<f32>, ClusterError> {
    let (_, built_t, built_h, built_w) = self.grid.dim();
    if time > built_t || height > built_h || width > built_w {
      return Err(ClusterError::OutOfRange {
        requested: vec![time, height, width],
        built: vec![built_t, built_h, built_w],
      });
    }
    Ok(self.grid.slice(nd::s![.., ..time, ..height, ..width]))
  }

  /// The maximum `(time, height, width)` extent this map was built with.
  pub fn extent(&self) -> (usize, usize, usize) {
    let (_, t, h, w) = self.grid.dim();
    (t, h, w)
  }
}

/// Per-frame variant of [`VolumeCoordinates`]: a `(2, height, width)` grid
/// with only the x and y ramps.
#[derive(Debug, Clone)]
pub struct FrameCoordinates {
  grid: nd::Array3<f32>,
}

impl FrameCoordinates {
  /// Builds the coordinate grid for the given maximum extents.
  pub fn build(height: usize, width: usize) -> Self {
    let grid = nd::Array3::from_shape_fn((2, height, width), |(c, y, x)| match c {
      0 => axis_ramp(X_RANGE, width, x),
      _ => axis_ramp(Y_RANGE, height, y),
    });
    FrameCoordinates { grid }
  }

  /// Returns a read-only view of the leading `(height, width)` sub-grid.
  pub fn slice(&self, height: usize, width: usize) -> Result<nd::ArrayView3<f32>, ClusterError> {
    let (_, built_h, built_w) = self.grid.dim();
    if height > built_h || width > built_w {
      return Err(ClusterError::OutOfRange {
        requested: vec![height, width],
        built: vec![built_h, built_w],
      });
    }
    Ok(self.grid.slice(nd::s![.., ..height, ..width]))
  }

  /// The maximum `(height, width)` extent this map was built with.
  pub fn extent(&self) -> (usize, usize) {
    let (_, h, w) = self.grid.dim();
    (h, w)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                           DECODED PREDICTIONS                              //
////////////////////////////////////////////////////////////////////////////////

/// A volumetric prediction split into its usable sub-tensors.
///
/// - `spatial_emb`: `(3, time, height, width)`, the tanh-bounded offsets
///   added to the coordinate grid. Always finite and within one unit of the
///   coordinate ranges.
/// - `sigma`: `(n_sigma, time, height, width)`, raw log-space margins.
///   Consumers apply `exp(10·σ)` at the moment of distance computation.
/// - `seed_map`: `(time, height, width)`, unnormalized objectness scores.
#[derive(Debug, Clone)]
pub struct DecodedVolume {
  pub spatial_emb: nd::Array4<f32>,
  pub sigma: nd::Array4<f32>,
  pub seed_map: nd::Array3<f32>,
}

/// Per-frame analogue of [`DecodedVolume`] with 2 embedding channels.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
  pub spatial_emb: nd::Array3<f32>,
  pub sigma: nd::Array3<f32>,
  pub seed_map: nd::Array2<f32>,
}

////////////////////////////////////////////////////////////////////////////////
//                          CLUSTERER CONSTRUCTION                            //
////////////////////////////////////////////////////////////////////////////////

/// Policy deciding which seed-map entries count as foreground candidates.
///
/// The greedy clustering loop only ever considers foreground pixels. Which
/// seed values gate a pixel in is an explicit configuration choice:
/// - `NonZero` treats every nonzero seed entry as a candidate (a plain
///   boolean reading of the seed map);
/// - `Threshold(t)` admits only seed values strictly above `t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForegroundPolicy {
  NonZero,
  Threshold(f32),
}

impl ForegroundPolicy {
  #[inline]
  fn admits(&self, seed: f32) -> bool {
    match *self {
      ForegroundPolicy::NonZero => seed != 0.0,
      ForegroundPolicy::Threshold(t) => seed > t,
    }
  }
}

impl Default for ForegroundPolicy {
  fn default() -> Self {
    ForegroundPolicy::NonZero
  }
}

/// Builder for configuring a clusterer.
///
/// Use the associated functions to override the defaults (1 margin channel,
/// score threshold 0.5, 128 minimum pixels per instance, nonzero foreground
/// gating), then call `build_volumetric()` or `build_per_frame()` with the
/// maximum extents the clusterer has to support. Building constructs the
/// coordinate map once; the resulting clusterer is `Sync`&`Send` and can be
/// shared between evaluation threads.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
  n_sigma: usize,
  score_threshold: f32,
  min_pixels: usize,
  foreground: ForegroundPolicy,
}

impl ClusterBuilder {
  /// creates a new `ClusterBuilder` with default options
  pub fn new() -> Self {
    ClusterBuilder {
      n_sigma: 1,
      score_threshold: DEFAULT_SCORE_THRESHOLD,
      min_pixels: DEFAULT_MIN_PIXELS,
      foreground: ForegroundPolicy::NonZero,
    }
  }

  /// Set the number of margin channels in the prediction. Must be 1 (one
  /// margin broadcast over all embedding channels) or equal to the number
  /// of embedding channels (one margin per channel).
  pub fn set_n_sigma(mut self, n_sigma: usize) -> Self {
    self.n_sigma = n_sigma;
    self
  }

  /// Set the seed score below which the greedy loop stops. The boundary is
  /// inclusive: a seed exactly at the threshold is still accepted.
  pub fn set_score_threshold(mut self, score_threshold: f32) -> Self {
    self.score_threshold = score_threshold;
    self
  }

  /// Set the minimum pixel count for a proposal to become an instance. Also
  /// scales the foreground-count early exit and bounds the loop guard.
  pub fn set_min_pixels(mut self, min_pixels: usize) -> Self {
    self.min_pixels = min_pixels;
    self
  }

  /// Set the policy that derives the foreground mask from the seed map.
  pub fn set_foreground_policy(mut self, foreground: ForegroundPolicy) -> Self {
    self.foreground = foreground;
    self
  }

  fn validate(&self, embedding_channels: usize) -> Result<(), ClusterError> {
    if self.n_sigma != 1 && self.n_sigma != embedding_channels {
      Err(ClusterError::Config(format!(
        "n_sigma was set to {}, which can neither be broadcast nor matched against {} embedding channels",
        self.n_sigma, embedding_channels
      )))?
    }
    if !self.score_threshold.is_finite() {
      Err(ClusterError::Config(format!(
        "score threshold {} is not finite",
        self.score_threshold
      )))?
    }
    if let ForegroundPolicy::Threshold(t) = self.foreground {
      if !t.is_finite() {
        Err(ClusterError::Config(format!("foreground threshold {t} is not finite")))?
      }
    }
    Ok(())
  }

  /// Build a [`VolumeClusterer`] supporting predictions up to the given
  /// `(time, height, width)` extent. This function may return an `Err`
  /// result if the builder was not properly configured.
  pub fn build_volumetric(
    self,
    time: usize,
    height: usize,
    width: usize,
  ) -> Result<VolumeClusterer, ClusterError> {
    self.validate(3)?;
    if time == 0 || height == 0 || width == 0 {
      Err(ClusterError::Config(format!(
        "coordinate extent ({time}, {height}, {width}) contains a zero axis"
      )))?
    }
    Ok(VolumeClusterer {
      coords: VolumeCoordinates::build(time, height, width),
      n_sigma: self.n_sigma,
      score_threshold: self.score_threshold,
      min_pixels: self.min_pixels,
      foreground: self.foreground,
    })
  }

  /// Build a [`FrameClusterer`] supporting predictions up to the given
  /// `(height, width)` extent. This function may return an `Err` result if
  /// the builder was not properly configured.
  pub fn build_per_frame(
    self,
    height: usize,
    width: usize,
  ) -> Result<FrameClusterer, ClusterError> {
    self.validate(2)?;
    if height == 0 || width == 0 {
      Err(ClusterError::Config(format!(
        "coordinate extent ({height}, {width}) contains a zero axis"
      )))?
    }
    Ok(FrameClusterer {
      coords: FrameCoordinates::build(height, width),
      n_sigma: self.n_sigma,
      score_threshold: self.score_threshold,
      min_pixels: self.min_pixels,
      foreground: self.foreground,
    })
  }
}

impl Default for ClusterBuilder {
  fn default() -> Self {
    ClusterBuilder::new()
  }
}

////////////////////////////////////////////////////////////////////////////////
//                         GREEDY CLUSTERING CORE                             //
////////////////////////////////////////////////////////////////////////////////

/// One discovered object instance.
///
/// Instances are created one at a time inside the greedy loop and never
/// mutated afterwards. `score` is the seed value at the moment the cluster
/// formed; `centre` is the embedding the proposal was grown around.
#[derive(Debug, Clone)]
pub struct Instance<D: nd::Dimension> {
  /// Binary mask over the full prediction volume.
  pub mask: nd::Array<bool, D>,
  /// Seed value of the pixel this instance was grown from.
  pub score: f32,
  /// Embedding-space centre of the instance (one entry per channel).
  pub centre: Vec<f32>,
}

//An accepted proposal before it is scattered back into the full volume.
//`pixels` holds indices into the foreground selection.
struct FlatInstance {
  pixels: Vec<usize>,
  score: f32,
  centre: Vec<f32>,
}

/*The greedy loop itself, over foreground-restricted flat arrays.

  Both clusterer variants reduce their volumes to the same shape of problem:
  `emb` is (channels, F), `sigma` is (n_sigma, F) and `seed` is (F,) for F
  foreground pixels. The returned label array assigns 0 (background) or an
  instance id to each of the F pixels; ids are 1..=K in creation order.

  Termination: every iteration consumes at least the selected seed pixel, so
  the loop runs at most F times. The score threshold and the min-pixel guard
  typically end it far earlier.
*/
fn greedy_core(
  emb: nd::ArrayView2<f32>,
  sigma: nd::ArrayView2<f32>,
  seed: nd::ArrayView1<f32>,
  score_threshold: f32,
  min_pixels: usize,
) -> (Vec<usize>, Vec<FlatInstance>) {
  let count = seed.len();

  let mut unclustered = vec![true; count];
  let mut labels = vec![BACKGROUND; count];
  let mut remaining = count;
  let mut instances: Vec<FlatInstance> = Vec::new();

  //(logging) set-up progress bar and perf report
  #[cfg(feature = "progress")]
  let bar = set_up_bar(count as u64);
  #[cfg(feature = "debug")]
  let mut perf = performance_monitoring::PerfReport::default();
  #[cfg(feature = "debug")]
  let call_start = std::time::Instant::now();

  while remaining > min_pixels {
    #[cfg(feature = "progress")]
    {
      bar.tick(); //Tick the progressbar
    }
    #[cfg(feature = "debug")]
    {
      perf.iterations += 1;
    }

    //(a) select the unclustered pixel with the highest seed score
    let mut seed_idx = None;
    let mut seed_score = f32::NEG_INFINITY;
    for (px, &score) in seed.iter().enumerate() {
      if unclustered[px] && score > seed_score {
        seed_idx = Some(px);
        seed_score = score;
      }
    }
    let seed_idx = match seed_idx {
      Some(px) => px,
      None => break,
    };

    //(b) no confident seeds left -> done. A seed exactly at the threshold
    //does not break the loop.
    if seed_score < score_threshold {
      break;
    }

    //(c) consume the seed immediately so it can never be re-selected, even
    //when its proposal ends up discarded
    unclustered[seed_idx] = false;
    remaining -= 1;

    //(d) centre and margin are read off the seed pixel
    let centre: Vec<f32> = emb.column(seed_idx).to_vec();
    let margins: Vec<f32> =
      sigma.column(seed_idx).iter().map(|&raw| (raw * SIGMA_SCALE).exp()).collect();

    //(e) grow a proposal: every foreground pixel within the gaussian
    //acceptance radius of the centre
    #[cfg(feature = "debug")]
    let proposal_start = std::time::Instant::now();

    let proposal: Vec<usize> = (0..count)
      .into_par_iter()
      .filter(|&px| gaussian_similarity(emb.column(px), &centre, &margins) > PROPOSAL_THRESHOLD)
      .collect();

    #[cfg(feature = "debug")]
    perf.proposal_mus.push(proposal_start.elapsed().as_micros() as usize);

    //(f)+(g) gate the proposal on size, then on purity
    if proposal.len() > min_pixels {
      let claimed = proposal.iter().filter(|&&px| unclustered[px]).count();
      if claimed as f32 / proposal.len() as f32 > PURITY_THRESHOLD {
        /*Accepted. Pixels already carrying an id keep their assignment,
          which keeps the id map exclusive; the instance mask still records
          the full proposal.
        */
        let id = instances.len() + 1;
        for &px in &proposal {
          if labels[px] == BACKGROUND {
            labels[px] = id;
          }
        }
        instances.push(FlatInstance { pixels: proposal.clone(), score: seed_score, centre });
        #[cfg(feature = "debug")]
        {
          perf.accepted += 1;
        }
      } else {
        //Most of the proposal belongs to earlier instances: the centre
        //drifted, reject it
        #[cfg(feature = "debug")]
        {
          perf.rejected += 1;
        }
      }
    } else {
      //Too small to be a real instance
      #[cfg(feature = "debug")]
      {
        perf.undersized += 1;
      }
    }

    //(h) both accepted and discarded proposals consume their pixels, which
    //guarantees progress and prevents rediscovering the same region
    for &px in &proposal {
      if unclustered[px] {
        unclustered[px] = false;
        remaining -= 1;
      }
    }

    #[cfg(feature = "progress")]
    {
      bar.set_position((count - remaining) as u64);
    }
  }

  //(logging) print performance report
  #[cfg(all(feature = "debug", feature = "progress"))]
  {
    //In this combination we have a progress bar, we should use it to print
    perf.total_ms = call_start.elapsed().as_millis() as usize;
    bar.println(format!("{perf}"));
  }
  #[cfg(all(feature = "debug", not(feature = "progress")))]
  {
    //We do not have a progress bar, so a plain println! will have to do
    perf.total_ms = call_start.elapsed().as_millis() as usize;
    println!("{perf}");
  }

  (labels, instances)
}

////////////////////////////////////////////////////////////////////////////////
//                            VOLUME CLUSTERER                                //
////////////////////////////////////////////////////////////////////////////////

/// Clusterer over spatiotemporal `(time, height, width)` volumes.
///
/// Owns its [`VolumeCoordinates`] map, built once at construction for the
/// maximum supported extents. A single clustering call runs to completion
/// synchronously on the calling thread (the per-pixel math inside is
/// data-parallel); independent calls on independent predictions may run
/// concurrently since the clusterer is never mutated.
#[derive(Debug, Clone)]
pub struct VolumeClusterer {
  coords: VolumeCoordinates,
  n_sigma: usize,
  score_threshold: f32,
  min_pixels: usize,
  foreground: ForegroundPolicy,
}

impl VolumeClusterer {
  /// The coordinate map this clusterer was built with.
  pub fn coordinates(&self) -> &VolumeCoordinates {
    &self.coords
  }

  /// Splits a raw `(3 + n_sigma + 1, time, height, width)` prediction into
  /// its decoded sub-tensors: the tanh-bounded offsets are added to the
  /// matching coordinate slice, margins are kept in raw log form and the
  /// seed channel is squeezed out unnormalized.
  pub fn decode(&self, prediction: nd::ArrayView4<f32>) -> Result<DecodedVolume, ClusterError> {
    let (channels, time, height, width) = prediction.dim();
    let expected = 3 + self.n_sigma + 1;
    if channels != expected {
      return Err(ClusterError::ShapeMismatch {
        what: "prediction channels",
        expected: expected.to_string(),
        actual: channels.to_string(),
      });
    }
    let coords = self.coords.slice(time, height, width)?;

    let spatial_emb = prediction.slice(nd::s![..3, .., .., ..]).mapv(f32::tanh) + &coords;
    let sigma = prediction.slice(nd::s![3..3 + self.n_sigma, .., .., ..]).to_owned();
    let seed_map = prediction.slice(nd::s![3 + self.n_sigma, .., .., ..]).to_owned();

    Ok(DecodedVolume { spatial_emb, sigma, seed_map })
  }

  /// Discovers instances in a raw prediction volume. Equivalent to
  /// [`decode`](Self::decode) followed by
  /// [`cluster_decoded`](Self::cluster_decoded).
  pub fn cluster(
    &self,
    prediction: nd::ArrayView4<f32>,
  ) -> Result<(nd::Array3<usize>, Vec<Instance<nd::Ix3>>), ClusterError> {
    let decoded = self.decode(prediction)?;
    self.cluster_decoded(
      decoded.spatial_emb.view(),
      decoded.sigma.view(),
      decoded.seed_map.view(),
    )
  }

  /// The greedy seed-driven clustering loop.
  ///
  /// Returns the instance-id volume (0 = background, ids 1..=K in creation
  /// order) and the discovered instances in the same order. Every
  /// foreground pixel receives at most one id. Predictions whose foreground
  /// pixel count stays at or below `min_pixels × time` yield an
  /// all-background map and no instances.
  pub fn cluster_decoded(
    &self,
    spatial_emb: nd::ArrayView4<f32>,
    sigma: nd::ArrayView4<f32>,
    seed_map: nd::ArrayView3<f32>,
  ) -> Result<(nd::Array3<usize>, Vec<Instance<nd::Ix3>>), ClusterError> {
    let (emb_channels, time, height, width) = spatial_emb.dim();
    check_extent(
      "spatial embedding",
      &[3, time, height, width],
      &[emb_channels, time, height, width],
    )?;
    let sigma_dim = sigma.dim();
    check_extent(
      "sigma tensor",
      &[self.n_sigma, time, height, width],
      &[sigma_dim.0, sigma_dim.1, sigma_dim.2, sigma_dim.3],
    )?;
    let seed_dim = seed_map.dim();
    check_extent("seed map", &[time, height, width], &[seed_dim.0, seed_dim.1, seed_dim.2])?;

    //(1) foreground gate with early exit for near-empty predictions
    let foreground: Vec<usize> = seed_map
      .iter()
      .enumerate()
      .filter(|&(_, &score)| self.foreground.admits(score))
      .map(|(px, _)| px)
      .collect();
    if foreground.len() <= self.min_pixels * time {
      return Ok((nd::Array3::zeros((time, height, width)), Vec::new()));
    }

    //(2) restrict all three tensors to the foreground, consistently indexed
    let emb_masked = nd::Array2::from_shape_fn((3, foreground.len()), |(c, i)| {
      let (t, y, x) = unravel3(foreground[i], height, width);
      spatial_emb[[c, t, y, x]]
    });
    let sigma_masked = nd::Array2::from_shape_fn((self.n_sigma, foreground.len()), |(c, i)| {
      let (t, y, x) = unravel3(foreground[i], height, width);
      sigma[[c, t, y, x]]
    });
    let seed_masked: nd::Array1<f32> = foreground
      .iter()
      .map(|&px| {
        let (t, y, x) = unravel3(px, height, width);
        seed_map[[t, y, x]]
      })
      .collect();

    //(3)+(4) run the greedy loop over the flattened foreground
    let (labels, flat_instances) = greedy_core(
      emb_masked.view(),
      sigma_masked.view(),
      seed_masked.view(),
      self.score_threshold,
      self.min_pixels,
    );

    //(5) scatter the foreground labels back into the full volume
    let mut instance_map = nd::Array3::<usize>::zeros((time, height, width));
    for (i, &px) in foreground.iter().enumerate() {
      if labels[i] != BACKGROUND {
        instance_map[unravel3(px, height, width)] = labels[i];
      }
    }
    let instances = flat_instances
      .into_iter()
      .map(|flat| {
        let mut mask = nd::Array3::from_elem((time, height, width), false);
        for &local in &flat.pixels {
          mask[unravel3(foreground[local], height, width)] = true;
        }
        Instance { mask, score: flat.score, centre: flat.centre }
      })
      .collect();

    Ok((instance_map, instances))
  }

  /// Renders an instance map from a known label volume.
  ///
  /// For every distinct nonzero label (in ascending order) the mean
  /// embedding and mean margin over the labelled pixels form a gaussian
  /// model; every pixel of the volume within its acceptance radius is
  /// written with the label. Later labels overwrite earlier ones where
  /// models overlap. This is a diagnostic for inspecting the embedding
  /// space against ground truth, not the production clustering path.
  pub fn cluster_with_labels(
    &self,
    spatial_emb: nd::ArrayView4<f32>,
    sigma: nd::ArrayView4<f32>,
    instance_labels: nd::ArrayView3<usize>,
  ) -> Result<nd::Array3<usize>, ClusterError> {
    let (emb_channels, time, height, width) = spatial_emb.dim();
    check_extent(
      "spatial embedding",
      &[3, time, height, width],
      &[emb_channels, time, height, width],
    )?;
    let sigma_dim = sigma.dim();
    check_extent(
      "sigma tensor",
      &[self.n_sigma, time, height, width],
      &[sigma_dim.0, sigma_dim.1, sigma_dim.2, sigma_dim.3],
    )?;
    let labels_dim = instance_labels.dim();
    check_extent(
      "label volume",
      &[time, height, width],
      &[labels_dim.0, labels_dim.1, labels_dim.2],
    )?;

    let mut ids: Vec<usize> =
      instance_labels.iter().copied().filter(|&id| id != BACKGROUND).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut out = nd::Array3::<usize>::zeros((time, height, width));
    for id in ids {
      //Representative centre and margin: means over the labelled pixels
      let mut centre = [0f32; 3];
      let mut margin_sum = vec![0f32; self.n_sigma];
      let mut pixel_count = 0usize;
      for ((t, y, x), &label) in instance_labels.indexed_iter() {
        if label != id {
          continue;
        }
        for (c, acc) in centre.iter_mut().enumerate() {
          *acc += spatial_emb[[c, t, y, x]];
        }
        for (c, acc) in margin_sum.iter_mut().enumerate() {
          *acc += sigma[[c, t, y, x]];
        }
        pixel_count += 1;
      }
      let inv = 1.0 / pixel_count as f32;
      for acc in centre.iter_mut() {
        *acc *= inv;
      }
      let margins: Vec<f32> =
        margin_sum.iter().map(|&sum| (sum * inv * SIGMA_SCALE).exp()).collect();

      //Write every pixel within the gaussian acceptance radius
      nd::Zip::indexed(&mut out).par_for_each(|(t, y, x), px| {
        let mut dist = 0f32;
        for (c, &ctr) in centre.iter().enumerate() {
          let diff = spatial_emb[[c, t, y, x]] - ctr;
          dist += diff * diff * margin_at(&margins, c);
        }
        if (-dist).exp() > PROPOSAL_THRESHOLD {
          *px = id;
        }
      });
    }

    Ok(out)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                             FRAME CLUSTERER                                //
////////////////////////////////////////////////////////////////////////////////

/// Clusterer over single `(height, width)` frames.
///
/// The per-frame counterpart of [`VolumeClusterer`]: predictions carry 2
/// embedding offset channels instead of 3 and the temporal axis disappears
/// from every tensor. See [`VolumeClusterer`] for the shared semantics.
#[derive(Debug, Clone)]
pub struct FrameClusterer {
  coords: FrameCoordinates,
  n_sigma: usize,
  score_threshold: f32,
  min_pixels: usize,
  foreground: ForegroundPolicy,
}

impl FrameClusterer {
  /// The coordinate map this clusterer was built with.
  pub fn coordinates(&self) -> &FrameCoordinates {
    &self.coords
  }

  /// Splits a raw `(2 + n_sigma + 1, height, width)` prediction into its
  /// decoded sub-tensors.
  pub fn decode(&self, prediction: nd::ArrayView3<f32>) -> Result<DecodedFrame, ClusterError> {
    let (channels, height, width) = prediction.dim();
    let expected = 2 + self.n_sigma + 1;
    if channels != expected {
      return Err(ClusterError::ShapeMismatch {
        what: "prediction channels",
        expected: expected.to_string(),
        actual: channels.to_string(),
      });
    }
    let coords = self.coords.slice(height, width)?;

    let spatial_emb = prediction.slice(nd::s![..2, .., ..]).mapv(f32::tanh) + &coords;
    let sigma = prediction.slice(nd::s![2..2 + self.n_sigma, .., ..]).to_owned();
    let seed_map = prediction.slice(nd::s![2 + self.n_sigma, .., ..]).to_owned();

    Ok(DecodedFrame { spatial_emb, sigma, seed_map })
  }

  /// Discovers instances in a raw prediction frame. Equivalent to
  /// [`decode`](Self::decode) followed by
  /// [`cluster_decoded`](Self::cluster_decoded).
  pub fn cluster(
    &self,
    prediction: nd::ArrayView3<f32>,
  ) -> Result<(nd::Array2<usize>, Vec<Instance<nd::Ix2>>), ClusterError> {
    let decoded = self.decode(prediction)?;
    self.cluster_decoded(
      decoded.spatial_emb.view(),
      decoded.sigma.view(),
      decoded.seed_map.view(),
    )
  }

  /// The greedy seed-driven clustering loop over a single frame.
  pub fn cluster_decoded(
    &self,
    spatial_emb: nd::ArrayView3<f32>,
    sigma: nd::ArrayView3<f32>,
    seed_map: nd::ArrayView2<f32>,
  ) -> Result<(nd::Array2<usize>, Vec<Instance<nd::Ix2>>), ClusterError> {
    let (emb_channels, height, width) = spatial_emb.dim();
    check_extent("spatial embedding", &[2, height, width], &[emb_channels, height, width])?;
    let sigma_dim = sigma.dim();
    check_extent(
      "sigma tensor",
      &[self.n_sigma, height, width],
      &[sigma_dim.0, sigma_dim.1, sigma_dim.2],
    )?;
    let seed_dim = seed_map.dim();
    check_extent("seed map", &[height, width], &[seed_dim.0, seed_dim.1])?;

    //(1) foreground gate with early exit for near-empty predictions
    let foreground: Vec<usize> = seed_map
      .iter()
      .enumerate()
      .filter(|&(_, &score)| self.foreground.admits(score))
      .map(|(px, _)| px)
      .collect();
    if foreground.len() <= self.min_pixels {
      return Ok((nd::Array2::zeros((height, width)), Vec::new()));
    }

    //(2) restrict all three tensors to the foreground, consistently indexed
    let emb_masked = nd::Array2::from_shape_fn((2, foreground.len()), |(c, i)| {
      let (y, x) = unravel2(foreground[i], width);
      spatial_emb[[c, y, x]]
    });
    let sigma_masked = nd::Array2::from_shape_fn((self.n_sigma, foreground.len()), |(c, i)| {
      let (y, x) = unravel2(foreground[i], width);
      sigma[[c, y, x]]
    });
    let seed_masked: nd::Array1<f32> = foreground
      .iter()
      .map(|&px| {
        let (y, x) = unravel2(px, width);
        seed_map[[y, x]]
      })
      .collect();

    //(3)+(4) run the greedy loop over the flattened foreground
    let (labels, flat_instances) = greedy_core(
      emb_masked.view(),
      sigma_masked.view(),
      seed_masked.view(),
      self.score_threshold,
      self.min_pixels,
    );

    //(5) scatter the foreground labels back into the full frame
    let mut instance_map = nd::Array2::<usize>::zeros((height, width));
    for (i, &px) in foreground.iter().enumerate() {
      if labels[i] != BACKGROUND {
        instance_map[unravel2(px, width)] = labels[i];
      }
    }
    let instances = flat_instances
      .into_iter()
      .map(|flat| {
        let mut mask = nd::Array2::from_elem((height, width), false);
        for &local in &flat.pixels {
          mask[unravel2(foreground[local], width)] = true;
        }
        Instance { mask, score: flat.score, centre: flat.centre }
      })
      .collect();

    Ok((instance_map, instances))
  }

  /// Renders an instance map from a known label frame. See
  /// [`VolumeClusterer::cluster_with_labels`] for the semantics.
  pub fn cluster_with_labels(
    &self,
    spatial_emb: nd::ArrayView3<f32>,
    sigma: nd::ArrayView3<f32>,
    instance_labels: nd::ArrayView2<usize>,
  ) -> Result<nd::Array2<usize>, ClusterError> {
    let (emb_channels, height, width) = spatial_emb.dim();
    check_extent("spatial embedding", &[2, height, width], &[emb_channels, height, width])?;
    let sigma_dim = sigma.dim();
    check_extent(
      "sigma tensor",
      &[self.n_sigma, height, width],
      &[sigma_dim.0, sigma_dim.1, sigma_dim.2],
    )?;
    let labels_dim = instance_labels.dim();
    check_extent("label frame", &[height, width], &[labels_dim.0, labels_dim.1])?;

    let mut ids: Vec<usize> =
      instance_labels.iter().copied().filter(|&id| id != BACKGROUND).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut out = nd::Array2::<usize>::zeros((height, width));
    for id in ids {
      //Representative centre and margin: means over the labelled pixels
      let mut centre = [0f32; 2];
      let mut margin_sum = vec![0f32; self.n_sigma];
      let mut pixel_count = 0usize;
      for ((y, x), &label) in instance_labels.indexed_iter() {
        if label != id {
          continue;
        }
        for (c, acc) in centre.iter_mut().enumerate() {
          *acc += spatial_emb[[c, y, x]];
        }
        for (c, acc) in margin_sum.iter_mut().enumerate() {
          *acc += sigma[[c, y, x]];
        }
        pixel_count += 1;
      }
      let inv = 1.0 / pixel_count as f32;
      for acc in centre.iter_mut() {
        *acc *= inv;
      }
      let margins: Vec<f32> =
        margin_sum.iter().map(|&sum| (sum * inv * SIGMA_SCALE).exp()).collect();

      nd::Zip::indexed(&mut out).par_for_each(|(y, x), px| {
        let mut dist = 0f32;
        for (c, &ctr) in centre.iter().enumerate() {
          let diff = spatial_emb[[c, y, x]] - ctr;
          dist += diff * diff * margin_at(&margins, c);
        }
        if (-dist).exp() > PROPOSAL_THRESHOLD {
          *px = id;
        }
      });
    }

    Ok(out)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                            UTILITY FUNCTIONS                               //
////////////////////////////////////////////////////////////////////////////////

/// This trait contains useful functions for preparing network output to be
/// used as input for the clustering routines
pub trait ClusterUtils {
  /// The `pre_processor` function can convert a prediction array of any
  /// numeric data-type `T` into an array of `f32`. Special float values
  /// (if `T` is a float type) are mapped to `0.0`, so that NaN or infinite
  /// network output can never gate a pixel into the foreground or poison a
  /// similarity computation.
  fn pre_processor<T, D>(&self, prediction: nd::ArrayView<T, D>) -> nd::Array<f32, D>
  where
    T: Num + Copy + ToPrimitive,
    D: nd::Dimension,
  {
    prediction.mapv(|x| match x.to_f64() {
      Some(float) if float.is_finite() => float as f32,
      _ => 0.0,
    })
  }

  /// returns a vec of the positions of all the pixels that have a higher
  /// seed score than all their 8-way connected neighbours. Useful for
  /// inspecting where the greedy loop will start growing proposals.
  fn find_seed_maxima(&self, seed_map: nd::ArrayView2<f32>) -> Vec<(usize, usize)> {
    //Window size and index of center window pixel
    const WINDOW: (usize, usize) = (3, 3);
    const MID: (usize, usize) = (1, 1);

    nd::Zip::indexed(seed_map.windows(WINDOW))
      .into_par_iter()
      .filter_map(|(idx, window)| {
        //Yield only pixels that score higher than their surroundings
        let target_val = window[MID];
        let neighbour_vals: Vec<f32> =
          neighbours_8con(&MID).into_iter().map(|idx| window[idx]).collect();
        if neighbour_vals.into_iter().all(|val| val < target_val) {
          Some((idx.0 + 1, idx.1 + 1))
        } else {
          None
        }
      })
      .collect()
  }
}

impl ClusterUtils for VolumeClusterer {}
impl ClusterUtils for FrameClusterer {}

////////////////////////////////////////////////////////////////////////////////
//                             OVERLAP SCORING                                //
////////////////////////////////////////////////////////////////////////////////

/// Intersection-over-union of two binary masks of the same shape. An empty
/// union yields 0.
pub fn mask_iou<D: nd::Dimension>(a: nd::ArrayView<bool, D>, b: nd::ArrayView<bool, D>) -> f32 {
  let mut intersection = 0usize;
  let mut union = 0usize;
  nd::Zip::from(&a).and(&b).for_each(|&a_px, &b_px| {
    if a_px && b_px {
      intersection += 1;
    }
    if a_px || b_px {
      union += 1;
    }
  });
  if union == 0 {
    0.0
  } else {
    intersection as f32 / union as f32
  }
}

/// Finds the ground-truth mask with the largest overlap fraction
/// `|mask ∩ gt| / |mask|` against `mask`. Returns the fraction and the
/// index of the matched mask, or `None` when `gt_masks` is empty or `mask`
/// covers no pixels. Ties resolve to the lowest index.
pub fn best_overlap<D: nd::Dimension>(
  mask: nd::ArrayView<bool, D>,
  gt_masks: &[nd::ArrayView<bool, D>],
) -> Option<(f32, usize)> {
  let area = mask.iter().filter(|&&px| px).count();
  if gt_masks.is_empty() || area == 0 {
    return None;
  }
  let best = gt_masks
    .iter()
    .enumerate()
    .map(|(gt_id, gt)| {
      let mut intersection = 0usize;
      nd::Zip::from(&mask).and(gt).for_each(|&mask_px, &gt_px| {
        if mask_px && gt_px {
          intersection += 1;
        }
      });
      (intersection as f32 / area as f32, gt_id)
    })
    .fold(
      (f32::NEG_INFINITY, 0),
      |best, candidate| if candidate.0 > best.0 { candidate } else { best },
    );
  Some(best)
}

/// Scores discovered instances against ground truth and records one
/// accuracy observation into `meter`.
///
/// Each instance (in creation order) is matched to the ground-truth mask
/// with the largest overlap fraction. Per matched mask only the best
/// intersection-over-union achieved across the whole call is kept: the
/// first match always records, later matches overwrite only when strictly
/// higher. The recorded observation is:
/// - `1.0` when there is nothing to find and nothing was found;
/// - one `0.0` per spurious instance when there are no ground-truth masks;
/// - `0.0` when ground truth exists but no instance matched anything;
/// - otherwise the mean of the per-matched-mask best IoUs.
pub fn score_and_record<D: nd::Dimension>(
  instances: &[Instance<D>],
  gt_masks: &[nd::ArrayView<bool, D>],
  meter: &AverageMeter,
) {
  if gt_masks.is_empty() {
    if instances.is_empty() {
      //Nothing to find, nothing found
      meter.update(1.0);
    } else {
      for _ in instances {
        meter.update(0.0);
      }
    }
    return;
  }

  //Track the best iou achieved per matched ground-truth mask
  let mut matched: std::collections::HashMap<usize, f32> = std::collections::HashMap::new();
  for instance in instances {
    if let Some((_, gt_id)) = best_overlap(instance.mask.view(), gt_masks) {
      let iou = mask_iou(instance.mask.view(), gt_masks[gt_id].view());
      let entry = matched.entry(gt_id).or_insert(iou);
      if iou > *entry {
        *entry = iou;
      }
    }
  }

  if matched.is_empty() {
    meter.update(0.0);
  } else {
    let mean = matched.values().map(|&iou| iou as f64).sum::<f64>() / matched.len() as f64;
    meter.update(mean);
  }
}

/// Thread-safe running-average tracker, optionally keyed by class.
///
/// Counts and sums per class live behind a mutual-exclusion lock that is
/// held only for the duration of a single scalar update, so evaluation
/// workers on different threads can share one meter across an entire pass
/// over a dataset.
#[derive(Debug)]
pub struct AverageMeter {
  state: std::sync::Mutex<MeterState>,
}

#[derive(Debug)]
struct MeterState {
  sum: Vec<f64>,
  count: Vec<u64>,
}

impl AverageMeter {
  /// creates a meter tracking `num_classes` independent running averages
  pub fn new(num_classes: usize) -> Self {
    AverageMeter {
      state: std::sync::Mutex::new(MeterState {
        sum: vec![0.0; num_classes.max(1)],
        count: vec![0; num_classes.max(1)],
      }),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, MeterState> {
    //A poisoned lock only means another worker panicked mid-update of two
    //plain counters; the state itself is still consistent
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Records an observation for class 0.
  pub fn update(&self, value: f64) {
    self.update_class(value, 0);
  }

  /// Records an observation for the given class. An out-of-range class
  /// index is a caller programming error and panics.
  pub fn update_class(&self, value: f64, class: usize) {
    let mut state = self.lock();
    state.sum[class] += value;
    state.count[class] += 1;
  }

  /// The running average over all classes (classes without observations
  /// count as 0).
  pub fn average(&self) -> f64 {
    let per_class = self.average_per_class();
    per_class.iter().sum::<f64>() / per_class.len() as f64
  }

  /// The running average per class; classes without observations yield 0.
  pub fn average_per_class(&self) -> Vec<f64> {
    let state = self.lock();
    state
      .sum
      .iter()
      .zip(state.count.iter())
      .map(|(&sum, &count)| if count > 0 { sum / count as f64 } else { 0.0 })
      .collect()
  }

  /// Clears all sums and counts.
  pub fn reset(&self) {
    let mut state = self.lock();
    for sum in state.sum.iter_mut() {
      *sum = 0.0;
    }
    for count in state.count.iter_mut() {
      *count = 0;
    }
  }
}
