//! Descriptor matching.
//!
//! One matcher type covers every association the pipeline needs: projection
//! search for tracking, windowed search for monocular initialization,
//! epipolar-constrained search for triangulation, and the fusion search that
//! merges duplicate landmarks. Distances are Hamming over 256-bit
//! descriptors; ambiguous matches are pruned by a nearest-to-second-nearest
//! ratio and, where the caller asks for it, a rotation-consistency histogram
//! that keeps only the three dominant orientation-delta bins.

use std::collections::HashSet;

use nalgebra::{Matrix3, Vector3};

use crate::camera::PinholeCamera;
use crate::features::{Descriptor, Keypoint, ScalePyramid};
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::tracking::frame::Frame;

/// Strict descriptor-distance acceptance bound.
pub const TH_LOW: u32 = 50;
/// Loose descriptor-distance acceptance bound.
pub const TH_HIGH: u32 = 100;
/// Orientation histogram resolution.
pub const HISTO_LENGTH: usize = 30;

/// Buckets for descriptor grouping: comparing only descriptors that share a
/// coarse prefix stands in for vocabulary-node grouping and keeps matching
/// near-linear.
const GROUP_BUCKETS: usize = 64;

#[inline]
fn bucket_of(d: &Descriptor) -> usize {
    (d.0[0] >> 2) as usize % GROUP_BUCKETS
}

fn group_by_bucket<I: Iterator<Item = (usize, Descriptor)>>(items: I) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); GROUP_BUCKETS];
    for (idx, desc) in items {
        groups[bucket_of(&desc)].push(idx);
    }
    groups
}

/// A map point projected into the current frame by the tracker, ready for
/// the local-map search.
#[derive(Debug, Clone)]
pub struct ProjectedPoint {
    pub mp_id: MapPointId,
    pub u: f64,
    pub v: f64,
    /// Predicted pyramid level at the current viewing distance.
    pub predicted_level: usize,
    /// Cosine between the viewing ray and the point's mean normal.
    pub view_cos: f64,
    pub descriptor: Descriptor,
}

pub struct Matcher {
    nn_ratio: f64,
    check_orientation: bool,
}

impl Matcher {
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    // ── Local-map projection search ─────────────────────────────────────

    /// Match projected local map points against the frame's free keypoints.
    /// `th` widens the search window (e.g. after relocalization).
    pub fn search_by_projection_local(
        &self,
        frame: &mut Frame,
        candidates: &[ProjectedPoint],
        th: f64,
        pyramid: &ScalePyramid,
    ) -> usize {
        let mut matches = 0;

        for cand in candidates {
            let level = cand.predicted_level;
            let radius = radius_by_viewing_cos(cand.view_cos) * th * pyramid.scale(level);
            let min_level = level.saturating_sub(1);
            let idxs = frame.features_in_area(cand.u, cand.v, radius, Some(min_level), Some(level));
            if idxs.is_empty() {
                continue;
            }

            let mut best = (u32::MAX, usize::MAX, usize::MAX); // dist, slot, level
            let mut second = (u32::MAX, usize::MAX);
            for idx in idxs {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                let dist = cand.descriptor.distance(&frame.descriptors[idx]);
                if dist < best.0 {
                    second = (best.0, best.2);
                    best = (dist, idx, frame.keypoints[idx].octave);
                } else if dist < second.0 {
                    second = (dist, frame.keypoints[idx].octave);
                }
            }

            if best.0 <= TH_HIGH {
                // The ratio test only discriminates within one octave.
                if best.2 == second.1 && best.0 as f64 > self.nn_ratio * second.0 as f64 {
                    continue;
                }
                frame.map_points[best.1] = Some(cand.mp_id);
                matches += 1;
            }
        }

        matches
    }

    // ── Last-frame projection search (motion-model tracking) ────────────

    /// Project the last frame's associations into the current frame using
    /// the pose prior. Octave search bands follow the camera's forward /
    /// backward motion for depth-capable sensors.
    pub fn search_by_projection_last(
        &self,
        frame: &mut Frame,
        last: &Frame,
        map: &Map,
        th: f64,
        is_mono: bool,
    ) -> usize {
        let Some(pose_cw) = frame.pose_cw.clone() else {
            return 0;
        };
        let Some(last_pose_cw) = last.pose_cw.clone() else {
            return 0;
        };
        let pyramid = map.pyramid();

        // Current camera center expressed in the last camera: its z decides
        // whether we moved forward or backward along the optical axis.
        let twc = pose_cw.inverse().translation;
        let tlc = last_pose_cw.transform_point(&twc);
        let baseline = frame.camera.baseline();
        let forward = !is_mono && tlc.z > baseline;
        let backward = !is_mono && -tlc.z > baseline;

        let mut hist = RotationHistogram::new();
        let mut assigned: Vec<(usize, usize)> = Vec::new(); // (current slot, last slot)

        for (slot, mp_entry) in last.map_points.iter().enumerate() {
            let Some(raw_id) = *mp_entry else { continue };
            if last.outliers[slot] {
                continue;
            }
            let Some(mp_id) = map.resolve(raw_id) else {
                continue;
            };
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };

            let p_cam = pose_cw.transform_point(&mp.position);
            let Some(uv) = frame.camera.project(&p_cam) else {
                continue;
            };
            if !frame.camera.in_image(uv.x, uv.y) {
                continue;
            }

            let last_octave = last.keypoints[slot].octave;
            let radius = th * pyramid.scale(last_octave);
            let (min_level, max_level) = if forward {
                (Some(last_octave), None)
            } else if backward {
                (None, Some(last_octave))
            } else {
                (Some(last_octave.saturating_sub(1)), Some(last_octave + 1))
            };

            let idxs = frame.features_in_area(uv.x, uv.y, radius, min_level, max_level);
            if idxs.is_empty() {
                continue;
            }

            let predicted_ur = frame.camera.right_eye_u(uv.x, p_cam.z);
            let mut best = (u32::MAX, usize::MAX);
            for idx in idxs {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                if let Some(ur) = frame.u_right[idx] {
                    if (predicted_ur - ur).abs() > radius {
                        continue;
                    }
                }
                let dist = mp.descriptor.distance(&frame.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, idx);
                }
            }

            if best.0 <= TH_HIGH {
                frame.map_points[best.1] = Some(mp_id);
                assigned.push((best.1, slot));
                if self.check_orientation {
                    hist.add(
                        angle_diff(&last.keypoints[slot], &frame.keypoints[best.1]),
                        assigned.len() - 1,
                    );
                }
            }
        }

        let mut matches = assigned.len();
        if self.check_orientation {
            for dropped in hist.outlier_entries() {
                let (cur_slot, _) = assigned[dropped];
                frame.map_points[cur_slot] = None;
                matches -= 1;
            }
        }
        matches
    }

    // ── Reference-keyframe search (descriptor grouping) ─────────────────

    /// Match the frame against a keyframe's map-point-bearing keypoints,
    /// comparing only descriptors in the same coarse group.
    pub fn search_by_descriptors(
        &self,
        frame: &mut Frame,
        map: &Map,
        kf_id: KeyFrameId,
    ) -> usize {
        let Some(kf) = map.keyframe(kf_id) else {
            return 0;
        };

        // Keyframe slots that carry a live landmark.
        let kf_slots: Vec<(usize, MapPointId)> = kf
            .map_point_slots()
            .filter_map(|(slot, mp)| map.resolve(mp).map(|id| (slot, id)))
            .collect();
        let kf_groups = group_by_bucket(
            kf_slots
                .iter()
                .enumerate()
                .map(|(i, (slot, _))| (i, kf.descriptors[*slot])),
        );
        let frame_groups = group_by_bucket(
            frame
                .descriptors
                .iter()
                .enumerate()
                .map(|(i, d)| (i, *d)),
        );

        let mut hist = RotationHistogram::new();
        let mut assigned: Vec<usize> = Vec::new(); // frame slots, for histogram pruning
        let mut used_frame_slots = vec![false; frame.num_features()];
        let mut matches = 0;

        for bucket in 0..GROUP_BUCKETS {
            for &entry_idx in &kf_groups[bucket] {
                let (kf_slot, mp_id) = kf_slots[entry_idx];
                let desc = &kf.descriptors[kf_slot];

                let mut best = (u32::MAX, usize::MAX);
                let mut second = u32::MAX;
                for &fidx in &frame_groups[bucket] {
                    if used_frame_slots[fidx] || frame.map_points[fidx].is_some() {
                        continue;
                    }
                    let dist = desc.distance(&frame.descriptors[fidx]);
                    if dist < best.0 {
                        second = best.0;
                        best = (dist, fidx);
                    } else if dist < second {
                        second = dist;
                    }
                }

                if best.0 <= TH_LOW && (best.0 as f64) < self.nn_ratio * second as f64 {
                    frame.map_points[best.1] = Some(mp_id);
                    used_frame_slots[best.1] = true;
                    matches += 1;
                    if self.check_orientation {
                        hist.add(
                            angle_diff(&kf.keypoints[kf_slot], &frame.keypoints[best.1]),
                            assigned.len(),
                        );
                    }
                    assigned.push(best.1);
                }
            }
        }

        if self.check_orientation {
            for dropped in hist.outlier_entries() {
                frame.map_points[assigned[dropped]] = None;
                matches -= 1;
            }
        }
        matches
    }

    // ── Relocalization projection search ────────────────────────────────

    /// Project a keyframe's landmarks into the frame to recover matches the
    /// PnP seed missed. Points in `already_found` are skipped.
    pub fn search_by_projection_reloc(
        &self,
        frame: &mut Frame,
        map: &Map,
        kf_id: KeyFrameId,
        already_found: &HashSet<MapPointId>,
        th: f64,
        orb_dist: u32,
    ) -> usize {
        let Some(pose_cw) = frame.pose_cw.clone() else {
            return 0;
        };
        let Some(kf) = map.keyframe(kf_id) else {
            return 0;
        };
        let pyramid = map.pyramid();
        let mut matches = 0;

        for (_, raw_id) in kf.map_point_slots() {
            let Some(mp_id) = map.resolve(raw_id) else {
                continue;
            };
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };

            let p_cam = pose_cw.transform_point(&mp.position);
            let Some(uv) = frame.camera.project(&p_cam) else {
                continue;
            };
            if !frame.camera.in_image(uv.x, uv.y) {
                continue;
            }
            let dist3d = (mp.position - pose_cw.inverse().translation).norm();
            if !mp.is_in_distance_range(dist3d) {
                continue;
            }

            let level = pyramid.predict_level(dist3d, mp.max_distance);
            let radius = th * pyramid.scale(level);
            let idxs = frame.features_in_area(
                uv.x,
                uv.y,
                radius,
                Some(level.saturating_sub(1)),
                Some(level + 1),
            );

            let mut best = (u32::MAX, usize::MAX);
            for idx in idxs {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                let dist = mp.descriptor.distance(&frame.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, idx);
                }
            }
            if best.0 <= orb_dist {
                frame.map_points[best.1] = Some(mp_id);
                matches += 1;
            }
        }

        matches
    }

    // ── Monocular initialization search ─────────────────────────────────

    /// Windowed search between the initial frame and the current one.
    /// `prev_matched` carries the previous match position per reference
    /// keypoint and is updated in place, letting the window follow the
    /// features across the init attempts.
    pub fn search_for_initialization(
        &self,
        f1: &Frame,
        f2: &Frame,
        prev_matched: &mut [(f64, f64)],
        window: f64,
    ) -> (usize, Vec<Option<usize>>) {
        let mut matches12: Vec<Option<usize>> = vec![None; f1.num_features()];
        let mut matched_dist2 = vec![u32::MAX; f2.num_features()];
        let mut matched21: Vec<Option<usize>> = vec![None; f2.num_features()];
        let mut hist = RotationHistogram::new();
        let mut n_matches = 0;

        for i1 in 0..f1.num_features() {
            let kp1 = &f1.keypoints[i1];
            if kp1.octave > 0 {
                continue;
            }
            let (px, py) = prev_matched[i1];
            let idxs = f2.features_in_area(px, py, window, Some(0), Some(0));
            if idxs.is_empty() {
                continue;
            }

            let d1 = &f1.descriptors[i1];
            let mut best = (u32::MAX, usize::MAX);
            let mut second = u32::MAX;
            for idx in idxs {
                let dist = d1.distance(&f2.descriptors[idx]);
                if matched_dist2[idx] <= dist {
                    continue;
                }
                if dist < best.0 {
                    second = best.0;
                    best = (dist, idx);
                } else if dist < second {
                    second = dist;
                }
            }

            if best.0 <= TH_LOW && (best.0 as f64) < (second as f64) * self.nn_ratio {
                let i2 = best.1;
                // Steal the match if another reference keypoint held it.
                if let Some(prev_i1) = matched21[i2] {
                    matches12[prev_i1] = None;
                    n_matches -= 1;
                }
                matches12[i1] = Some(i2);
                matched21[i2] = Some(i1);
                matched_dist2[i2] = best.0;
                n_matches += 1;
                if self.check_orientation {
                    hist.add(angle_diff(&f1.keypoints[i1], &f2.keypoints[i2]), i1);
                }
            }
        }

        if self.check_orientation {
            for i1 in hist.outlier_entries() {
                if matches12[i1].is_some() {
                    matches12[i1] = None;
                    n_matches -= 1;
                }
            }
        }

        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = m {
                prev_matched[i1] = (f2.keypoints[*i2].x, f2.keypoints[*i2].y);
            }
        }

        (n_matches.max(0) as usize, matches12)
    }

    // ── Epipolar-constrained keyframe search (triangulation) ────────────

    /// Match unassociated keypoints of two keyframes under the fundamental
    /// matrix `f12` (`x1ᵀ F₁₂ x2 = 0`). Points close to the epipole in the
    /// second view carry no parallax and are rejected unless stereo depth
    /// vouches for them.
    pub fn search_for_triangulation(
        &self,
        map: &Map,
        kf1_id: KeyFrameId,
        kf2_id: KeyFrameId,
        f12: &Matrix3<f64>,
        camera: &PinholeCamera,
    ) -> Vec<(usize, usize)> {
        let (Some(kf1), Some(kf2)) = (map.keyframe(kf1_id), map.keyframe(kf2_id)) else {
            return Vec::new();
        };
        let pyramid = map.pyramid();

        // Epipole: camera-1 center in image 2.
        let c1_in_2 = kf2.pose_cw().transform_point(&kf1.camera_center());
        let epipole = camera.project(&c1_in_2);

        let free1: Vec<usize> = (0..kf1.num_features())
            .filter(|&i| kf1.map_point(i).is_none())
            .collect();
        let free2: Vec<usize> = (0..kf2.num_features())
            .filter(|&i| kf2.map_point(i).is_none())
            .collect();
        let groups2 = group_by_bucket(free2.iter().map(|&i| (i, kf2.descriptors[i])));

        let mut matched2 = vec![false; kf2.num_features()];
        let mut pairs = Vec::new();

        for &idx1 in &free1 {
            let kp1 = &kf1.keypoints[idx1];
            let d1 = &kf1.descriptors[idx1];
            let stereo1 = kf1.u_right[idx1].is_some();

            let mut best = (TH_LOW + 1, usize::MAX);
            for &idx2 in &groups2[bucket_of(d1)] {
                if matched2[idx2] {
                    continue;
                }
                let kp2 = &kf2.keypoints[idx2];
                let stereo2 = kf2.u_right[idx2].is_some();

                if !stereo1 && !stereo2 {
                    if let Some(e) = epipole {
                        let dex = e.x - kp2.x;
                        let dey = e.y - kp2.y;
                        if dex * dex + dey * dey < 100.0 * pyramid.scale(kp2.octave) {
                            continue;
                        }
                    }
                }

                if !check_dist_epipolar_line(kp1, kp2, f12, pyramid.sigma2(kp2.octave)) {
                    continue;
                }

                let dist = d1.distance(&kf2.descriptors[idx2]);
                if dist < best.0 {
                    best = (dist, idx2);
                }
            }

            if best.0 <= TH_LOW {
                matched2[best.1] = true;
                pairs.push((idx1, best.1));
            }
        }

        pairs
    }

    // ── Fusion ──────────────────────────────────────────────────────────

    /// Project `candidates` into a keyframe and fuse duplicates: a free
    /// keypoint gains an observation; a keypoint already bound to another
    /// point keeps whichever landmark has more observations and routes the
    /// loser through its replacement pointer. Returns the number of fused or
    /// newly observed points.
    pub fn fuse(
        &self,
        map: &mut Map,
        kf_id: KeyFrameId,
        candidates: &[MapPointId],
        camera: &PinholeCamera,
        th: f64,
    ) -> usize {
        let mut fused = 0;

        for &raw_id in candidates {
            let Some(mp_id) = map.resolve(raw_id) else {
                continue;
            };

            // Snapshot both entities; mutation happens after the decision.
            let decision = {
                let (Some(mp), Some(kf)) = (map.map_point(mp_id), map.keyframe(kf_id)) else {
                    continue;
                };
                if kf.bad || mp.is_observed_by(kf_id) {
                    continue;
                }
                let pyramid = map.pyramid();

                let p_cam = kf.pose_cw().transform_point(&mp.position);
                let Some(uv) = camera.project(&p_cam) else {
                    continue;
                };
                if !camera.in_image(uv.x, uv.y) {
                    continue;
                }

                let view_dir = mp.position - kf.camera_center();
                let dist3d = view_dir.norm();
                if !mp.is_in_distance_range(dist3d) {
                    continue;
                }
                // Behind the mean viewing direction.
                if mp.normal.norm() > 1e-9 && view_dir.dot(&mp.normal) < 0.5 * dist3d {
                    continue;
                }

                let level = pyramid.predict_level(dist3d, mp.max_distance);
                let radius = th * pyramid.scale(level);
                let idxs = kf.features_in_area(
                    uv.x,
                    uv.y,
                    radius,
                    Some(level.saturating_sub(1)),
                    Some(level),
                );

                let predicted_ur = camera.right_eye_u(uv.x, p_cam.z);
                let mut best = (u32::MAX, usize::MAX);
                for idx in idxs {
                    let kp = &kf.keypoints[idx];
                    let inv_sigma2 = pyramid.inv_sigma2(kp.octave);
                    let eu = uv.x - kp.x;
                    let ev = uv.y - kp.y;
                    // χ² gate on the reprojection, with the right-eye term
                    // when disparity exists.
                    if let Some(ur) = kf.u_right[idx] {
                        let er = predicted_ur - ur;
                        if (eu * eu + ev * ev + er * er) * inv_sigma2 > 7.8 {
                            continue;
                        }
                    } else if (eu * eu + ev * ev) * inv_sigma2 > 5.99 {
                        continue;
                    }

                    let dist = mp.descriptor.distance(&kf.descriptors[idx]);
                    if dist < best.0 {
                        best = (dist, idx);
                    }
                }

                if best.0 > TH_LOW {
                    continue;
                }
                (best.1, kf.map_point(best.1))
            };

            let (slot, existing) = decision;
            match existing {
                Some(other_raw) => {
                    let Some(other_id) = map.resolve(other_raw) else {
                        // Slot points at a dead landmark: rebind it.
                        map.associate(kf_id, slot, mp_id);
                        fused += 1;
                        continue;
                    };
                    if other_id == mp_id {
                        continue;
                    }
                    let mp_obs = map.map_point(mp_id).map_or(0, |m| m.num_observations());
                    let other_obs = map.map_point(other_id).map_or(0, |m| m.num_observations());
                    if other_obs >= mp_obs {
                        map.replace_map_point(mp_id, other_id);
                    } else {
                        map.replace_map_point(other_id, mp_id);
                    }
                    fused += 1;
                }
                None => {
                    map.associate(kf_id, slot, mp_id);
                    fused += 1;
                }
            }
        }

        fused
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(0.6, true)
    }
}

/// Tighter windows when the point is viewed nearly head-on.
fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

/// Distance of `kp2` to the epipolar line of `kp1`, gated at the 1-dof χ²
/// bound scaled by the octave variance.
fn check_dist_epipolar_line(
    kp1: &Keypoint,
    kp2: &Keypoint,
    f12: &Matrix3<f64>,
    sigma2_kp2: f64,
) -> bool {
    // l2 = F₁₂ᵀ x1
    let a = kp1.x * f12[(0, 0)] + kp1.y * f12[(1, 0)] + f12[(2, 0)];
    let b = kp1.x * f12[(0, 1)] + kp1.y * f12[(1, 1)] + f12[(2, 1)];
    let c = kp1.x * f12[(0, 2)] + kp1.y * f12[(1, 2)] + f12[(2, 2)];

    let num = a * kp2.x + b * kp2.y + c;
    let den = a * a + b * b;
    if den <= 0.0 {
        return false;
    }
    let dsqr = num * num / den;
    dsqr < 3.84 * sigma2_kp2
}

fn angle_diff(kp1: &Keypoint, kp2: &Keypoint) -> f64 {
    let mut rot = kp1.angle - kp2.angle;
    if rot < 0.0 {
        rot += 360.0;
    }
    rot
}

/// Orientation-delta histogram keeping only the three dominant bins.
struct RotationHistogram {
    bins: Vec<Vec<usize>>,
    factor: f64,
}

impl RotationHistogram {
    fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
            factor: HISTO_LENGTH as f64 / 360.0,
        }
    }

    fn add(&mut self, angle: f64, entry: usize) {
        let mut bin = (angle * self.factor).round() as usize;
        if bin == HISTO_LENGTH {
            bin = 0;
        }
        self.bins[bin.min(HISTO_LENGTH - 1)].push(entry);
    }

    /// Entries outside the three best-populated bins.
    fn outlier_entries(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.bins[i].len()));

        let max1 = self.bins[order[0]].len();
        let mut keep = vec![order[0]];
        // Secondary bins survive only when reasonably populated.
        for &i in order.iter().skip(1).take(2) {
            if self.bins[i].len() * 10 >= max1 {
                keep.push(i);
            }
        }

        (0..HISTO_LENGTH)
            .filter(|i| !keep.contains(i))
            .flat_map(|i| self.bins[i].iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DepthImage;
    use crate::geometry::SE3;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::test_camera;
    use nalgebra::UnitQuaternion;

    fn desc(seed: u8) -> Descriptor {
        let mut d = [0u8; 32];
        for (i, b) in d.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        Descriptor(d)
    }

    fn frame_with(points: &[(f64, f64, u8)], with_depth: Option<f64>) -> Frame {
        let camera = test_camera();
        let features: Vec<(Keypoint, Descriptor)> = points
            .iter()
            .map(|&(x, y, seed)| {
                (
                    Keypoint {
                        x,
                        y,
                        octave: 0,
                        angle: 0.0,
                    },
                    desc(seed),
                )
            })
            .collect();
        let depth =
            with_depth.map(|z| DepthImage::new(640, 480, vec![z as f32; 640 * 480]));
        Frame::new(0, 0.0, features, depth.as_ref(), camera)
    }

    #[test]
    fn local_projection_matches_by_descriptor() {
        let pyramid = ScalePyramid::new(8, 1.2);
        let mut frame = frame_with(&[(100.0, 100.0, 1), (300.0, 100.0, 2)], None);
        let candidates = vec![ProjectedPoint {
            mp_id: MapPointId(7),
            u: 101.0,
            v: 100.0,
            predicted_level: 0,
            view_cos: 1.0,
            descriptor: desc(1),
        }];

        let matcher = Matcher::new(0.75, false);
        let n = matcher.search_by_projection_local(&mut frame, &candidates, 1.0, &pyramid);
        assert_eq!(n, 1);
        assert_eq!(frame.map_points[0], Some(MapPointId(7)));
        assert_eq!(frame.map_points[1], None);
    }

    #[test]
    fn initialization_search_is_windowed_and_unique() {
        let f1 = frame_with(&[(100.0, 100.0, 1), (200.0, 200.0, 2)], None);
        let f2 = frame_with(&[(104.0, 101.0, 1), (204.0, 201.0, 2)], None);
        let mut prev: Vec<(f64, f64)> = f1.keypoints.iter().map(|k| (k.x, k.y)).collect();

        let matcher = Matcher::new(0.9, true);
        let (n, matches) = matcher.search_for_initialization(&f1, &f2, &mut prev, 20.0);
        assert_eq!(n, 2);
        assert_eq!(matches[0], Some(0));
        assert_eq!(matches[1], Some(1));
        // Windows follow the match.
        assert_eq!(prev[0], (104.0, 101.0));

        // A tiny window finds nothing.
        let mut prev2: Vec<(f64, f64)> = f1.keypoints.iter().map(|k| (k.x, k.y)).collect();
        let (n2, _) = matcher.search_for_initialization(&f1, &f2, &mut prev2, 1.0);
        assert_eq!(n2, 0);
    }

    #[test]
    fn epipolar_gate_rejects_off_line_points() {
        // Pure x-translation between identical cameras: epipolar lines are
        // horizontal, so a vertical offset violates the constraint.
        let camera = test_camera();
        let k = camera.intrinsic_matrix();
        let k_inv = k.try_inverse().unwrap();
        let r12 = Matrix3::identity();
        let t12 = Vector3::new(0.2, 0.0, 0.0);
        let e12 = crate::geometry::se3::essential_from_motion(&r12, &t12);
        let f12 = k_inv.transpose() * e12 * k_inv;

        let kp1 = Keypoint {
            x: 320.0,
            y: 240.0,
            octave: 0,
            angle: 0.0,
        };
        let on_line = Keypoint {
            x: 250.0,
            y: 240.0,
            octave: 0,
            angle: 0.0,
        };
        let off_line = Keypoint {
            x: 250.0,
            y: 300.0,
            octave: 0,
            angle: 0.0,
        };
        assert!(check_dist_epipolar_line(&kp1, &on_line, &f12, 1.0));
        assert!(!check_dist_epipolar_line(&kp1, &off_line, &f12, 1.0));
    }

    #[test]
    fn fuse_adds_observation_to_free_slot() {
        let camera = test_camera();
        let pyramid = ScalePyramid::new(8, 1.2);
        let mut map = Map::new(pyramid);

        let kp = Keypoint {
            x: 320.0,
            y: 240.0,
            octave: 0,
            angle: 0.0,
        };
        let kf_id = map.create_keyframe(KeyFrameData {
            source_frame_id: 0,
            timestamp: 0.0,
            pose_cw: SE3::identity(),
            keypoints: vec![kp],
            descriptors: vec![desc(3)],
            depths: vec![None],
            u_right: vec![None],
        });

        // Point straight ahead of the camera, described identically.
        let other = map.create_keyframe(KeyFrameData {
            source_frame_id: 1,
            timestamp: 0.0,
            pose_cw: SE3::new(UnitQuaternion::identity(), Vector3::new(-0.2, 0.0, 0.0)),
            keypoints: vec![kp],
            descriptors: vec![desc(3)],
            depths: vec![None],
            u_right: vec![None],
        });
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), desc(3), other);
        map.associate(other, 0, mp);
        {
            let p = map.map_point_mut(mp).unwrap();
            p.min_distance = 0.5;
            p.max_distance = 40.0;
        }

        let matcher = Matcher::default();
        let fused = matcher.fuse(&mut map, kf_id, &[mp], &camera, 3.0);
        assert_eq!(fused, 1);
        assert_eq!(map.keyframe(kf_id).unwrap().map_point(0), Some(mp));
        assert!(map.map_point(mp).unwrap().is_observed_by(kf_id));
        map.assert_consistent();
    }

    #[test]
    fn fuse_routes_duplicates_through_replacement() {
        let camera = test_camera();
        let mut map = Map::new(ScalePyramid::new(8, 1.2));
        let kp = Keypoint {
            x: 320.0,
            y: 240.0,
            octave: 0,
            angle: 0.0,
        };
        let mk_kf = |map: &mut Map, id: u64, tx: f64| {
            map.create_keyframe(KeyFrameData {
                source_frame_id: id,
                timestamp: 0.0,
                pose_cw: SE3::new(UnitQuaternion::identity(), Vector3::new(tx, 0.0, 0.0)),
                keypoints: vec![kp],
                descriptors: vec![desc(5)],
                depths: vec![None],
                u_right: vec![None],
            })
        };
        let kf_a = mk_kf(&mut map, 0, 0.0);
        let kf_b = mk_kf(&mut map, 1, -0.1);
        let kf_c = mk_kf(&mut map, 2, 0.1);

        // `strong` is seen by two keyframes, `weak` by one; both land on the
        // same keypoint of kf_a.
        let strong = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), desc(5), kf_b);
        map.associate(kf_b, 0, strong);
        map.associate(kf_c, 0, strong);
        let weak = map.create_map_point(Vector3::new(0.0, 0.0, 4.01), desc(5), kf_a);
        map.associate(kf_a, 0, weak);
        for id in [strong, weak] {
            let p = map.map_point_mut(id).unwrap();
            p.min_distance = 0.5;
            p.max_distance = 40.0;
        }

        let matcher = Matcher::default();
        let fused = matcher.fuse(&mut map, kf_a, &[strong], &camera, 3.0);
        assert_eq!(fused, 1);
        // The weaker point was replaced; readers resolve to the stronger.
        assert_eq!(map.resolve(weak), Some(strong));
        assert_eq!(
            map.keyframe(kf_a).unwrap().map_point(0),
            Some(strong)
        );
        map.assert_consistent();
    }
}
