//! Optimization drivers: pose-only refinement and local bundle adjustment.
//!
//! Both hand-roll the damped-normal-equation Levenberg–Marquardt iteration;
//! keeping the loop in-house is what lets local BA honor the abort flag at
//! iteration boundaries and return the best partial solution.

pub mod local_ba;
pub mod pose_optim;

pub use local_ba::{
    apply_local_ba, collect_local_ba, solve_local_ba, LocalBaConfig, LocalBaProblem, LocalBaResult,
};
pub use pose_optim::{optimize_frame_pose, PoseOptimization};
