//! Geometry utilities: SE(3) transforms, triangulation, PnP.

pub mod pnp;
pub mod se3;
pub mod so3;
pub mod triangulation;

pub use pnp::{solve_pnp_ransac, PnPConfig, PnPResult};
pub use se3::SE3;
pub use so3::skew;
pub use triangulation::{projection_matrix, triangulate_dlt};
