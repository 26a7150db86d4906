//! Local mapping back end: keyframe integration, point culling,
//! triangulation, neighborhood fusion, local BA and keyframe culling.

pub mod local_mapper;
pub mod search_in_neighbors;
pub mod triangulation;

pub use local_mapper::LocalMapper;
pub use search_in_neighbors::{search_in_neighbors, FusionOutcome};
pub use triangulation::{compute_f12, create_new_map_points, TriangulationOutcome};
