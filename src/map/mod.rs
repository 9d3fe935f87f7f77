//! Local map: staged/promoted feature lifecycles and data association.

pub mod local_map;
pub mod map_plane;
pub mod map_point;
pub mod map_point2d;
pub mod matches;

pub use local_map::{DetectedFeatures, LocalMap};
pub use map_plane::MapPlane;
pub use map_point::MapPoint;
pub use map_point2d::MapPoint2D;
pub use matches::{MatchSets, Matches, PlaneMatch, Point2DMatch, PointMatch};
