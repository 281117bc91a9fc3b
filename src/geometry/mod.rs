//! Geometry utilities: SE3 transforms, camera intrinsics, boundary
//! matrices, two-view pose, PnP.

pub mod camera;
pub mod mat4;
pub mod pnp;
pub mod se3;
pub mod two_view;

pub use camera::CameraIntrinsics;
pub use pnp::solve_pnp_ransac;
pub use se3::SE3;
pub use two_view::{estimate_relative_pose, RelativePose};
