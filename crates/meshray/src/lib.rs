//! Ray tracing through unstructured finite-element meshes.
//!
//! A population of parametric line segments ("rays") is propagated through
//! a mesh of 1D/2D/3D elements. User hooks run on every element segment
//! and on every boundary touch. Rays are claimed to unique owning ranks,
//! traced locally, and handed off across partition boundaries until global
//! quiescence.

pub mod claim;
pub mod error;
pub mod extrema;
pub mod generate;
pub mod geom;
pub mod hooks;
pub mod mesh;
pub mod neighbors;
pub mod parallel;
pub mod quadrature;
pub mod ray;
pub mod study;
pub mod tracer;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use geom::Point;

/// Common exports for quick imports in callers.
pub mod prelude {
    pub use crate::error::RayTracingError;
    pub use crate::extrema::ElemExtrema;
    pub use crate::generate::{
        LocalRayGenerator, RandomFanGenerator, RayDefinition, RayGenerator, RepeatableGenerator,
        Trajectory,
    };
    pub use crate::geom::{Point, LOOSE_TRACE_TOL, TRACE_TOL};
    pub use crate::hooks::{
        BoundaryCtx, DistanceKernel, IntegralKernel, KillBc, NullBc, RayBoundaryCondition,
        RayKernel, ReflectBc, SegmentCtx,
    };
    pub use crate::mesh::{BoundaryId, ElemId, ElemType, Mesh, NodeId, SubdomainId};
    pub use crate::parallel::{execute_on_ranks, execute_study, solo_comm, BufferPolicy, RankComm};
    pub use crate::ray::{Ray, RayId};
    pub use crate::study::{RayStudy, StudyConfig};
}
