//! Geometry metadata: communicator, horizontal function space, level counts.
//!
//! The chain algebra only reads geometry; it never owns the communicator.
//! A `Geometry` is a cheap handle over shared `GeometryData`.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::config::GeometryParameters;
use crate::error::SaberResult;
use crate::variables::{Variable, Variables};

/// Collective operations the field algebra needs from the process group.
pub trait Communicator: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Global sum; every rank must call it in the same order.
    fn all_reduce_sum(&self, value: f64) -> f64;
}

/// Single-process communicator.
#[derive(Debug, Clone, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn name(&self) -> &str {
        "serial"
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: f64) -> f64 {
        value
    }
}

/// Regular lon/lat point cloud: `nx * ny` owned points followed by `halo` ghosts.
#[derive(Debug, Clone)]
pub struct FunctionSpace {
    pub nx: usize,
    pub ny: usize,
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub ghost: Vec<bool>,
}

impl FunctionSpace {
    pub fn regular(params: &GeometryParameters) -> Self {
        let (nx, ny) = (params.nx, params.ny);
        let dlon = if nx > 1 {
            (params.lon_max - params.lon_min) / (nx - 1) as f64
        } else {
            0.0
        };
        let dlat = if ny > 1 {
            (params.lat_max - params.lat_min) / (ny - 1) as f64
        } else {
            0.0
        };

        let owned = nx * ny;
        let mut lon = Vec::with_capacity(owned + params.halo);
        let mut lat = Vec::with_capacity(owned + params.halo);
        for j in 0..ny {
            for i in 0..nx {
                lon.push(params.lon_min + i as f64 * dlon);
                lat.push(params.lat_min + j as f64 * dlat);
            }
        }
        // Halo points mirror the first owned points (periodic wrap).
        for k in 0..params.halo {
            let src = k % owned.max(1);
            lon.push(lon[src]);
            lat.push(lat[src]);
        }

        let mut ghost = vec![false; owned];
        ghost.extend(std::iter::repeat(true).take(params.halo));

        Self { nx, ny, lon, lat, ghost }
    }

    /// Total points including halo.
    pub fn size(&self) -> usize {
        self.ghost.len()
    }

    pub fn owned(&self) -> usize {
        self.nx * self.ny
    }
}

/// Everything a block may know about the grid it acts on.
#[derive(Debug)]
pub struct GeometryData {
    id: String,
    params: GeometryParameters,
    function_space: FunctionSpace,
    comm: Arc<dyn Communicator>,
}

impl GeometryData {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parameters(&self) -> &GeometryParameters {
        &self.params
    }

    pub fn function_space(&self) -> &FunctionSpace {
        &self.function_space
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn comm_handle(&self) -> Arc<dyn Communicator> {
        Arc::clone(&self.comm)
    }

    /// Level count for a variable: explicit per-variable entry or the default.
    pub fn levels(&self, name: &str) -> usize {
        self.params
            .variable_levels
            .get(name)
            .copied()
            .unwrap_or(self.params.levels)
    }

    /// Fills level counts and grid id from this geometry.
    pub fn variables_with_levels(&self, vars: &Variables) -> Variables {
        vars.iter()
            .map(|v| Variable::new(v.name.clone(), self.levels(&v.name)).on_grid(self.id.clone()))
            .collect()
    }

    /// Same grid description (handles may differ).
    pub fn same_grid(&self, other: &GeometryData) -> bool {
        self.params == other.params
    }
}

/// Handle over shared geometry data.
#[derive(Debug, Clone)]
pub struct Geometry {
    data: Arc<GeometryData>,
}

impl Geometry {
    pub fn new(params: &GeometryParameters, comm: Arc<dyn Communicator>) -> SaberResult<Self> {
        params.validate()?;
        let id = params
            .name
            .clone()
            .unwrap_or_else(|| format!("regular_{}x{}", params.nx, params.ny));
        Ok(Self {
            data: Arc::new(GeometryData {
                id,
                params: params.clone(),
                function_space: FunctionSpace::regular(params),
                comm,
            }),
        })
    }

    /// Serial geometry, convenient for tools and tests.
    pub fn serial(params: &GeometryParameters) -> SaberResult<Self> {
        Self::new(params, Arc::new(SerialComm))
    }

    /// A distinct handle for a second resolution. Identical parameters alias
    /// the primary data; anything else builds new data on the same communicator.
    pub fn dual(&self, params: Option<&GeometryParameters>) -> SaberResult<Self> {
        match params {
            Some(p) if *p != self.data.params => Self::new(p, self.data.comm_handle()),
            _ => Ok(Self {
                data: Arc::clone(&self.data),
            }),
        }
    }

    pub fn data(&self) -> &Arc<GeometryData> {
        &self.data
    }

    /// True when both handles share the same data.
    pub fn aliases(&self, other: &Geometry) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Deref for Geometry {
    type Target = GeometryData;

    fn deref(&self) -> &GeometryData {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(nx: usize, ny: usize) -> GeometryParameters {
        GeometryParameters {
            nx,
            ny,
            levels: 2,
            ..GeometryParameters::default()
        }
    }

    #[test]
    fn test_regular_function_space() {
        let mut p = params(3, 2);
        p.halo = 2;
        let geom = Geometry::serial(&p).unwrap();
        let fs = geom.function_space();
        assert_eq!(fs.size(), 8);
        assert_eq!(fs.owned(), 6);
        assert_eq!(fs.ghost.iter().filter(|g| **g).count(), 2);
        assert!((fs.lon[2] - p.lon_max).abs() < 1e-12);
        assert!((fs.lat[5] - p.lat_max).abs() < 1e-12);
    }

    #[test]
    fn test_dual_geometry_aliases_when_identical() {
        let geom = Geometry::serial(&params(4, 4)).unwrap();
        let same = geom.dual(Some(&params(4, 4))).unwrap();
        let none = geom.dual(None).unwrap();
        let coarse = geom.dual(Some(&params(2, 2))).unwrap();
        assert!(geom.aliases(&same));
        assert!(geom.aliases(&none));
        assert!(!geom.aliases(&coarse));
        assert!(!geom.same_grid(&coarse));
    }

    #[test]
    fn test_variable_levels() {
        let mut p = params(2, 2);
        p.variable_levels.insert("ps".to_string(), 1);
        let geom = Geometry::serial(&p).unwrap();
        let vars = geom.variables_with_levels(&Variables::from_names(&["t", "ps"]));
        assert_eq!(vars.get("t").map(|v| v.levels), Some(2));
        assert_eq!(vars.get("ps").map(|v| v.levels), Some(1));
        assert_eq!(vars.get("t").map(|v| v.grid.as_str()), Some("regular_2x2"));
    }
}
