//! n-dimensional grid exploration.
//!
//! [`expand_grid`] computes the next frontier of an integer grid from the
//! points that just resolved. [`GridService`] drives a full exploration:
//! one optimization task per grid point, each seeded from the completed
//! neighbor it was discovered from, until the frontier is exhausted.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use lattice_core::{ProcedureKind, ServiceStatus};
use lattice_storage::TaskStore;

use crate::error::ServiceError;
use crate::procedures::TaskPacket;
use crate::service::{Service, ServiceCore, ServiceInput};

/// An integer coordinate in the exploration space. Every component lies
/// in `[0, dimensions[axis])`.
pub type GridPoint = Vec<u32>;

/// Expand an n-dimensional grid one axis-aligned step out from `seeds`.
///
/// Returns one `(origin, neighbor)` pair per newly discovered frontier
/// point. A neighbor outside the bounds, already emitted in this call, or
/// already in `complete` is skipped, so no point is ever queued twice and
/// the exploration terminates on the finite coordinate space.
///
/// ```
/// use std::collections::HashSet;
/// use lattice_services::expand_grid;
///
/// let seeds = HashSet::from([vec![1, 1]]);
/// let pairs = expand_grid(&[3, 3], &seeds, &HashSet::new());
/// assert_eq!(pairs.len(), 4);
/// ```
pub fn expand_grid(
    dimensions: &[u32],
    seeds: &HashSet<GridPoint>,
    complete: &HashSet<GridPoint>,
) -> Vec<(GridPoint, GridPoint)> {
    let mut compute: HashSet<GridPoint> = HashSet::new();
    let mut connections = Vec::new();

    // Sorted seed order keeps the (origin, neighbor) assignment stable, so
    // re-running the same exploration yields byte-identical task specs.
    let mut ordered: Vec<&GridPoint> = seeds.iter().collect();
    ordered.sort();

    for axis in 0..dimensions.len() {
        for &seed in &ordered {
            for disp in [-1i64, 1] {
                let coord = seed[axis] as i64 + disp;
                if coord < 0 || coord >= dimensions[axis] as i64 {
                    continue;
                }

                let mut neighbor = seed.clone();
                neighbor[axis] = coord as u32;

                if compute.contains(&neighbor) || complete.contains(&neighbor) {
                    continue;
                }

                compute.insert(neighbor.clone());
                connections.push((seed.clone(), neighbor));
            }
        }
    }

    connections
}

/// One scanned parameter axis: the grid index along this axis selects one
/// of `values`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanAxis {
    pub parameter: String,
    pub values: Vec<f64>,
}

/// Initial parameters for a grid exploration service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridServiceInput {
    pub program: String,
    /// Handler the backend runs at every grid point.
    pub function: String,
    /// One axis per scanned parameter; axis order fixes coordinate order.
    pub scans: Vec<ScanAxis>,
    /// Grid point the exploration starts from. Defaults to the origin.
    #[serde(default)]
    pub starting_point: Option<Vec<u32>>,
    /// Payload template merged into every task's kwargs.
    #[serde(default)]
    pub base: Map<String, Value>,
    /// Free-form metadata. Folded into the service hash only; task specs
    /// never see it, so meaning-preserving metadata changes produce a new
    /// service without re-executing identical tasks.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Grid-structured service: explores the scan grid by frontier expansion.
pub struct GridService {
    core: ServiceCore,
    input: GridServiceInput,
    dimensions: Vec<u32>,
    start: GridPoint,
    complete: HashSet<GridPoint>,
    /// point key -> stored result, accumulated across rounds.
    points: Map<String, Value>,
}

fn point_key(point: &GridPoint) -> String {
    point
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_point(key: &str) -> Result<GridPoint, ServiceError> {
    key.split(',')
        .map(|part| {
            part.parse::<u32>()
                .map_err(|_| ServiceError::Other(format!("malformed grid point key '{key}'")))
        })
        .collect()
}

impl GridService {
    /// Validate the input and build a WAITING service. No round is
    /// submitted here.
    pub fn new(store: Arc<dyn TaskStore>, input: GridServiceInput) -> Result<Self, ServiceError> {
        if input.function.trim().is_empty() {
            return Err(ServiceError::ServiceBuild("function must not be empty".into()));
        }
        if input.program.trim().is_empty() {
            return Err(ServiceError::ServiceBuild("program must not be empty".into()));
        }
        if input.scans.is_empty() {
            return Err(ServiceError::ServiceBuild(
                "grid exploration requires at least one scan axis".into(),
            ));
        }
        for axis in &input.scans {
            if axis.values.is_empty() {
                return Err(ServiceError::ServiceBuild(format!(
                    "scan axis '{}' has no values",
                    axis.parameter
                )));
            }
        }

        let dimensions: Vec<u32> = input.scans.iter().map(|axis| axis.values.len() as u32).collect();

        let start = match &input.starting_point {
            Some(point) => {
                if point.len() != dimensions.len() {
                    return Err(ServiceError::ServiceBuild(format!(
                        "starting point has {} coordinates, grid has {} axes",
                        point.len(),
                        dimensions.len()
                    )));
                }
                for (axis, (&coord, &dim)) in point.iter().zip(dimensions.iter()).enumerate() {
                    if coord >= dim {
                        return Err(ServiceError::ServiceBuild(format!(
                            "starting point index {coord} on axis {axis} is outside [0, {dim})"
                        )));
                    }
                }
                point.clone()
            }
            None => vec![0; dimensions.len()],
        };

        let hash_index = ServiceInput::GridExploration(input.clone()).hash_index();
        let core = ServiceCore::new(store, "grid_exploration", &input.program, hash_index);

        Ok(Self {
            core,
            input,
            dimensions,
            start,
            complete: HashSet::new(),
            points: Map::new(),
        })
    }

    /// Build the packets for a batch of `(origin, point)` pairs. The
    /// origin's stored result seeds the new point's task; the starting
    /// point has no origin and seeds from null.
    fn point_packets(
        &self,
        batch: Vec<(Option<GridPoint>, GridPoint)>,
    ) -> IndexMap<String, TaskPacket> {
        let mut packets = IndexMap::with_capacity(batch.len());
        for (origin, point) in batch {
            let mut packet = TaskPacket::new(&self.input.program, &self.input.function);
            packet.kwargs = self.input.base.clone();

            let mut parameters = Map::new();
            for (axis, &coord) in self.input.scans.iter().zip(point.iter()) {
                parameters.insert(axis.parameter.clone(), json!(axis.values[coord as usize]));
            }
            packet.kwargs.insert("parameters".into(), Value::Object(parameters));

            let initial = origin
                .and_then(|o| self.points.get(&point_key(&o)).cloned())
                .unwrap_or(Value::Null);
            packet.kwargs.insert("initial".into(), initial);

            packets.insert(point_key(&point), packet);
        }
        packets
    }

    fn sync_output(&mut self) {
        self.core.record.output = json!({
            "dimensions": self.dimensions,
            "starting_point": self.start,
            "points": Value::Object(self.points.clone()),
        });
    }

    /// Final build step, taken one iterate after convergence.
    fn finalize(&mut self) {
        self.core.record.output = json!({
            "dimensions": self.dimensions,
            "starting_point": self.start,
            "points": Value::Object(self.points.clone()),
            "num_points": self.points.len(),
        });
        self.core.record.status = ServiceStatus::Complete;
    }
}

#[async_trait::async_trait]
impl Service for GridService {
    fn record(&self) -> &lattice_core::ServiceRecord {
        &self.core.record
    }

    fn record_mut(&mut self) -> &mut lattice_core::ServiceRecord {
        &mut self.core.record
    }

    async fn iterate(&mut self) -> Result<bool, ServiceError> {
        if self.core.record.status.is_terminal() {
            return Ok(true);
        }

        if self.core.record.status == ServiceStatus::Ready {
            self.finalize();
            return Ok(true);
        }

        if !self.core.manager.has_outstanding() {
            // First round: resolve the starting point.
            let packets = self.point_packets(vec![(None, self.start.clone())]);
            self.core
                .manager
                .submit_tasks(ProcedureKind::Optimization, packets)
                .await?;
            self.core.record.status = ServiceStatus::Running;
            return Ok(false);
        }

        let done = match self.core.manager.done().await {
            Ok(done) => done,
            Err(err @ ServiceError::RoundFailure { .. }) => {
                self.core.fail(&err);
                return Ok(true);
            }
            Err(other) => return Err(other),
        };
        if !done {
            return Ok(false);
        }

        // Round resolved: fold results and expand the frontier.
        let results = self.core.manager.get_tasks().await?;
        let mut seeds = HashSet::with_capacity(results.len());
        for (key, record) in &results {
            let point = parse_point(key)?;
            self.points
                .insert(key.clone(), record.result.clone().unwrap_or(Value::Null));
            self.complete.insert(point.clone());
            seeds.insert(point);
        }
        self.sync_output();

        let connections = expand_grid(&self.dimensions, &seeds, &self.complete);
        if connections.is_empty() {
            // Exploration exhausted; the final build runs next iterate.
            debug!(id = %self.core.record.id, points = self.points.len(), "grid exhausted");
            self.core.record.status = ServiceStatus::Ready;
            return Ok(false);
        }

        debug!(
            id = %self.core.record.id,
            frontier = connections.len(),
            "expanding grid frontier"
        );
        let batch = connections
            .into_iter()
            .map(|(origin, neighbor)| (Some(origin), neighbor))
            .collect();
        let packets = self.point_packets(batch);
        self.core
            .manager
            .submit_tasks(ProcedureKind::Optimization, packets)
            .await?;
        self.core.record.status = ServiceStatus::Running;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(points: &[&[u32]]) -> HashSet<GridPoint> {
        points.iter().map(|p| p.to_vec()).collect()
    }

    #[test]
    fn expansion_from_center_of_3x3() {
        let pairs = expand_grid(&[3, 3], &set(&[&[1, 1]]), &HashSet::new());

        let expected: HashSet<(GridPoint, GridPoint)> = [
            (vec![1, 1], vec![0, 1]),
            (vec![1, 1], vec![2, 1]),
            (vec![1, 1], vec![1, 0]),
            (vec![1, 1], vec![1, 2]),
        ]
        .into_iter()
        .collect();

        let actual: HashSet<(GridPoint, GridPoint)> = pairs.into_iter().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn expansion_clips_at_the_boundary() {
        let pairs = expand_grid(&[2], &set(&[&[0]]), &HashSet::new());
        assert_eq!(pairs, vec![(vec![0], vec![1])]);
    }

    #[test]
    fn completed_points_are_never_re_emitted() {
        let complete = set(&[&[0, 1], &[1, 0]]);
        let pairs = expand_grid(&[3, 3], &set(&[&[1, 1]]), &complete);

        let neighbors: HashSet<GridPoint> = pairs.iter().map(|(_, n)| n.clone()).collect();
        assert_eq!(neighbors, set(&[&[2, 1], &[1, 2]]));
    }

    #[test]
    fn shared_neighbor_is_emitted_once() {
        // (0,1) and (1,0) both reach (0,0) and (1,1).
        let pairs = expand_grid(&[2, 2], &set(&[&[0, 1], &[1, 0]]), &HashSet::new());
        let neighbors: Vec<GridPoint> = pairs.iter().map(|(_, n)| n.clone()).collect();

        let unique: HashSet<GridPoint> = neighbors.iter().cloned().collect();
        assert_eq!(neighbors.len(), unique.len(), "duplicate neighbor emitted");
        assert_eq!(unique, set(&[&[0, 0], &[1, 1]]));
    }

    #[test]
    fn exhausted_grid_yields_no_pairs() {
        let complete = set(&[&[0], &[1], &[2]]);
        let pairs = expand_grid(&[3], &set(&[&[0], &[1], &[2]]), &complete);
        assert!(pairs.is_empty());
    }

    #[test]
    fn point_keys_round_trip() {
        let point = vec![3, 0, 7];
        assert_eq!(parse_point(&point_key(&point)).unwrap(), point);
        assert!(parse_point("1,x").is_err());
    }
}
