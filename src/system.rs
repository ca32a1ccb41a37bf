//! Orchestration of geometric search, constraint evaluation and global assembly.
//!
//! A [`ConstraintSystem`] owns the mesh, the DOF map, the volumetric kernels and the constraint
//! registry. Every residual or Jacobian evaluation runs as one *pass*:
//!
//! 1. the searches of all buckets are refreshed for the current iterate,
//! 2. the constraints decide which entities they apply to, and state requests are exchanged
//!    between processors,
//! 3. the physics contributions are assembled and closed,
//! 4. the constraint contributions are folded in, bucket by bucket, and the staged row
//!    replacements are committed.
//!
//! Steps 1 and 2 are cached per iterate, so that residual and Jacobian see identical decisions.
use crate::assembly::{
    AssemblyAccumulator, ColumnSet, LocalContributionBuffer, RowOwnership, VectorTag, VolumetricAssembler,
    VolumetricKernel, VolumetricPass, ALL_TAGS,
};
use crate::augmented::AugmentedSystem;
use crate::constraint::{Constraint, ConstraintKind, EvaluationContext, InteractionKey, MortarSegmentData};
use crate::dof::{DofMap, VariableId};
use crate::element::side_segment;
use crate::error::{catch_retry, ConfigurationError, EvaluationError, Outcome, SearchError};
use crate::field::{displaced_positions, SolutionState};
use crate::kernels::DirichletBc;
use crate::linalg::{GlobalMatrix, GlobalVector};
use crate::mesh::{Mesh, MeshQuery};
use crate::parallel::{Communicator, CommunicatorExt, SerialCommunicator};
use crate::registry::{check_row_ownership, BucketKey, ConstraintId, ConstraintRegistry, RowClaim};
use crate::search::{
    InterfacePairing, MechanicalStatus, MortarSegmentMesh, NodeElementLocator, NodeStateRequest, ProjectionInfo,
    ProjectionLocator, SearchSettings, SpatialProximityIndex,
};
use crate::solver::{ConvergenceStatus, NonlinearSystem};
use crate::Real;
use eyre::{bail, eyre};
use log::{debug, info};
use nalgebra::{DVector, Point2};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The geometric search shared by the constraints of one bucket.
#[derive(Debug, Clone)]
pub enum SearchState<T: Real> {
    Nearest(SpatialProximityIndex<T>),
    Projection(ProjectionLocator<T>),
    NodeElement(NodeElementLocator<T>),
    Mortar(MortarSegmentMesh<T>),
    Interface(InterfacePairing),
}

/// Contact state of one node-face search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionCheckpoint<T: Real> {
    pub bucket: BucketKey,
    pub infos: Vec<ProjectionInfo<T>>,
    /// The reference positions of incremental slip.
    pub step_start_positions: Option<Vec<Point2<T>>>,
}

/// Contact state of all node-face searches, sufficient to restart a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactCheckpoint<T: Real> {
    pub buckets: Vec<ProjectionCheckpoint<T>>,
}

/// Decisions and positions of the iterate the searches were last prepared for.
#[derive(Debug, Clone)]
struct PassCache<T: Real> {
    solution: Option<DVector<T>>,
    displaced: Vec<Point2<T>>,
    /// Owned secondary nodes each node-face constraint applies to.
    node_face: BTreeMap<ConstraintId, Vec<usize>>,
    node_elem: BTreeMap<ConstraintId, Vec<usize>>,
    /// Owned `(secondary, primary)` node pairs of nodal constraints.
    nodal: BTreeMap<ConstraintId, Vec<(usize, usize)>>,
}

impl<T: Real> Default for PassCache<T> {
    fn default() -> Self {
        Self {
            solution: None,
            displaced: Vec::new(),
            node_face: BTreeMap::new(),
            node_elem: BTreeMap::new(),
            nodal: BTreeMap::new(),
        }
    }
}

/// A local evaluation failure as exchanged between processors.
#[derive(Debug, Clone)]
enum LocalFailure {
    Retry(String),
    Fatal(String),
}

fn cached<'a, K: Ord, V>(map: &'a BTreeMap<K, Vec<V>>, key: &K) -> &'a [V] {
    map.get(key).map(Vec::as_slice).unwrap_or(&[])
}

fn search_settings<T: Real>(constraint: &Constraint<T>) -> SearchSettings {
    match constraint {
        Constraint::Nodal(c) => c.search_settings().clone(),
        Constraint::NodeFace(c) => c.search_settings().clone(),
        _ => SearchSettings::default(),
    }
}

/// Nonlinear system of volumetric physics and constraints on a (possibly distributed) mesh.
pub struct ConstraintSystem<T: Real, C: Communicator = SerialCommunicator> {
    mesh: Mesh<T>,
    dof_map: DofMap<T>,
    comm: C,
    registry: ConstraintRegistry<T>,
    kernels: Vec<Box<dyn VolumetricKernel<T>>>,
    dirichlet: Vec<DirichletBc<T>>,
    displacement: Option<VariableId>,
    searches: BTreeMap<BucketKey, SearchState<T>>,
    reference_positions: Vec<Point2<T>>,

    residual: GlobalVector<T>,
    jacobian: GlobalMatrix<T>,
    accumulator: AssemblyAccumulator<T>,
    volumetric: VolumetricAssembler<T>,
    buffer: LocalContributionBuffer<T>,

    old_solution: DVector<T>,
    /// Residual of the physics alone, as of the last residual pass.
    physics_residual: DVector<T>,
    time: T,
    dt: T,
    cache: PassCache<T>,
    full_rebuild: bool,
    initialized: bool,
}

impl<T: Real, C: Communicator> std::fmt::Debug for ConstraintSystem<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintSystem")
            .field("num_dofs", &self.dof_map.num_dofs())
            .field("registry", &self.registry)
            .field("searches", &self.searches.keys().collect::<Vec<_>>())
            .field("rank", &self.comm.rank())
            .field("time", &self.time)
            .finish()
    }
}

impl<T: Real> ConstraintSystem<T, SerialCommunicator> {
    pub fn new(mesh: Mesh<T>, dof_map: DofMap<T>) -> Self {
        Self::with_communicator(mesh, dof_map, SerialCommunicator)
    }
}

impl<T: Real, C: Communicator> ConstraintSystem<T, C> {
    pub fn with_communicator(mesh: Mesh<T>, dof_map: DofMap<T>, comm: C) -> Self {
        let n = dof_map.num_dofs();
        let reference_positions = mesh.vertices().to_vec();
        Self {
            mesh,
            dof_map,
            comm,
            registry: ConstraintRegistry::new(),
            kernels: Vec::new(),
            dirichlet: Vec::new(),
            displacement: None,
            searches: BTreeMap::new(),
            reference_positions,
            residual: GlobalVector::zeros(n),
            jacobian: GlobalMatrix::zeros(n),
            accumulator: AssemblyAccumulator::new(),
            volumetric: VolumetricAssembler::default(),
            buffer: LocalContributionBuffer::default(),
            old_solution: DVector::zeros(n),
            physics_residual: DVector::zeros(n),
            time: T::zero(),
            dt: T::one(),
            cache: PassCache::default(),
            full_rebuild: false,
            initialized: false,
        }
    }

    pub fn mesh(&self) -> &Mesh<T> {
        &self.mesh
    }

    pub fn dof_map(&self) -> &DofMap<T> {
        &self.dof_map
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    pub fn registry(&self) -> &ConstraintRegistry<T> {
        &self.registry
    }

    pub fn num_dofs(&self) -> usize {
        self.dof_map.num_dofs()
    }

    pub fn time(&self) -> T {
        self.time
    }

    /// The variable whose values displace the mesh for searches on the displaced configuration.
    pub fn set_displacement_variable(&mut self, variable: VariableId) {
        self.displacement = Some(variable);
        self.initialized = false;
    }

    pub fn add_kernel(&mut self, kernel: impl VolumetricKernel<T> + 'static) {
        self.kernels.push(Box::new(kernel));
    }

    pub fn add_dirichlet_bc(&mut self, bc: DirichletBc<T>) {
        self.dirichlet.push(bc);
        self.initialized = false;
    }

    pub fn add_constraint(&mut self, constraint: Constraint<T>) -> Result<ConstraintId, ConfigurationError> {
        constraint.validate(&self.dof_map)?;
        self.initialized = false;
        self.registry.add(constraint)
    }

    /// Builds the searches of all buckets and checks the setup for conflicts.
    ///
    /// Must be called after the last constraint or boundary condition was added.
    pub fn initialize(&mut self) -> eyre::Result<()> {
        let mut searches = BTreeMap::new();
        for bucket in self.registry.bucket_keys() {
            let first = self.registry.get(self.registry.bucket_members(&bucket)[0]);
            let name = first.name();
            if bucket.displaced && self.displacement.is_none() {
                return Err(ConfigurationError::MissingCoupledField {
                    constraint: name.to_string(),
                    field: "displacement".to_string(),
                }
                .into());
            }
            let settings = search_settings(first);
            let mesh = &self.mesh;
            let state = match (bucket.kind, bucket.key) {
                (ConstraintKind::Nodal, InteractionKey::BoundaryPair { secondary, primary }) => {
                    SearchState::Nearest(SpatialProximityIndex::build(mesh, name, secondary, primary, &settings)?)
                }
                (ConstraintKind::NodeFace, InteractionKey::BoundaryPair { secondary, primary }) => {
                    SearchState::Projection(ProjectionLocator::build(mesh, name, secondary, primary, &settings)?)
                }
                (ConstraintKind::NodeElem, InteractionKey::SubdomainPair { secondary, primary }) => SearchState::NodeElement(
                    NodeElementLocator::build(mesh, name, secondary, primary, &settings.projection)?,
                ),
                (ConstraintKind::Mortar, InteractionKey::BoundaryPair { secondary, primary }) => {
                    SearchState::Mortar(MortarSegmentMesh::build(mesh, name, secondary, primary, &settings.projection)?)
                }
                (ConstraintKind::ElemElem, InteractionKey::Interface(tag)) => {
                    SearchState::Interface(InterfacePairing::build(mesh, name, tag)?)
                }
                (kind, key) => {
                    return Err(ConfigurationError::InvalidInteractionKey {
                        constraint: name.to_string(),
                        reason: format!("{kind:?} constraints cannot be registered under {key:?}"),
                    }
                    .into())
                }
            };
            searches.insert(bucket, state);
        }

        // Multipliers must live on every secondary node of a mortar interface
        for (_, constraint) in self.registry.constraints() {
            let Constraint::Mortar(mortar) = constraint else {
                continue;
            };
            let bucket = BucketKey::of(constraint);
            let Some(SearchState::Mortar(segments)) = searches.get(&bucket) else {
                continue;
            };
            let multiplier = mortar.lagrange_multiplier();
            for side in 0..segments.secondary_sides().len() {
                if let Some(&node) = segments
                    .secondary_side_nodes(side)
                    .iter()
                    .find(|&&node| !self.dof_map.has_node(multiplier, node))
                {
                    return Err(ConfigurationError::MissingVariable {
                        constraint: constraint.name().to_string(),
                        variable: format!("{} (not defined at secondary node {node})", self.dof_map.variable(multiplier).name),
                    }
                    .into());
                }
            }
        }

        let mut claims = self.registry.row_claims(&self.mesh, &self.dof_map);
        for (bucket, search) in &mut searches {
            let SearchState::NodeElement(locator) = search else {
                continue;
            };
            locator.update(&self.mesh, &self.reference_positions)?;
            let mut nodes: Vec<usize> = locator
                .locations()
                .flat_map(|(_, location)| location.nodes.iter().copied())
                .collect();
            nodes.sort_unstable();
            nodes.dedup();
            for &id in self.registry.bucket_members(bucket) {
                let base = self.registry.get(id).base();
                let mut dofs = Vec::new();
                for &node in &nodes {
                    self.dof_map.extend_node_dofs(node, base.variable, &mut dofs);
                }
                claims.extend(dofs.into_iter().map(|dof| RowClaim {
                    dof,
                    source: base.name.clone(),
                    overwrite: false,
                }));
            }
        }
        for bc in &self.dirichlet {
            for node in self.mesh.boundary_nodes(bc.boundary) {
                if let Some(dof) = self.dof_map.dof_index(node, bc.variable, bc.component) {
                    claims.push(RowClaim {
                        dof,
                        source: bc.name.clone(),
                        overwrite: true,
                    });
                }
            }
        }
        check_row_ownership(&claims, &self.dof_map)?;

        self.searches = searches;
        self.registry.update_active_set(self.time);
        self.cache = PassCache::default();
        self.initialized = true;
        info!(
            "Initialized {} constraints in {} buckets on processor {}",
            self.registry.len(),
            self.searches.len(),
            self.comm.rank()
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> eyre::Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(eyre!("the constraint system must be initialized after constraints are added"))
        }
    }

    pub fn search(&self, bucket: &BucketKey) -> Option<&SearchState<T>> {
        self.searches.get(bucket)
    }

    fn search_of(&self, constraint: &str) -> Option<&SearchState<T>> {
        let id = self.registry.id_by_name(constraint)?;
        self.searches.get(&BucketKey::of(self.registry.get(id)))
    }

    /// The projection locator used by a node-face constraint.
    pub fn projection_locator(&self, constraint: &str) -> Option<&ProjectionLocator<T>> {
        match self.search_of(constraint)? {
            SearchState::Projection(locator) => Some(locator),
            _ => None,
        }
    }

    /// The segment mesh used by a mortar constraint.
    pub fn mortar_segments(&self, constraint: &str) -> Option<&MortarSegmentMesh<T>> {
        match self.search_of(constraint)? {
            SearchState::Mortar(segments) => Some(segments),
            _ => None,
        }
    }

    pub fn constraint(&self, name: &str) -> Option<&Constraint<T>> {
        Some(self.registry.get(self.registry.id_by_name(name)?))
    }

    /// Sets the time of the upcoming evaluations and updates which constraints are active.
    pub fn set_time(&mut self, time: T, dt: T) {
        self.time = time;
        self.dt = dt;
        self.registry.update_active_set(time);
        self.cache = PassCache::default();
    }

    /// Starts a new step from `solution`.
    ///
    /// If the previous step did not converge, contact state is rolled back to where that step
    /// started.
    pub fn begin_step(&mut self, previous_step_converged: bool, solution: &DVector<T>) {
        self.old_solution = solution.clone();
        let displaced = displaced_positions(&self.mesh, &self.dof_map, solution, self.displacement);
        for (bucket, search) in &mut self.searches {
            if let SearchState::Projection(locator) = search {
                let positions = if bucket.displaced {
                    &displaced
                } else {
                    &self.reference_positions
                };
                locator.begin_step(previous_step_converged, positions);
            }
        }
        self.cache = PassCache::default();
        debug!(
            "Beginning step at t = {:?} (previous step converged: {previous_step_converged})",
            self.time
        );
    }

    /// Forces a full rebuild of all proximity patches at the next pass.
    pub fn on_mesh_changed(&mut self) {
        self.full_rebuild = true;
        for search in self.searches.values_mut() {
            match search {
                SearchState::Nearest(index) => index.request_patch_rebuild(),
                SearchState::Projection(locator) => locator.request_patch_rebuild(),
                _ => {}
            }
        }
        self.cache = PassCache::default();
    }

    fn positions<'a>(&'a self, displaced: bool) -> &'a [Point2<T>] {
        if displaced {
            &self.cache.displaced
        } else {
            &self.reference_positions
        }
    }

    /// Refreshes all searches for `solution` and returns the displaced node positions.
    fn refresh_searches(&mut self, solution: &DVector<T>) -> Result<Vec<Point2<T>>, EvaluationError> {
        let displaced = displaced_positions(&self.mesh, &self.dof_map, solution, self.displacement);
        let full_rebuild = std::mem::take(&mut self.full_rebuild);
        let reference = &self.reference_positions;
        for (bucket, search) in &mut self.searches {
            let positions = if bucket.displaced { &displaced } else { reference };
            match search {
                SearchState::Nearest(index) => index.refresh(positions, full_rebuild)?,
                SearchState::Projection(locator) => {
                    locator.advance_iteration();
                    locator.update(positions, full_rebuild)?;
                }
                SearchState::NodeElement(locator) => locator.update(&self.mesh, positions)?,
                SearchState::Mortar(segments) => segments.update(positions),
                SearchState::Interface(_) => {}
            }
        }
        Ok(displaced)
    }

    /// Refreshes searches and applicability decisions for `solution`, unless they are current.
    ///
    /// Collective. A search failure on any processor makes every processor return an error.
    fn prepare_pass(&mut self, solution: &DVector<T>) -> Result<(), EvaluationError> {
        if self.cache.solution.as_ref() == Some(solution) {
            return Ok(());
        }
        let refreshed = self.refresh_searches(solution);
        let displaced = self.agree_on_evaluation(refreshed)?;

        let mut cache = PassCache {
            solution: Some(solution.clone()),
            displaced,
            ..PassCache::default()
        };
        let rank = self.comm.rank();
        let field = SolutionState::new(&self.dof_map, solution, &self.old_solution);
        for (bucket, search) in &mut self.searches {
            let positions = if bucket.displaced {
                &cache.displaced
            } else {
                &self.reference_positions
            };
            let ctx = EvaluationContext {
                mesh: &self.mesh,
                field: &field,
                positions,
                physics_residual: &self.physics_residual,
                physics_jacobian: None,
                time: self.time,
                dt: self.dt,
            };
            let active = self.registry.active_in(bucket);
            match search {
                SearchState::Projection(locator) => {
                    let mut requests = Vec::new();
                    for &id in active {
                        let Constraint::NodeFace(constraint) = self.registry.get(id) else {
                            continue;
                        };
                        let mut applied = Vec::new();
                        for info in locator.infos() {
                            let node = info.secondary_node;
                            if self.mesh.node_owner(node) != rank {
                                continue;
                            }
                            let decision = constraint.should_apply(info, &ctx);
                            requests.extend(
                                decision
                                    .requests
                                    .iter()
                                    .map(|&request| NodeStateRequest { node, request }),
                            );
                            if decision.apply {
                                applied.push(node);
                            }
                        }
                        cache.node_face.insert(id, applied);
                    }
                    // Every processor takes part in the exchange, even without local requests
                    let requests: Vec<NodeStateRequest> = self.comm.all_gather(requests).into_iter().flatten().collect();
                    locator.apply_requests(&requests);
                }
                SearchState::NodeElement(locator) => {
                    for &id in active {
                        let Constraint::NodeElem(constraint) = self.registry.get(id) else {
                            continue;
                        };
                        let applied = locator
                            .locations()
                            .filter(|(node, location)| {
                                self.mesh.node_owner(*node) == rank && constraint.should_apply(*node, location, &ctx)
                            })
                            .map(|(node, _)| node)
                            .collect();
                        cache.node_elem.insert(id, applied);
                    }
                }
                SearchState::Nearest(index) => {
                    for &id in active {
                        let Constraint::Nodal(constraint) = self.registry.get(id) else {
                            continue;
                        };
                        let mut pairs = Vec::new();
                        for &node in index.secondary_nodes() {
                            if self.mesh.node_owner(node) != rank {
                                continue;
                            }
                            let Some(nearest) = index.nearest(node) else {
                                continue;
                            };
                            if constraint.should_apply(node, nearest, &ctx) {
                                pairs.push((node, nearest.node));
                            }
                        }
                        cache.nodal.insert(id, pairs);
                    }
                }
                SearchState::Mortar(_) | SearchState::Interface(_) => {}
            }
        }
        for (id, nodes) in &cache.node_face {
            debug!("Constraint '{}' applies to {} nodes", self.registry.get(*id).name(), nodes.len());
        }
        self.cache = cache;
        Ok(())
    }

    fn owned_elements(&self) -> Vec<usize> {
        let rank = self.comm.rank();
        (0..self.mesh.num_elements())
            .filter(|&e| self.mesh.element_owner(e) == rank)
            .collect()
    }

    /// Stages volumetric kernels and boundary conditions in the accumulator.
    fn stage_physics(&mut self, solution: &DVector<T>, tags: &[VectorTag], with_jacobian: bool) -> eyre::Result<()> {
        let elements = self.owned_elements();
        let field = SolutionState::new(&self.dof_map, solution, &self.old_solution);
        let contributions = self.volumetric.assemble(
            &self.kernels,
            &elements,
            VolumetricPass {
                mesh: &self.mesh,
                field: &field,
                tags,
                with_jacobian,
                time: self.time,
                dt: self.dt,
            },
        )?;
        if with_jacobian {
            for (row, col, value) in contributions.jacobian {
                self.accumulator.add_jacobian(&self.dof_map, row, col, value);
            }
        } else {
            for (row, value) in contributions.residual {
                self.accumulator.add_residual(&self.dof_map, row, value);
            }
        }
        let rank = self.comm.rank();
        for bc in &self.dirichlet {
            bc.stage(&self.mesh, &field, rank, with_jacobian, &mut self.accumulator)?;
        }
        Ok(())
    }

    /// Assembles volumetric kernels and boundary conditions and commits them. Collective.
    fn assemble_physics(
        &mut self,
        solution: &DVector<T>,
        tags: &[VectorTag],
        with_jacobian: bool,
    ) -> Result<(), EvaluationError> {
        self.accumulator.clear();
        let staged = self
            .stage_physics(solution, tags, with_jacobian)
            .map_err(EvaluationError::from);
        self.agree_on_evaluation(staged)?;
        if with_jacobian {
            self.accumulator.commit_jacobian(&mut self.jacobian, &self.comm);
        } else {
            self.accumulator.commit_residual(&mut self.residual, &self.comm);
        }
        self.accumulator.clear();
        Ok(())
    }

    /// Folds the contributions of all active constraints, in bucket order.
    fn evaluate_constraints(
        &mut self,
        solution: &DVector<T>,
        physics_jacobian: Option<&GlobalMatrix<T>>,
        tags: &[VectorTag],
    ) -> Result<(), EvaluationError> {
        let with_jacobian = physics_jacobian.is_some();
        let rank = self.comm.rank();
        let (time, dt) = (self.time, self.dt);
        let Self {
            ref mesh,
            ref dof_map,
            ref registry,
            ref searches,
            ref mut accumulator,
            ref mut buffer,
            ref cache,
            ref reference_positions,
            ref physics_residual,
            ref old_solution,
            ..
        } = *self;
        let field = SolutionState::new(dof_map, solution, old_solution);

        for (bucket, search) in searches.iter() {
            let positions = if bucket.displaced {
                &cache.displaced
            } else {
                reference_positions
            };
            let ctx = EvaluationContext {
                mesh,
                field: &field,
                positions,
                physics_residual,
                physics_jacobian,
                time,
                dt,
            };
            for &id in registry.active_in(bucket) {
                let constraint = registry.get(id);
                let base = constraint.base();
                if !tags.contains(&base.vector_tag) {
                    continue;
                }
                let source = base.name.as_str();
                let variable = base.variable;
                let overwrites = if with_jacobian {
                    constraint.overwrites_secondary_jacobian()
                } else {
                    constraint.overwrites_secondary_residual()
                };
                let ownership = RowOwnership {
                    secondary: overwrites,
                    lower: false,
                };

                match (constraint, search) {
                    (Constraint::NodeFace(c), SearchState::Projection(locator)) => {
                        for &node in cached(&cache.node_face, &id) {
                            let Some(info) = locator.info(node) else {
                                continue;
                            };
                            let secondary = ctx.nodes_dofs(&[node], variable);
                            let primary = ctx.nodes_dofs(&info.side_nodes, variable);
                            buffer.prepare(&secondary, &primary, &[]);
                            if !with_jacobian {
                                c.compute_residual(info, &ctx, buffer)?;
                                accumulator.fold_residual(source, buffer, ownership, dof_map);
                                continue;
                            }
                            if overwrites {
                                buffer.set_column_dofs(ColumnSet::Connected, &ctx.connected_dofs(node));
                            }
                            c.compute_jacobian(info, &ctx, buffer)?;
                            accumulator.fold_jacobian(source, buffer, ownership, dof_map);
                            for &coupled in &base.coupled_variables {
                                buffer.prepare(&secondary, &primary, &[]);
                                buffer.set_column_dofs(ColumnSet::Secondary, &ctx.nodes_dofs(&[node], coupled));
                                buffer.set_column_dofs(ColumnSet::Primary, &ctx.nodes_dofs(&info.side_nodes, coupled));
                                c.compute_off_diagonal_jacobian(info, &ctx, coupled, buffer)?;
                                accumulator.fold_jacobian(source, buffer, ownership, dof_map);
                            }
                        }
                    }
                    (Constraint::NodeElem(c), SearchState::NodeElement(locator)) => {
                        for &node in cached(&cache.node_elem, &id) {
                            let location = locator
                                .location(node)
                                .ok_or(SearchError::NodeNotLocated { secondary_node: node })?;
                            let secondary = ctx.nodes_dofs(&[node], variable);
                            let primary = ctx.nodes_dofs(&location.nodes, variable);
                            buffer.prepare(&secondary, &primary, &[]);
                            if !with_jacobian {
                                c.compute_residual(node, location, &ctx, buffer)?;
                                accumulator.fold_residual(source, buffer, ownership, dof_map);
                                continue;
                            }
                            if overwrites {
                                buffer.set_column_dofs(ColumnSet::Connected, &ctx.connected_dofs(node));
                            }
                            c.compute_jacobian(node, location, &ctx, buffer)?;
                            accumulator.fold_jacobian(source, buffer, ownership, dof_map);
                            for &coupled in &base.coupled_variables {
                                buffer.prepare(&secondary, &primary, &[]);
                                buffer.set_column_dofs(ColumnSet::Secondary, &ctx.nodes_dofs(&[node], coupled));
                                buffer.set_column_dofs(ColumnSet::Primary, &ctx.nodes_dofs(&location.nodes, coupled));
                                c.compute_off_diagonal_jacobian(node, location, &ctx, coupled, buffer)?;
                                accumulator.fold_jacobian(source, buffer, ownership, dof_map);
                            }
                        }
                    }
                    (Constraint::Nodal(c), SearchState::Nearest(_)) => {
                        for &(node, primary_node) in cached(&cache.nodal, &id) {
                            let secondary = ctx.nodes_dofs(&[node], variable);
                            let primary = ctx.nodes_dofs(&[primary_node], variable);
                            buffer.prepare(&secondary, &primary, &[]);
                            if with_jacobian {
                                c.compute_jacobian(node, primary_node, &ctx, buffer)?;
                                accumulator.fold_jacobian(source, buffer, ownership, dof_map);
                            } else {
                                c.compute_residual(node, primary_node, &ctx, buffer)?;
                                accumulator.fold_residual(source, buffer, ownership, dof_map);
                            }
                        }
                    }
                    (Constraint::Mortar(c), SearchState::Mortar(segments)) => {
                        let multiplier = c.lagrange_multiplier();
                        let fully_covered = segments.fully_covered_secondary_sides();
                        for segment in segments.segments() {
                            let side = segments.secondary_sides()[segment.secondary_side];
                            if mesh.element_owner(side.element) != rank {
                                continue;
                            }
                            let secondary_nodes = segments.secondary_side_nodes(segment.secondary_side);
                            let primary_nodes = segments.primary_side_nodes(segment.primary_side);
                            let quadrature = segments.quadrature_points(segment, positions, c.quadrature_points());
                            let data = MortarSegmentData {
                                secondary_nodes,
                                primary_nodes,
                                quadrature: &quadrature,
                                fully_covered: fully_covered[segment.secondary_side],
                            };
                            buffer.prepare(
                                &ctx.nodes_dofs(secondary_nodes, variable),
                                &ctx.nodes_dofs(primary_nodes, variable),
                                &ctx.nodes_dofs(secondary_nodes, multiplier),
                            );
                            if with_jacobian {
                                c.compute_jacobian(&data, &ctx, buffer)?;
                                accumulator.fold_jacobian(source, buffer, ownership, dof_map);
                            } else {
                                c.compute_residual(&data, &ctx, buffer)?;
                                accumulator.fold_residual(source, buffer, ownership, dof_map);
                            }
                        }

                        // Multipliers of secondary nodes without any segment are pinned to zero
                        let covered = segments.covered_secondary_nodes();
                        let uncovered: BTreeSet<usize> = (0..segments.secondary_sides().len())
                            .flat_map(|side| segments.secondary_side_nodes(side).iter().copied())
                            .filter(|node| !covered.contains(node) && mesh.node_owner(*node) == rank)
                            .collect();
                        for node in uncovered {
                            for dof in ctx.nodes_dofs(&[node], multiplier) {
                                if with_jacobian {
                                    accumulator.stage_jacobian_replacement(source, dof, [(dof, T::one())]);
                                } else {
                                    accumulator.stage_residual_replacement(source, dof, solution[dof]);
                                }
                            }
                        }
                    }
                    (Constraint::ElemElem(c), SearchState::Interface(pairing)) => {
                        for pair in pairing.pairs() {
                            if mesh.element_owner(pair.secondary.element) != rank {
                                continue;
                            }
                            buffer.prepare(
                                &ctx.nodes_dofs(&pair.secondary_nodes, variable),
                                &ctx.nodes_dofs(&pair.primary_nodes, variable),
                                &[],
                            );
                            if with_jacobian {
                                c.compute_jacobian(pair, &ctx, buffer)?;
                                accumulator.fold_jacobian(source, buffer, ownership, dof_map);
                            } else {
                                c.compute_residual(pair, &ctx, buffer)?;
                                accumulator.fold_residual(source, buffer, ownership, dof_map);
                            }
                        }
                    }
                    (constraint, _) => unreachable!(
                        "constraint '{}' is filed under a search of the wrong kind",
                        constraint.name()
                    ),
                }
            }
        }
        Ok(())
    }

    /// Turns a local evaluation failure into a collective one, so that no processor enters the
    /// next collective operation while another one has left the pass.
    ///
    /// Fatal errors take precedence over rejections of the iterate. The processor that failed
    /// keeps its own error, all others report which processor failed.
    fn agree_on_evaluation<R>(&self, result: Result<R, EvaluationError>) -> Result<R, EvaluationError> {
        let local = match &result {
            Ok(_) => None,
            Err(EvaluationError::RetryWithSmallerStep(reason)) => Some(LocalFailure::Retry(reason.clone())),
            Err(EvaluationError::Fatal(report)) => Some(LocalFailure::Fatal(format!("{report:#}"))),
        };
        let failures = self.comm.all_gather(local);
        let fatal = failures
            .iter()
            .enumerate()
            .find_map(|(rank, failure)| match failure {
                Some(LocalFailure::Fatal(message)) => Some((rank, message)),
                _ => None,
            });
        if let Some((rank, message)) = fatal {
            return match result {
                Err(EvaluationError::Fatal(report)) => Err(EvaluationError::Fatal(report)),
                _ => Err(EvaluationError::Fatal(eyre!("evaluation failed on processor {rank}: {message}"))),
            };
        }
        if failures.iter().any(Option::is_some) {
            return match result {
                Err(EvaluationError::RetryWithSmallerStep(reason)) => Err(EvaluationError::RetryWithSmallerStep(reason)),
                _ => Err(EvaluationError::RetryWithSmallerStep(
                    "the iterate was rejected on another processor".to_string(),
                )),
            };
        }
        result
    }

    fn residual_pass(&mut self, solution: &DVector<T>, tags: &[VectorTag]) -> Result<(), EvaluationError> {
        self.prepare_pass(solution)?;
        self.residual.zero();
        self.assemble_physics(solution, tags, false)?;
        self.physics_residual = self.residual.values().clone();

        let evaluated = self.evaluate_constraints(solution, None, tags);
        self.agree_on_evaluation(evaluated)?;
        self.accumulator.commit_residual(&mut self.residual, &self.comm);
        self.accumulator.clear();
        Ok(())
    }

    fn jacobian_pass(&mut self, solution: &DVector<T>, tags: &[VectorTag]) -> Result<(), EvaluationError> {
        self.prepare_pass(solution)?;
        self.jacobian.zero();
        self.assemble_physics(solution, tags, true)?;

        // Overwriting constraints read the physics rows they replace
        let physics = self.jacobian.clone();
        let evaluated = self.evaluate_constraints(solution, Some(&physics), tags);
        self.agree_on_evaluation(evaluated)?;
        self.accumulator.commit_jacobian(&mut self.jacobian, &self.comm);
        self.accumulator.clear();
        Ok(())
    }

    /// Assembles the residual of physics and constraints for the vector tags in `tags`.
    pub fn compute_residual_contribution(&mut self, solution: &DVector<T>, tags: &[VectorTag]) -> eyre::Result<Outcome<()>> {
        self.ensure_initialized()?;
        catch_retry(self.residual_pass(solution, tags))
    }

    /// Assembles the Jacobian of physics and constraints for the vector tags in `tags`.
    pub fn compute_jacobian_contribution(&mut self, solution: &DVector<T>, tags: &[VectorTag]) -> eyre::Result<Outcome<()>> {
        self.ensure_initialized()?;
        catch_retry(self.jacobian_pass(solution, tags))
    }

    pub fn global_residual(&self) -> &GlobalVector<T> {
        &self.residual
    }

    pub fn global_jacobian(&self) -> &GlobalMatrix<T> {
        &self.jacobian
    }

    /// The physics residual alone, as of the last residual evaluation.
    pub fn physics_residual(&self) -> &DVector<T> {
        &self.physics_residual
    }

    /// Writes the values prescribed by constraints that constrain their secondary values directly.
    ///
    /// Values are computed by the owning processor and exchanged, so that every processor ends up
    /// with the same solution vector. Collective.
    pub fn apply_secondary_values(&mut self, solution: &mut DVector<T>) -> eyre::Result<()> {
        self.ensure_initialized()?;
        self.prepare_pass(solution)?;
        let values = self.secondary_values(solution);
        let values = self.agree_on_evaluation(values)?;
        let values: Vec<(usize, T)> = self.comm.all_gather(values).into_iter().flatten().collect();
        for &(dof, value) in &values {
            solution[dof] = value;
        }
        debug!("Prescribed {} secondary values", values.len());
        self.cache = PassCache::default();
        Ok(())
    }

    /// The prescribed secondary values of the owned nodes.
    fn secondary_values(&self, solution: &DVector<T>) -> Result<Vec<(usize, T)>, EvaluationError> {
        let mut values = Vec::new();
        let field = SolutionState::new(&self.dof_map, solution, &self.old_solution);
        for (bucket, search) in &self.searches {
            let ctx = EvaluationContext {
                mesh: &self.mesh,
                field: &field,
                positions: self.positions(bucket.displaced),
                physics_residual: &self.physics_residual,
                physics_jacobian: None,
                time: self.time,
                dt: self.dt,
            };
            for &id in self.registry.active_in(bucket) {
                match (self.registry.get(id), search) {
                    (Constraint::NodeFace(c), SearchState::Projection(locator)) if c.prescribes_secondary_value() => {
                        let variable = c.base().variable;
                        for &node in cached(&self.cache.node_face, &id) {
                            let Some(info) = locator.info(node) else {
                                continue;
                            };
                            for component in 0..self.dof_map.num_components(variable) {
                                if let Some(dof) = self.dof_map.dof_index(node, variable, component) {
                                    values.push((dof, c.compute_secondary_value(info, &ctx, component)));
                                }
                            }
                        }
                    }
                    (Constraint::NodeElem(c), SearchState::NodeElement(locator)) if c.prescribes_secondary_value() => {
                        let variable = c.base().variable;
                        for &node in cached(&self.cache.node_elem, &id) {
                            let location = locator
                                .location(node)
                                .ok_or(SearchError::NodeNotLocated { secondary_node: node })?;
                            for component in 0..self.dof_map.num_components(variable) {
                                if let Some(dof) = self.dof_map.dof_index(node, variable, component) {
                                    values.push((dof, c.compute_secondary_value(node, location, &ctx, component)));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(values)
    }

    pub fn has_augmented_constraints(&self) -> bool {
        self.registry
            .constraints()
            .any(|(_, c)| matches!(c, Constraint::NodeFace(c) if c.is_augmented()))
    }

    /// Whether all augmented Lagrange constraints satisfy their penetration tolerance. Collective.
    pub fn check_outer_convergence(&mut self) -> ConvergenceStatus {
        let rank = self.comm.rank();
        let mut converged = true;
        let mut diverged = false;
        let mut max_gap = T::zero();
        for (bucket, search) in &self.searches {
            let SearchState::Projection(locator) = search else {
                continue;
            };
            for &id in self.registry.active_in(bucket) {
                let Constraint::NodeFace(c) = self.registry.get(id) else {
                    continue;
                };
                if !c.is_augmented() {
                    continue;
                }
                for info in locator
                    .infos()
                    .filter(|info| self.mesh.node_owner(info.secondary_node) == rank)
                {
                    if !info.gap.is_finite() {
                        diverged = true;
                    }
                    if info.captured {
                        max_gap = max_gap.max(info.gap.abs());
                    }
                    converged &= c.augmented_converged(info);
                }
            }
        }
        let diverged = self.comm.all_reduce_or(diverged);
        let unconverged = self.comm.all_reduce_or(!converged);
        let max_gap = self.comm.all_reduce_max(max_gap);
        let status = if diverged {
            ConvergenceStatus::Diverged
        } else if unconverged {
            ConvergenceStatus::NotConverged
        } else {
            ConvergenceStatus::Converged
        };
        info!("Augmented Lagrange check: {status:?} (largest captured gap {max_gap:?})");
        status
    }

    /// Updates the multipliers of all augmented Lagrange constraints from the current gaps.
    pub fn update_augmented_multipliers(&mut self) {
        for (bucket, search) in &self.searches {
            let SearchState::Projection(locator) = search else {
                continue;
            };
            for id in self.registry.active_in(bucket).to_vec() {
                if let Constraint::NodeFace(c) = self.registry.get_mut(id) {
                    if c.is_augmented() {
                        for info in locator.infos() {
                            c.update_augmented_multiplier(info);
                        }
                    }
                }
            }
        }
        // Decisions depend on the multipliers
        self.cache = PassCache::default();
    }

    /// The largest fraction of `update` that keeps the iterative slip of nodes sliding against
    /// friction within the damper limits. Collective.
    pub fn damping_factor(&mut self, solution: &DVector<T>, update: &DVector<T>) -> eyre::Result<Outcome<T>> {
        self.ensure_initialized()?;
        let prepared = self.prepare_pass(solution);
        catch_retry(prepared.and_then(|()| self.slip_damping(solution, update)))
    }

    fn slip_damping(&self, solution: &DVector<T>, update: &DVector<T>) -> Result<T, EvaluationError> {
        let rank = self.comm.rank();
        let trial = solution + update;
        let trial_positions = displaced_positions(&self.mesh, &self.dof_map, &trial, self.displacement);
        let mut factor = T::one();
        for (bucket, search) in &self.searches {
            let SearchState::Projection(locator) = search else {
                continue;
            };
            for &id in self.registry.active_in(bucket) {
                let Constraint::NodeFace(c) = self.registry.get(id) else {
                    continue;
                };
                let Some(damper) = c.slip_damper() else {
                    continue;
                };
                let mut constraint_factor = T::one();
                for info in locator.infos() {
                    let node = info.secondary_node;
                    let slipping = info.captured && info.mechanical_status == MechanicalStatus::SlippingFriction;
                    if !slipping || self.mesh.node_owner(node) != rank {
                        continue;
                    }
                    let (Some(start_point), Some(start)) = (
                        locator.step_start_point(&info.side_nodes, info.closest_point_local),
                        locator.step_start_position(node),
                    ) else {
                        continue;
                    };
                    let point = side_segment(&trial_positions, &info.side_nodes).map_reference_coords(info.closest_point_local);
                    let relative = (trial_positions[node] - start) - (point - start_point);
                    let trial_slip = relative.dot(&info.tangent);
                    constraint_factor = constraint_factor.min(damper.node_factor(info.incremental_slip_prev_iteration, info.incremental_slip, trial_slip));
                }
                let constraint_factor = self.comm.all_reduce_min(constraint_factor);
                factor = factor.min(damper.accept(constraint_factor)?);
            }
        }
        if factor < T::one() {
            debug!("Damping Newton update by {factor:?}");
        }
        Ok(factor)
    }

    pub fn checkpoint(&self) -> ContactCheckpoint<T> {
        let buckets = self
            .searches
            .iter()
            .filter_map(|(bucket, search)| match search {
                SearchState::Projection(locator) => Some(ProjectionCheckpoint {
                    bucket: *bucket,
                    infos: locator.infos().cloned().collect(),
                    step_start_positions: locator.step_start_positions().map(<[_]>::to_vec),
                }),
                _ => None,
            })
            .collect();
        ContactCheckpoint { buckets }
    }

    pub fn restore(&mut self, checkpoint: &ContactCheckpoint<T>) -> eyre::Result<()> {
        self.ensure_initialized()?;
        for saved in &checkpoint.buckets {
            match self.searches.get_mut(&saved.bucket) {
                Some(SearchState::Projection(locator)) => {
                    locator.restore(saved.infos.iter().cloned(), saved.step_start_positions.clone())
                }
                _ => bail!(
                    "checkpoint refers to a node-face search {:?} that does not exist",
                    saved.bucket
                ),
            }
        }
        self.cache = PassCache::default();
        Ok(())
    }
}

impl<T: Real, C: Communicator> NonlinearSystem<T> for ConstraintSystem<T, C> {
    fn num_dofs(&self) -> usize {
        self.dof_map.num_dofs()
    }

    fn compute_residual(&mut self, solution: &DVector<T>) -> eyre::Result<Outcome<()>> {
        self.compute_residual_contribution(solution, &ALL_TAGS)
    }

    fn residual(&self) -> &DVector<T> {
        self.residual.values()
    }

    fn compute_jacobian(&mut self, solution: &DVector<T>) -> eyre::Result<Outcome<()>> {
        self.compute_jacobian_contribution(solution, &ALL_TAGS)
    }

    fn jacobian(&self) -> &CsrMatrix<T> {
        self.jacobian.csr()
    }

    fn damping_factor(&mut self, solution: &DVector<T>, update: &DVector<T>) -> eyre::Result<Outcome<T>> {
        ConstraintSystem::damping_factor(self, solution, update)
    }
}

impl<T: Real, C: Communicator> AugmentedSystem<T> for ConstraintSystem<T, C> {
    fn has_augmented_constraints(&self) -> bool {
        ConstraintSystem::has_augmented_constraints(self)
    }

    fn check_outer_convergence(&mut self) -> ConvergenceStatus {
        ConstraintSystem::check_outer_convergence(self)
    }

    fn update_augmented_multipliers(&mut self) {
        ConstraintSystem::update_augmented_multipliers(self)
    }
}
