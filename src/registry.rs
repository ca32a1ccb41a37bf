//! Classification of constraints by kind and interaction key.
use crate::constraint::{Constraint, ConstraintKind, InteractionKey};
use crate::dof::{DofMap, VariableId};
use crate::error::ConfigurationError;
use crate::mesh::MeshQuery;
use crate::Real;
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(pub usize);

/// Constraints sharing a bucket also share their geometric search.
///
/// Buckets are ordered by kind first, which is the order in which they are evaluated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub kind: ConstraintKind,
    pub key: InteractionKey,
    /// Whether the search runs on the displaced configuration.
    pub displaced: bool,
}

impl BucketKey {
    pub fn of<T: Real>(constraint: &Constraint<T>) -> Self {
        let base = constraint.base();
        Self {
            kind: constraint.kind(),
            key: base.key,
            displaced: base.use_displaced_mesh,
        }
    }
}

/// A global row written by a constraint or boundary condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowClaim {
    pub dof: usize,
    pub source: String,
    /// Whether the row is replaced rather than added to.
    pub overwrite: bool,
}

/// Owns all constraints and indexes them by [`BucketKey`].
///
/// Membership of a bucket is fixed when a constraint is added. The *active* members of each
/// bucket are recomputed by [`update_active_set`](Self::update_active_set).
pub struct ConstraintRegistry<T: Real> {
    constraints: Vec<Constraint<T>>,
    names: FxHashMap<String, ConstraintId>,
    buckets: BTreeMap<BucketKey, Vec<ConstraintId>>,
    active: BTreeMap<BucketKey, Vec<ConstraintId>>,
}

impl<T: Real> Default for ConstraintRegistry<T> {
    fn default() -> Self {
        Self {
            constraints: Vec::new(),
            names: FxHashMap::default(),
            buckets: BTreeMap::new(),
            active: BTreeMap::new(),
        }
    }
}

impl<T: Real> std::fmt::Debug for ConstraintRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintRegistry")
            .field("constraints", &self.constraints)
            .field("buckets", &self.buckets)
            .field("active", &self.active)
            .finish()
    }
}

/// The interaction keys a kind can be registered under.
fn check_key(kind: ConstraintKind, key: &InteractionKey, name: &str) -> Result<(), ConfigurationError> {
    let valid = matches!(
        (kind, key),
        (
            ConstraintKind::Nodal | ConstraintKind::NodeFace | ConstraintKind::Mortar,
            InteractionKey::BoundaryPair { .. }
        ) | (ConstraintKind::NodeElem, InteractionKey::SubdomainPair { .. })
            | (ConstraintKind::ElemElem, InteractionKey::Interface(_))
    );
    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidInteractionKey {
            constraint: name.to_string(),
            reason: format!("{kind:?} constraints cannot be registered under {key:?}"),
        })
    }
}

impl<T: Real> ConstraintRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files a constraint under its bucket. New constraints are active.
    pub fn add(&mut self, constraint: Constraint<T>) -> Result<ConstraintId, ConfigurationError> {
        let name = constraint.name().to_string();
        if self.names.contains_key(&name) {
            return Err(ConfigurationError::DuplicateConstraint(name));
        }
        let base = constraint.base();
        check_key(constraint.kind(), &base.key, &name)?;
        let bucket = BucketKey::of(&constraint);
        let enabled = base.activation.enabled;

        let id = ConstraintId(self.constraints.len());
        self.constraints.push(constraint);
        self.names.insert(name.clone(), id);
        self.buckets.entry(bucket).or_default().push(id);
        let active = self.active.entry(bucket).or_default();
        if enabled {
            active.push(id);
        }
        debug!("Registered constraint '{name}' under {bucket:?}");
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn get(&self, id: ConstraintId) -> &Constraint<T> {
        &self.constraints[id.0]
    }

    pub fn get_mut(&mut self, id: ConstraintId) -> &mut Constraint<T> {
        &mut self.constraints[id.0]
    }

    pub fn id_by_name(&self, name: &str) -> Option<ConstraintId> {
        self.names.get(name).copied()
    }

    /// All constraints, in registration order.
    pub fn constraints(&self) -> impl Iterator<Item = (ConstraintId, &Constraint<T>)> {
        self.constraints
            .iter()
            .enumerate()
            .map(|(i, c)| (ConstraintId(i), c))
    }

    /// All registered buckets, in evaluation order.
    pub fn bucket_keys(&self) -> impl Iterator<Item = BucketKey> + '_ {
        self.buckets.keys().copied()
    }

    /// All members of a bucket, active or not.
    pub fn bucket_members(&self, bucket: &BucketKey) -> &[ConstraintId] {
        self.buckets
            .get(bucket)
            .map(Vec::as_slice)
            .unwrap_or_else(|| panic!("no constraints are registered under {bucket:?}"))
    }

    /// Whether the bucket has at least one active constraint.
    ///
    /// # Panics
    ///
    /// Panics if nothing was ever registered under the bucket.
    pub fn has_active(&self, kind: ConstraintKind, key: InteractionKey, displaced: bool) -> bool {
        !self.get_active(kind, key, displaced).is_empty()
    }

    /// The active constraints of a bucket, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if nothing was ever registered under the bucket.
    pub fn get_active(&self, kind: ConstraintKind, key: InteractionKey, displaced: bool) -> &[ConstraintId] {
        self.active_in(&BucketKey { kind, key, displaced })
    }

    pub fn active_in(&self, bucket: &BucketKey) -> &[ConstraintId] {
        self.active
            .get(bucket)
            .map(Vec::as_slice)
            .unwrap_or_else(|| panic!("no constraints are registered under {bucket:?}"))
    }

    /// Recomputes the active members of every bucket for the given time. Idempotent.
    pub fn update_active_set(&mut self, time: T) {
        for (bucket, members) in &self.buckets {
            let active: Vec<_> = members
                .iter()
                .copied()
                .filter(|id| {
                    self.constraints[id.0]
                        .base()
                        .activation
                        .is_active(time)
                })
                .collect();
            self.active.insert(*bucket, active);
        }
    }

    /// The global rows each constraint may write, derived from the mesh regions it is registered
    /// under. Primary rows of subdomain pairs are not included.
    pub fn row_claims(&self, mesh: &dyn MeshQuery<T>, dof_map: &DofMap<T>) -> Vec<RowClaim> {
        let mut claims = Vec::new();
        let mut push = |nodes: &[usize], variable: VariableId, source: &str, overwrite: bool| {
            let mut dofs = Vec::new();
            for &node in nodes {
                dof_map.extend_node_dofs(node, variable, &mut dofs);
            }
            claims.extend(dofs.into_iter().map(|dof| RowClaim {
                dof,
                source: source.to_string(),
                overwrite,
            }));
        };

        for (_, constraint) in self.constraints() {
            let base = constraint.base();
            let (secondary, primary) = match base.key {
                InteractionKey::BoundaryPair { secondary, primary } => {
                    (mesh.boundary_nodes(secondary), mesh.boundary_nodes(primary))
                }
                // Primary rows are those of the elements containing secondary nodes, which only
                // the search knows; see `ConstraintSystem::initialize`.
                InteractionKey::SubdomainPair { secondary, .. } => (subdomain_nodes(mesh, secondary), Vec::new()),
                InteractionKey::Interface(tag) => match mesh.interface(tag) {
                    Some(sides) => (mesh.boundary_nodes(sides.secondary), mesh.boundary_nodes(sides.primary)),
                    None => continue,
                },
            };
            let overwrite = constraint.overwrites_secondary_residual() || constraint.overwrites_secondary_jacobian();
            push(&secondary, base.variable, &base.name, overwrite);
            push(&primary, base.variable, &base.name, false);
            if let Constraint::Mortar(mortar) = constraint {
                push(&secondary, mortar.lagrange_multiplier(), &base.name, false);
            }
        }
        claims
    }
}

fn subdomain_nodes<T: Real>(mesh: &dyn MeshQuery<T>, tag: crate::mesh::SubdomainTag) -> Vec<usize> {
    let mut nodes: Vec<usize> = mesh
        .subdomain_elements(tag)
        .into_iter()
        .flat_map(|e| mesh.element_nodes(e).to_vec())
        .collect();
    nodes.sort_unstable();
    nodes.dedup();
    nodes
}

/// Rejects rows that are overwritten by one source and also written by another.
pub fn check_row_ownership<T: Real>(claims: &[RowClaim], dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
    let mut by_dof: BTreeMap<usize, Vec<&RowClaim>> = BTreeMap::new();
    for claim in claims {
        by_dof.entry(claim.dof).or_default().push(claim);
    }
    for (dof, claims) in by_dof {
        let Some(owner) = claims.iter().find(|c| c.overwrite) else {
            continue;
        };
        if let Some(other) = claims.iter().find(|c| c.source != owner.source) {
            let variable = dof_map.dof_variable(dof);
            return Err(ConfigurationError::ConflictingRowOwnership {
                node: dof_map.dof_node(dof),
                variable: dof_map.variable(variable).name.clone(),
                first: owner.source.clone(),
                second: other.source.clone(),
            });
        }
    }
    Ok(())
}
