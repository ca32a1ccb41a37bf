use crate::assembly::VectorTag;
use crate::dof::VariableId;
use crate::element::ElementType;
use crate::field::FieldAccess;
use crate::mesh::{MeshQuery, SubdomainTag};
use crate::Real;
use eyre::eyre;
use nalgebra::{DMatrix, DVector, Point2};
use rayon::prelude::*;
use std::cell::RefCell;
use thread_local::ThreadLocal;

/// Geometry and solution data of one element, as seen by a [`VolumetricKernel`].
///
/// Local DOFs are ordered node by node, and component by component within a node.
#[derive(Debug)]
pub struct ElementData<'a, T: Real> {
    pub element: usize,
    pub element_type: ElementType,
    pub nodes: &'a [usize],
    /// Reference coordinates of the element nodes.
    pub coords: &'a [Point2<T>],
    pub num_components: usize,
    /// Current values at the local DOFs.
    pub values: &'a [T],
    pub old_values: &'a [T],
    pub time: T,
    pub dt: T,
}

/// An element-wise weak-form contribution to the residual and Jacobian of one variable.
pub trait VolumetricKernel<T: Real>: Send + Sync {
    fn name(&self) -> &str;

    fn variable(&self) -> VariableId;

    fn vector_tag(&self) -> VectorTag {
        VectorTag::NonTime
    }

    /// Restricts the kernel to elements of the given subdomains. `None` means all elements.
    fn subdomains(&self) -> Option<&[SubdomainTag]> {
        None
    }

    /// Computes the local residual and, if requested, the local Jacobian.
    ///
    /// Both outputs are zeroed and sized to the number of local DOFs before the call.
    fn assemble_element(
        &self,
        data: &ElementData<T>,
        residual: &mut DVector<T>,
        jacobian: Option<&mut DMatrix<T>>,
    ) -> eyre::Result<()>;
}

/// Unscaled global triplets produced by volumetric kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumetricContributions<T> {
    pub residual: Vec<(usize, T)>,
    pub jacobian: Vec<(usize, usize, T)>,
}

impl<T> Default for VolumetricContributions<T> {
    fn default() -> Self {
        Self {
            residual: Vec::new(),
            jacobian: Vec::new(),
        }
    }
}

impl<T> VolumetricContributions<T> {
    fn append(&mut self, mut other: Self) {
        self.residual.append(&mut other.residual);
        self.jacobian.append(&mut other.jacobian);
    }
}

#[derive(Debug)]
struct ElementWorkspace<T: Real> {
    coords: Vec<Point2<T>>,
    dofs: Vec<usize>,
    values: Vec<T>,
    old_values: Vec<T>,
    residual: DVector<T>,
    jacobian: DMatrix<T>,
}

impl<T: Real> Default for ElementWorkspace<T> {
    fn default() -> Self {
        Self {
            coords: Vec::new(),
            dofs: Vec::new(),
            values: Vec::new(),
            old_values: Vec::new(),
            residual: DVector::zeros(0),
            jacobian: DMatrix::zeros(0, 0),
        }
    }
}

/// Parallel map-reduce of volumetric kernels over a range of elements.
///
/// Each worker thread keeps its own element workspace. The per-thread triplet lists are
/// concatenated in element order, so the result does not depend on the number of threads.
#[derive(Debug)]
pub struct VolumetricAssembler<T: Real> {
    workspace: ThreadLocal<RefCell<ElementWorkspace<T>>>,
}

impl<T: Real> Default for VolumetricAssembler<T> {
    fn default() -> Self {
        Self {
            workspace: ThreadLocal::new(),
        }
    }
}

/// The inputs shared by all elements of a volumetric pass.
#[derive(Copy, Clone)]
pub struct VolumetricPass<'a, T: Real> {
    pub mesh: &'a (dyn MeshQuery<T> + Sync),
    pub field: &'a (dyn FieldAccess<T> + Sync),
    pub tags: &'a [VectorTag],
    pub with_jacobian: bool,
    pub time: T,
    pub dt: T,
}

impl<T: Real> VolumetricAssembler<T> {
    pub fn assemble(
        &self,
        kernels: &[Box<dyn VolumetricKernel<T>>],
        elements: &[usize],
        pass: VolumetricPass<T>,
    ) -> eyre::Result<VolumetricContributions<T>> {
        elements
            .par_iter()
            .with_min_len(16)
            .try_fold(VolumetricContributions::default, |mut acc, &element| {
                let ws = &mut *self.workspace.get_or_default().borrow_mut();
                for kernel in kernels {
                    if !pass.tags.contains(&kernel.vector_tag()) {
                        continue;
                    }
                    let subdomain = pass.mesh.element_subdomain(element);
                    if let Some(subdomains) = kernel.subdomains() {
                        if !subdomains.contains(&subdomain) {
                            continue;
                        }
                    }
                    assemble_kernel_element(kernel.as_ref(), element, &pass, ws, &mut acc)?;
                }
                Ok::<_, eyre::Report>(acc)
            })
            .try_reduce(VolumetricContributions::default, |mut a, b| {
                a.append(b);
                Ok(a)
            })
    }
}

fn assemble_kernel_element<T: Real>(
    kernel: &dyn VolumetricKernel<T>,
    element: usize,
    pass: &VolumetricPass<T>,
    ws: &mut ElementWorkspace<T>,
    acc: &mut VolumetricContributions<T>,
) -> eyre::Result<()> {
    let mesh = pass.mesh;
    let dof_map = pass.field.dof_map();
    let variable = kernel.variable();
    let num_components = dof_map.num_components(variable);
    let nodes = mesh.element_nodes(element);

    ws.coords.clear();
    ws.coords
        .extend(nodes.iter().map(|&n| mesh.reference_position(n)));
    ws.dofs.clear();
    for &node in nodes {
        for c in 0..num_components {
            let dof = dof_map.dof_index(node, variable, c).ok_or_else(|| {
                eyre!(
                    "kernel '{}': variable '{}' has no DOF at node {node}",
                    kernel.name(),
                    dof_map.variable(variable).name
                )
            })?;
            ws.dofs.push(dof);
        }
    }
    ws.values.clear();
    ws.values
        .extend(ws.dofs.iter().map(|&dof| pass.field.current()[dof]));
    ws.old_values.clear();
    ws.old_values
        .extend(ws.dofs.iter().map(|&dof| pass.field.old()[dof]));

    let n = ws.dofs.len();
    ws.residual.resize_vertically_mut(n, T::zero());
    ws.residual.fill(T::zero());
    ws.jacobian.resize_mut(n, n, T::zero());
    ws.jacobian.fill(T::zero());

    let data = ElementData {
        element,
        element_type: mesh.element_type(element),
        nodes,
        coords: &ws.coords,
        num_components,
        values: &ws.values,
        old_values: &ws.old_values,
        time: pass.time,
        dt: pass.dt,
    };
    let jacobian = pass.with_jacobian.then_some(&mut ws.jacobian);
    kernel.assemble_element(&data, &mut ws.residual, jacobian)?;

    for (i, &row) in ws.dofs.iter().enumerate() {
        acc.residual.push((row, ws.residual[i]));
        if pass.with_jacobian {
            for (j, &col) in ws.dofs.iter().enumerate() {
                acc.jacobian.push((row, col, ws.jacobian[(i, j)]));
            }
        }
    }
    Ok(())
}
