//! Reference volumetric kernels and nodal Dirichlet conditions.
use crate::assembly::{AssemblyAccumulator, ElementData, VectorTag, VolumetricKernel};
use crate::dof::VariableId;
use crate::element::reference_jacobian;
use crate::field::FieldAccess;
use crate::mesh::{BoundaryTag, MeshQuery, SubdomainTag};
use crate::quadrature::element_quadrature;
use crate::Real;
use eyre::{bail, eyre};
use itertools::izip;
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use numeric_literals::replace_float_literals;

/// Calls `f(weight, basis, gradients)` at every quadrature point of the element, with the weight
/// including the Jacobian determinant and gradients taken with respect to physical coordinates.
fn for_each_quadrature_point<T: Real>(
    data: &ElementData<T>,
    mut f: impl FnMut(T, &[T], &[Vector2<T>]),
) -> eyre::Result<()> {
    let element_type = data.element_type;
    let (weights, points) = element_quadrature::<T>(element_type);
    let n = element_type.num_nodes();
    let mut basis = vec![T::zero(); n];
    let mut reference_gradients = vec![Vector2::zeros(); n];
    let mut gradients = vec![Vector2::zeros(); n];
    for (w, xi) in izip!(weights, points) {
        let jacobian = reference_jacobian(element_type, data.coords, &xi);
        let det = jacobian.determinant();
        if det <= T::zero() {
            bail!("element {} is inverted or degenerate (det J = {:?})", data.element, det);
        }
        let inverse_transpose = jacobian
            .try_inverse()
            .ok_or_else(|| eyre!("element {} has a singular Jacobian", data.element))?
            .transpose();
        element_type.populate_basis(&mut basis, &xi);
        element_type.populate_basis_gradients(&mut reference_gradients, &xi);
        for (g, g_ref) in izip!(&mut gradients, &reference_gradients) {
            *g = inverse_transpose * g_ref;
        }
        f(w * det, &basis, &gradients);
    }
    Ok(())
}

/// Steady diffusion `-div(k grad u) = f` of a scalar variable.
#[derive(Debug, Clone)]
pub struct DiffusionKernel<T: Real> {
    pub variable: VariableId,
    pub conductivity: T,
    pub source: T,
    pub subdomains: Option<Vec<SubdomainTag>>,
}

impl<T: Real> DiffusionKernel<T> {
    pub fn new(variable: VariableId, conductivity: T) -> Self {
        Self {
            variable,
            conductivity,
            source: T::zero(),
            subdomains: None,
        }
    }

    pub fn with_source(self, source: T) -> Self {
        Self { source, ..self }
    }

    pub fn on_subdomains(self, subdomains: Vec<SubdomainTag>) -> Self {
        Self {
            subdomains: Some(subdomains),
            ..self
        }
    }
}

impl<T: Real> VolumetricKernel<T> for DiffusionKernel<T> {
    fn name(&self) -> &str {
        "diffusion"
    }

    fn variable(&self) -> VariableId {
        self.variable
    }

    fn subdomains(&self) -> Option<&[SubdomainTag]> {
        self.subdomains.as_deref()
    }

    fn assemble_element(
        &self,
        data: &ElementData<T>,
        residual: &mut DVector<T>,
        mut jacobian: Option<&mut DMatrix<T>>,
    ) -> eyre::Result<()> {
        let k = self.conductivity;
        for_each_quadrature_point(data, |w, basis, gradients| {
            let grad_u = izip!(gradients, data.values).fold(Vector2::zeros(), |acc, (g, u)| acc + g * *u);
            for (a, (n_a, g_a)) in izip!(basis, gradients).enumerate() {
                residual[a] += w * (k * g_a.dot(&grad_u) - self.source * *n_a);
                if let Some(jacobian) = jacobian.as_deref_mut() {
                    for (b, g_b) in gradients.iter().enumerate() {
                        jacobian[(a, b)] += w * k * g_a.dot(g_b);
                    }
                }
            }
        })
    }
}

/// Linear elasticity under plane strain for a two-component displacement variable.
#[derive(Debug, Clone)]
pub struct PlaneStrainElasticity<T: Real> {
    pub variable: VariableId,
    pub young_modulus: T,
    pub poisson_ratio: T,
    pub body_force: Vector2<T>,
    pub subdomains: Option<Vec<SubdomainTag>>,
}

impl<T: Real> PlaneStrainElasticity<T> {
    pub fn new(variable: VariableId, young_modulus: T, poisson_ratio: T) -> Self {
        Self {
            variable,
            young_modulus,
            poisson_ratio,
            body_force: Vector2::zeros(),
            subdomains: None,
        }
    }

    pub fn with_body_force(self, body_force: Vector2<T>) -> Self {
        Self { body_force, ..self }
    }

    /// Lamé parameters `(lambda, mu)`.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn lame_parameters(&self) -> (T, T) {
        let e = self.young_modulus;
        let nu = self.poisson_ratio;
        let lambda = e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
        let mu = e / (2.0 * (1.0 + nu));
        (lambda, mu)
    }
}

impl<T: Real> VolumetricKernel<T> for PlaneStrainElasticity<T> {
    fn name(&self) -> &str {
        "plane_strain_elasticity"
    }

    fn variable(&self) -> VariableId {
        self.variable
    }

    fn subdomains(&self) -> Option<&[SubdomainTag]> {
        self.subdomains.as_deref()
    }

    fn assemble_element(
        &self,
        data: &ElementData<T>,
        residual: &mut DVector<T>,
        mut jacobian: Option<&mut DMatrix<T>>,
    ) -> eyre::Result<()> {
        if data.num_components != 2 {
            bail!("plane strain elasticity requires a two-component variable");
        }
        let (lambda, mu) = self.lame_parameters();
        let two = T::one() + T::one();
        for_each_quadrature_point(data, |w, basis, gradients| {
            // grad_u[(i, j)] = du_i / dx_j
            let grad_u = gradients
                .iter()
                .enumerate()
                .fold(Matrix2::zeros(), |acc, (a, g)| {
                    let u_a = Vector2::new(data.values[2 * a], data.values[2 * a + 1]);
                    acc + u_a * g.transpose()
                });
            let strain = (grad_u + grad_u.transpose()) / two;
            let stress = Matrix2::identity() * (lambda * strain.trace()) + strain * (two * mu);

            for (a, (n_a, g_a)) in izip!(basis, gradients).enumerate() {
                let force = stress * g_a - self.body_force * *n_a;
                residual[2 * a] += w * force.x;
                residual[2 * a + 1] += w * force.y;
                if let Some(jacobian) = jacobian.as_deref_mut() {
                    for (b, g_b) in gradients.iter().enumerate() {
                        for i in 0..2 {
                            for k in 0..2 {
                                let mut value = lambda * g_a[i] * g_b[k] + mu * g_a[k] * g_b[i];
                                if i == k {
                                    value += mu * g_a.dot(g_b);
                                }
                                jacobian[(2 * a + i, 2 * b + k)] += w * value;
                            }
                        }
                    }
                }
            }
        })
    }
}

/// The backward Euler time derivative `rho (u - u_old) / dt` with a consistent mass matrix.
#[derive(Debug, Clone)]
pub struct TimeDerivativeKernel<T: Real> {
    pub variable: VariableId,
    pub density: T,
}

impl<T: Real> VolumetricKernel<T> for TimeDerivativeKernel<T> {
    fn name(&self) -> &str {
        "time_derivative"
    }

    fn variable(&self) -> VariableId {
        self.variable
    }

    fn vector_tag(&self) -> VectorTag {
        VectorTag::Time
    }

    fn assemble_element(
        &self,
        data: &ElementData<T>,
        residual: &mut DVector<T>,
        mut jacobian: Option<&mut DMatrix<T>>,
    ) -> eyre::Result<()> {
        if data.dt <= T::zero() {
            bail!("time derivative requires a positive time step");
        }
        let nc = data.num_components;
        let factor = self.density / data.dt;
        for_each_quadrature_point(data, |w, basis, _| {
            for c in 0..nc {
                let rate = izip!(basis, data.values.iter().skip(c).step_by(nc), data.old_values.iter().skip(c).step_by(nc))
                    .fold(T::zero(), |acc, (n, u, u_old)| acc + *n * (*u - *u_old));
                for (a, n_a) in basis.iter().enumerate() {
                    residual[nc * a + c] += w * factor * *n_a * rate;
                    if let Some(jacobian) = jacobian.as_deref_mut() {
                        for (b, n_b) in basis.iter().enumerate() {
                            jacobian[(nc * a + c, nc * b + c)] += w * factor * *n_a * *n_b;
                        }
                    }
                }
            }
        })
    }
}

/// Prescribes one component of a variable on the nodes of a side set.
///
/// The condition replaces the residual row with `u - value` and the Jacobian row with the
/// corresponding unit row.
#[derive(Debug, Clone)]
pub struct DirichletBc<T: Real> {
    pub name: String,
    pub variable: VariableId,
    pub component: usize,
    pub boundary: BoundaryTag,
    pub value: T,
}

impl<T: Real> DirichletBc<T> {
    pub fn new(name: impl Into<String>, variable: VariableId, component: usize, boundary: BoundaryTag, value: T) -> Self {
        Self {
            name: name.into(),
            variable,
            component,
            boundary,
            value,
        }
    }

    /// Stages the replaced rows of the nodes owned by `rank`.
    pub fn stage(
        &self,
        mesh: &dyn MeshQuery<T>,
        field: &dyn FieldAccess<T>,
        rank: usize,
        with_jacobian: bool,
        accumulator: &mut AssemblyAccumulator<T>,
    ) -> eyre::Result<()> {
        for node in mesh.boundary_nodes(self.boundary) {
            if mesh.node_owner(node) != rank {
                continue;
            }
            let dof = field
                .dof_index(node, self.variable, self.component)
                .ok_or_else(|| eyre!("boundary condition '{}': no DOF at node {node}", self.name))?;
            if with_jacobian {
                accumulator.stage_jacobian_replacement(&self.name, dof, [(dof, T::one())]);
            } else {
                accumulator.stage_residual_replacement(&self.name, dof, field.current()[dof] - self.value);
            }
        }
        Ok(())
    }
}
