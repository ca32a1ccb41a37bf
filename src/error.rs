//! Error types and the recoverable evaluation outcome.
//!
//! Three channels are distinguished:
//!
//! - [`ConfigurationError`]: fatal problems detected while setting up constraints and searches.
//! - [`SearchError`]: fatal degeneracies of the geometric search.
//! - [`Outcome::RetryWithSmallerStep`]: a recoverable rejection of the current iterate, returned
//!   from the residual/Jacobian entry points so that the time stepper can cut the step.
//!
//! Everything else is reported through [`eyre::Report`].
use crate::mesh::{BoundaryTag, InterfaceTag, SubdomainTag};
use std::fmt;
use std::fmt::{Display, Formatter};

/// Fatal setup errors.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// A boundary used by a constraint has no nodes or sides.
    EmptyBoundary { constraint: String, boundary: BoundaryTag },
    /// A subdomain used by a constraint has no elements.
    EmptySubdomain { constraint: String, subdomain: SubdomainTag },
    /// The interface is not defined on the mesh.
    UnknownInterface { constraint: String, interface: InterfaceTag },
    /// A boundary name could not be resolved.
    UnknownBoundaryName(String),
    /// Two constraints were registered with the same name.
    DuplicateConstraint(String),
    /// A variable required by a constraint does not exist or has the wrong number of components.
    MissingVariable { constraint: String, variable: String },
    /// The constraint needs a coupled field (e.g. displacements) that was not provided.
    MissingCoupledField { constraint: String, field: String },
    /// Secondary and primary sides of an interface do not pair up.
    MismatchedInterfacePairs { constraint: String, secondary: usize, primary: usize },
    /// A row overwritten by one constraint is also targeted by another constraint.
    ConflictingRowOwnership { node: usize, variable: String, first: String, second: String },
    /// The requested combination of contact formulation and friction model is not supported.
    UnsupportedContactModel { constraint: String, reason: String },
    /// The mortar discretization only supports straight (two-node) sides.
    UnsupportedMortarSide { constraint: String, nodes: usize },
    /// The constraint kind cannot be registered under the given interaction key.
    InvalidInteractionKey { constraint: String, reason: String },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBoundary { constraint, boundary } => {
                write!(f, "constraint '{constraint}': boundary {} contains no entities", boundary.0)
            }
            Self::EmptySubdomain { constraint, subdomain } => {
                write!(f, "constraint '{constraint}': subdomain {} contains no elements", subdomain.0)
            }
            Self::UnknownInterface { constraint, interface } => {
                write!(f, "constraint '{constraint}': interface {} is not defined on the mesh", interface.0)
            }
            Self::UnknownBoundaryName(name) => write!(f, "no boundary named '{name}'"),
            Self::DuplicateConstraint(name) => write!(f, "a constraint named '{name}' is already registered"),
            Self::MissingVariable { constraint, variable } => {
                write!(f, "constraint '{constraint}': variable '{variable}' is missing or incompatible")
            }
            Self::MissingCoupledField { constraint, field } => {
                write!(f, "constraint '{constraint}' requires the coupled field '{field}'")
            }
            Self::MismatchedInterfacePairs {
                constraint,
                secondary,
                primary,
            } => write!(
                f,
                "constraint '{constraint}': {secondary} secondary sides cannot be paired with {primary} primary sides"
            ),
            Self::ConflictingRowOwnership {
                node,
                variable,
                first,
                second,
            } => write!(
                f,
                "node {node}, variable '{variable}': row is overwritten by '{first}' and also targeted by '{second}'"
            ),
            Self::UnsupportedContactModel { constraint, reason } => {
                write!(f, "constraint '{constraint}': unsupported contact model ({reason})")
            }
            Self::UnsupportedMortarSide { constraint, nodes } => write!(
                f,
                "constraint '{constraint}': mortar segments require straight sides, found a side with {nodes} nodes"
            ),
            Self::InvalidInteractionKey { constraint, reason } => {
                write!(f, "constraint '{constraint}': invalid interaction key ({reason})")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Fatal geometric search failures.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SearchError {
    /// No primary candidate could be found for a secondary entity.
    NoCandidate { secondary_node: usize },
    /// A secondary node could not be located in any primary element.
    NodeNotLocated { secondary_node: usize },
}

impl Display for SearchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCandidate { secondary_node } => {
                write!(f, "no primary candidate found for secondary node {secondary_node}")
            }
            Self::NodeNotLocated { secondary_node } => {
                write!(f, "secondary node {secondary_node} is not contained in any primary element")
            }
        }
    }
}

impl std::error::Error for SearchError {}

/// The result of evaluating something that may reject the current iterate.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Outcome<T> {
    Accepted(T),
    /// The iterate is unacceptable and the step should be retried with a smaller size.
    RetryWithSmallerStep { reason: String },
}

impl<T> Outcome<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Accepted(value) => Outcome::Accepted(f(value)),
            Self::RetryWithSmallerStep { reason } => Outcome::RetryWithSmallerStep { reason },
        }
    }

    /// Returns the accepted value.
    ///
    /// # Panics
    ///
    /// Panics if the outcome requests a smaller step.
    pub fn unwrap_accepted(self) -> T {
        match self {
            Self::Accepted(value) => value,
            Self::RetryWithSmallerStep { reason } => panic!("iterate was rejected: {reason}"),
        }
    }
}

/// Errors raised while evaluating a single constraint entity.
#[derive(Debug)]
pub enum EvaluationError {
    /// Recoverable: the current iterate should be rejected.
    RetryWithSmallerStep(String),
    Fatal(eyre::Report),
}

impl From<eyre::Report> for EvaluationError {
    fn from(report: eyre::Report) -> Self {
        Self::Fatal(report)
    }
}

impl From<SearchError> for EvaluationError {
    fn from(error: SearchError) -> Self {
        Self::Fatal(error.into())
    }
}

impl Display for EvaluationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryWithSmallerStep(reason) => write!(f, "iterate rejected: {reason}"),
            Self::Fatal(report) => write!(f, "{report}"),
        }
    }
}

impl std::error::Error for EvaluationError {}

/// Converts an evaluation result at the residual/Jacobian boundary.
///
/// This is the single place where the recoverable channel is turned into an [`Outcome`].
pub fn catch_retry<T>(result: Result<T, EvaluationError>) -> eyre::Result<Outcome<T>> {
    match result {
        Ok(value) => Ok(Outcome::Accepted(value)),
        Err(EvaluationError::RetryWithSmallerStep(reason)) => {
            log::info!("Iterate rejected, requesting a smaller step: {reason}");
            Ok(Outcome::RetryWithSmallerStep { reason })
        }
        Err(EvaluationError::Fatal(report)) => Err(report),
    }
}
