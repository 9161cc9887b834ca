use std::{
    any::{type_name, Any, TypeId},
    sync::Arc,
};

use crate::{projection::ProjectionEngine, CqrsError, Result};

/// The `Query` trait defines a read request answered by exactly one read model.
///
/// Which read model answers it is declared on the read-model side, with
/// [`ReadModelDefinition::query`](crate::ReadModelDefinition::query).
pub trait Query: Any + Send + Sync {
    type Output: Send + 'static;
}

/// Outcome of a query.
///
/// `Empty` is not a failure: a read model that has not folded the relevant events yet answers
/// with nothing, and callers may poll until it catches up.
#[derive(Debug)]
pub enum QueryResult<T> {
    Found(T),
    Empty,
    Failed(CqrsError),
}

impl<T> QueryResult<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn into_result(self) -> Result<Option<T>> {
        match self {
            Self::Found(value) => Ok(Some(value)),
            Self::Empty => Ok(None),
            Self::Failed(err) => Err(err),
        }
    }
}

impl<T> From<Result<Option<T>>> for QueryResult<T> {
    fn from(result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Self::Found(value),
            Ok(None) => Self::Empty,
            Err(err) => Self::Failed(err),
        }
    }
}

/// Routes queries to the read model answering them.
#[derive(Clone)]
pub struct QueryDispatcher {
    engine: Arc<ProjectionEngine>,
}

impl QueryDispatcher {
    pub fn new(engine: Arc<ProjectionEngine>) -> Self {
        Self { engine }
    }

    /// Answers `query` from the current cache of its read model, materializing it first if
    /// needed.
    pub async fn query<Q: Query>(&self, query: Q) -> QueryResult<Q::Output> {
        let result = self.dispatch(&query).await;
        if let Err(err) = &result {
            tracing::debug!(query = type_name::<Q>(), error = %err, "query failed");
        }
        result.into()
    }

    async fn dispatch<Q: Query>(&self, query: &Q) -> Result<Option<Q::Output>> {
        let runtime = self.engine.runtime_for::<Q>()?;
        let Some(output) = runtime.query(TypeId::of::<Q>(), query).await? else {
            return Ok(None);
        };

        output
            .downcast::<Q::Output>()
            .map(|output| Some(*output))
            .map_err(|_| {
                CqrsError::Configuration(format!(
                    "read model `{}` answered `{}` with another type",
                    runtime.model().name(),
                    type_name::<Q>()
                ))
            })
    }
}
