//! Command objects wrapping repository operations so callers can queue, log or
//! route them uniformly.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::{Error, Result};
use crate::resources::{QueryParams, Resource, ResourceRepository};

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Resource(Resource),
    Resources(Vec<Resource>),
    Deleted(bool),
    NotFound,
}

#[async_trait]
pub trait ResourceCommand: Send + Sync {
    fn resource_type(&self) -> &str;

    /// Writes are refused outright when remote requests are not admitted.
    fn is_write(&self) -> bool;

    async fn execute(&self, repository: &ResourceRepository) -> Result<CommandOutcome>;

    /// Runs against the local store only. Used for reads while remote calls are
    /// suspended; commands without a local form refuse.
    async fn execute_local(&self, _repository: &ResourceRepository) -> Result<CommandOutcome> {
        Err(Error::Unavailable(format!(
            "{} command needs the remote service",
            self.resource_type()
        )))
    }
}

pub struct CreateCommand {
    pub resource_type: String,
    pub data: Map<String, Value>,
}

impl CreateCommand {
    pub fn new(resource_type: &str, data: Map<String, Value>) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            data,
        }
    }
}

#[async_trait]
impl ResourceCommand for CreateCommand {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn is_write(&self) -> bool {
        true
    }

    async fn execute(&self, repository: &ResourceRepository) -> Result<CommandOutcome> {
        repository
            .add(self.data.clone())
            .await
            .map(CommandOutcome::Resource)
    }
}

#[derive(Debug, Clone)]
pub enum ReadTarget {
    ById(String),
    Query(QueryParams),
}

pub struct ReadCommand {
    pub resource_type: String,
    pub target: ReadTarget,
}

impl ReadCommand {
    pub fn by_id(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            target: ReadTarget::ById(id.to_string()),
        }
    }

    pub fn query(resource_type: &str, params: QueryParams) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            target: ReadTarget::Query(params),
        }
    }
}

#[async_trait]
impl ResourceCommand for ReadCommand {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn is_write(&self) -> bool {
        false
    }

    async fn execute(&self, repository: &ResourceRepository) -> Result<CommandOutcome> {
        match &self.target {
            ReadTarget::ById(id) => Ok(repository
                .get_by_id(id)
                .await?
                .map_or(CommandOutcome::NotFound, CommandOutcome::Resource)),
            ReadTarget::Query(params) => repository
                .query(params)
                .await
                .map(CommandOutcome::Resources),
        }
    }

    async fn execute_local(&self, repository: &ResourceRepository) -> Result<CommandOutcome> {
        match &self.target {
            ReadTarget::ById(id) => Ok(repository
                .get_local(id)
                .await?
                .map_or(CommandOutcome::NotFound, CommandOutcome::Resource)),
            ReadTarget::Query(params) => repository
                .query_local(params)
                .await
                .map(CommandOutcome::Resources),
        }
    }
}

pub struct UpdateCommand {
    pub resource_type: String,
    pub id: String,
    pub data: Map<String, Value>,
}

impl UpdateCommand {
    pub fn new(resource_type: &str, id: &str, data: Map<String, Value>) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            data,
        }
    }
}

#[async_trait]
impl ResourceCommand for UpdateCommand {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn is_write(&self) -> bool {
        true
    }

    async fn execute(&self, repository: &ResourceRepository) -> Result<CommandOutcome> {
        repository
            .update(&self.id, self.data.clone())
            .await
            .map(CommandOutcome::Resource)
    }
}

pub struct DeleteCommand {
    pub resource_type: String,
    pub id: String,
}

impl DeleteCommand {
    pub fn new(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl ResourceCommand for DeleteCommand {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn is_write(&self) -> bool {
        true
    }

    async fn execute(&self, repository: &ResourceRepository) -> Result<CommandOutcome> {
        repository
            .remove(&self.id)
            .await
            .map(CommandOutcome::Deleted)
    }
}
