use std::fmt::{Debug, Formatter};

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::model::{BeliefModel, Proposal};
use crate::BeliefError;

pub const MODEL_SCHEMA: &str = include_str!("../schemas/model.schema.json");
pub const PROPOSAL_SCHEMA: &str = include_str!("../schemas/proposal.schema.json");

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DocumentKind {
    Model,
    Proposal,
}

impl DocumentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Proposal => "proposal",
        }
    }
}

/// Compiled structural schemas for models and proposals.
pub struct SchemaGate {
    model: JSONSchema,
    proposal: JSONSchema,
}

impl Debug for SchemaGate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaGate").finish_non_exhaustive()
    }
}

impl SchemaGate {
    /// Compiles the embedded schemas.
    ///
    /// # Errors
    /// Returns [`BeliefError::Configuration`] when an embedded schema fails
    /// to parse or compile.
    pub fn builtin() -> Result<Self, BeliefError> {
        let model = parse_schema(MODEL_SCHEMA, DocumentKind::Model)?;
        let proposal = parse_schema(PROPOSAL_SCHEMA, DocumentKind::Proposal)?;
        Self::from_documents(&model, &proposal)
    }

    /// Compiles caller-supplied schema documents.
    ///
    /// # Errors
    /// Returns [`BeliefError::Configuration`] when either schema fails to
    /// compile.
    pub fn from_documents(model: &Value, proposal: &Value) -> Result<Self, BeliefError> {
        Ok(Self {
            model: compile(model, DocumentKind::Model)?,
            proposal: compile(proposal, DocumentKind::Proposal)?,
        })
    }

    /// Validates a document against the schema for `kind`.
    ///
    /// # Errors
    /// Returns [`BeliefError::SchemaViolation`] for the first violation,
    /// naming its instance path.
    pub fn validate(&self, kind: DocumentKind, document: &Value, label: &str) -> Result<(), BeliefError> {
        let schema = match kind {
            DocumentKind::Model => &self.model,
            DocumentKind::Proposal => &self.proposal,
        };

        let Err(mut errors) = schema.validate(document) else {
            return Ok(());
        };
        let Some(first) = errors.next() else {
            return Ok(());
        };

        let path = first.instance_path.to_string();
        Err(BeliefError::SchemaViolation {
            label: label.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path },
            message: first.to_string(),
        })
    }

    /// Serializes a model and validates it; returns the exact document that
    /// may be persisted.
    ///
    /// # Errors
    /// Returns [`BeliefError::Serialization`] or
    /// [`BeliefError::SchemaViolation`].
    pub fn check_model(&self, model: &BeliefModel, label: &str) -> Result<Value, BeliefError> {
        let document = serde_json::to_value(model)?;
        self.validate(DocumentKind::Model, &document, label)?;
        Ok(document)
    }

    /// Validates a raw proposal document and decodes it.
    ///
    /// # Errors
    /// Returns [`BeliefError::SchemaViolation`] when the document is not a
    /// valid proposal.
    pub fn check_proposal(&self, document: &Value, label: &str) -> Result<Proposal, BeliefError> {
        self.validate(DocumentKind::Proposal, document, label)?;
        serde_json::from_value(document.clone()).map_err(|err| BeliefError::SchemaViolation {
            label: label.to_string(),
            path: "/".to_string(),
            message: err.to_string(),
        })
    }

    /// Validates a raw model document and decodes it.
    ///
    /// # Errors
    /// Returns [`BeliefError::SchemaViolation`] when the document is not a
    /// valid model.
    pub fn check_model_document(&self, document: &Value, label: &str) -> Result<BeliefModel, BeliefError> {
        self.validate(DocumentKind::Model, document, label)?;
        serde_json::from_value(document.clone()).map_err(|err| BeliefError::SchemaViolation {
            label: label.to_string(),
            path: "/".to_string(),
            message: err.to_string(),
        })
    }
}

fn parse_schema(raw: &str, kind: DocumentKind) -> Result<Value, BeliefError> {
    serde_json::from_str(raw).map_err(|err| {
        BeliefError::Configuration(format!("embedded {} schema is not JSON: {err}", kind.as_str()))
    })
}

fn compile(schema: &Value, kind: DocumentKind) -> Result<JSONSchema, BeliefError> {
    JSONSchema::compile(schema).map_err(|err| {
        BeliefError::Configuration(format!("failed to compile {} schema: {err}", kind.as_str()))
    })
}
